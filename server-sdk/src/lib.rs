//! The Flagpole server-side SDK.
//!
//! # Overview
//!
//! The SDK revolves around a [`Client`] that is created once per process and shared across
//! request handlers. The client keeps a local copy of your flag configuration synchronized with
//! the Flagpole service (streaming by default, polling as a fallback) and evaluates flags
//! against it locally, so evaluations are fast and never block on the network.
//!
//! ```no_run
//! use flagpole::{Client, Config};
//! use flagpole::User;
//!
//! let client = Client::new("your-sdk-key", Config::default()).unwrap();
//!
//! let user = User::with_key("user@example.com").build();
//! if client.bool_variation("new-dashboard", &user, false) {
//!     // show the new dashboard
//! }
//! ```
//!
//! # Typed evaluations
//!
//! Every flag has a value type chosen when it is created. The typed methods
//! ([`Client::bool_variation`], [`Client::str_variation`], [`Client::float_variation`],
//! [`Client::int_variation`], [`Client::json_variation`]) return the application default when
//! the flag's value doesn't have the requested type, so a misconfigured flag can never panic
//! your request handler. [`Client::variation_detail`] additionally explains every outcome.
//!
//! # Analytics
//!
//! Evaluations are summarized and delivered to the service in the background; [`Client::track`]
//! and [`Client::identify`] record application-defined events. Nothing on the evaluation path
//! blocks on event delivery, and a full event buffer drops events rather than your latency
//! budget.
//!
//! # Logging
//!
//! The SDK logs through the [`log`](https://docs.rs/log) facade under the `flagpole` target.
//! Wire up any `log`-compatible backend to see what the client is doing.

#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]

mod client;
mod config;
mod flags_state;

#[doc(inline)]
pub use flagpole_core::{
    eval::{Detail, Reason},
    AttributeValue, Error, FlagValue, Result, User, UserBuilder,
};

pub use client::Client;
pub use config::Config;
pub use flags_state::{AllFlagsState, FlagState, FlagsStateOptions};

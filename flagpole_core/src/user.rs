use std::collections::HashMap;

use chrono::{TimeZone, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use sha1::Sha1;

use crate::util::f64_to_i64_safe;

const CUSTOM_STARTING_CAPACITY: usize = 10;
const BUCKET_SCALE_INT: i64 = 0x0FFF_FFFF_FFFF_FFFF;
const BUCKET_SCALE: f32 = BUCKET_SCALE_INT as f32;

lazy_static! {
    static ref VERSION_NUMERIC_COMPONENTS_REGEX: Regex =
        Regex::new(r"^\d+(\.\d+)?(\.\d+)?").unwrap();
}

/// A value of a user attribute: a scalar or a list of scalars.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AttributeValue {
    String(String),
    Array(Vec<AttributeValue>),
    Int(i64),
    Float(f64),
    Bool(bool),
    Null,
}

impl From<&str> for AttributeValue {
    fn from(s: &str) -> AttributeValue {
        AttributeValue::String(s.to_owned())
    }
}

impl From<String> for AttributeValue {
    fn from(s: String) -> AttributeValue {
        AttributeValue::String(s)
    }
}

impl From<bool> for AttributeValue {
    fn from(b: bool) -> AttributeValue {
        AttributeValue::Bool(b)
    }
}

impl From<i64> for AttributeValue {
    fn from(i: i64) -> AttributeValue {
        AttributeValue::Int(i)
    }
}

impl From<f64> for AttributeValue {
    fn from(f: f64) -> Self {
        AttributeValue::Float(f)
    }
}

impl<T> From<Vec<T>> for AttributeValue
where
    AttributeValue: From<T>,
{
    fn from(v: Vec<T>) -> AttributeValue {
        AttributeValue::Array(v.into_iter().map(|i| i.into()).collect())
    }
}

impl AttributeValue {
    /// Returns None unless self is a String. It will not convert.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the wrapped value as a float for numeric types, and None otherwise.
    pub fn to_f64(&self) -> Option<f64> {
        match self {
            AttributeValue::Float(f) => Some(*f),
            AttributeValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Attempts to convert any of the following into a UTC datetime:
    ///  * an RFC 3339 / ISO 8601 timestamp (example: "2016-04-16T17:09:12.759-07:00"),
    ///  * Unix epoch milliseconds as a number,
    ///  * Unix epoch milliseconds as a string.
    /// Returns None if no conversion is possible.
    pub fn to_datetime(&self) -> Option<chrono::DateTime<Utc>> {
        match self {
            AttributeValue::Int(millis) => Utc.timestamp_millis_opt(*millis).single(),
            AttributeValue::Float(millis) => {
                f64_to_i64_safe(*millis).and_then(|m| Utc.timestamp_millis_opt(m).single())
            }
            AttributeValue::String(s) => {
                if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
                    Some(dt.with_timezone(&Utc))
                } else if let Ok(millis) = s.parse() {
                    Utc.timestamp_millis_opt(millis).single()
                } else {
                    None
                }
            }
            AttributeValue::Bool(_) | AttributeValue::Array(_) | AttributeValue::Null => None,
        }
    }

    /// Attempts to parse a string attribute into a semver version.
    ///
    /// A strict parse is tried first; if it fails, missing minor/patch components are filled in
    /// with ".0" (so "2" parses as "2.0.0" and "2.1" as "2.1.0").
    pub fn as_semver(&self) -> Option<semver::Version> {
        let version_str = self.as_str()?;
        semver::Version::parse(version_str)
            .ok()
            .or_else(|| AttributeValue::parse_semver_loose(version_str))
    }

    fn parse_semver_loose(version_str: &str) -> Option<semver::Version> {
        let parts = VERSION_NUMERIC_COMPONENTS_REGEX.captures(version_str)?;

        let numeric_parts = parts.get(0).unwrap();
        let mut transformed_version_str = numeric_parts.as_str().to_string();

        for i in 1..parts.len() {
            if parts.get(i).is_none() {
                transformed_version_str.push_str(".0");
            }
        }

        let rest = &version_str[numeric_parts.end()..];
        transformed_version_str.push_str(rest);

        semver::Version::parse(&transformed_version_str).ok()
    }

    /// Applies `p` across the value: to each element if this is an array, to the scalar itself
    /// otherwise. Returns the first value for which `p` holds.
    pub fn find<P>(&self, p: P) -> Option<&AttributeValue>
    where
        P: Fn(&AttributeValue) -> bool,
    {
        match self {
            AttributeValue::Array(values) => values.iter().find(|v| p(v)),
            AttributeValue::Null => None,
            _ => {
                if p(self) {
                    Some(self)
                } else {
                    None
                }
            }
        }
    }

    /// Only strings and integers participate in rollout bucketing; everything else buckets to 0.
    fn as_bucketable(&self) -> Option<String> {
        match self {
            AttributeValue::String(s) => Some(s.clone()),
            AttributeValue::Int(i) => Some(i.to_string()),
            _ => None,
        }
    }
}

/// A description of the end user a flag is being evaluated for.
///
/// A user always has a `key`; the remaining built-in attributes and any number of custom
/// attributes are optional. Users are constructed with [`User::with_key`] or deserialized from
/// the application's own user JSON.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct User {
    #[serde(rename = "key")]
    _key: String,
    #[serde(rename = "secondary", skip_serializing_if = "Option::is_none")]
    _secondary: Option<String>,
    #[serde(rename = "ip", skip_serializing_if = "Option::is_none")]
    _ip: Option<String>,
    #[serde(rename = "country", skip_serializing_if = "Option::is_none")]
    _country: Option<String>,
    #[serde(rename = "email", skip_serializing_if = "Option::is_none")]
    _email: Option<String>,
    #[serde(rename = "firstName", skip_serializing_if = "Option::is_none")]
    _first_name: Option<String>,
    #[serde(rename = "lastName", skip_serializing_if = "Option::is_none")]
    _last_name: Option<String>,
    #[serde(rename = "avatar", skip_serializing_if = "Option::is_none")]
    _avatar: Option<String>,
    #[serde(rename = "name", skip_serializing_if = "Option::is_none")]
    _name: Option<String>,
    #[serde(rename = "anonymous", skip_serializing_if = "Option::is_none")]
    _anonymous: Option<bool>,

    #[serde(
        default,
        deserialize_with = "deserialize_null_default",
        skip_serializing_if = "HashMap::is_empty"
    )]
    custom: HashMap<String, AttributeValue>,

    /// Attribute names this particular user wants scrubbed from analytics events, merged with the
    /// globally-configured private names at event output time.
    #[serde(
        rename = "privateAttributeNames",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    private_attribute_names: Vec<String>,
}

fn deserialize_null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    T: Default + Deserialize<'de>,
    D: Deserializer<'de>,
{
    let opt = Option::deserialize(deserializer)?;
    Ok(opt.unwrap_or_default())
}

impl User {
    /// Start building a user with the given key.
    pub fn with_key(key: impl Into<String>) -> UserBuilder {
        UserBuilder::new(key)
    }

    pub fn key(&self) -> &str {
        &self._key
    }
    pub fn secondary(&self) -> Option<&str> {
        self._secondary.as_deref()
    }
    pub fn ip(&self) -> Option<&str> {
        self._ip.as_deref()
    }
    pub fn country(&self) -> Option<&str> {
        self._country.as_deref()
    }
    pub fn email(&self) -> Option<&str> {
        self._email.as_deref()
    }
    pub fn first_name(&self) -> Option<&str> {
        self._first_name.as_deref()
    }
    pub fn last_name(&self) -> Option<&str> {
        self._last_name.as_deref()
    }
    pub fn avatar(&self) -> Option<&str> {
        self._avatar.as_deref()
    }
    pub fn name(&self) -> Option<&str> {
        self._name.as_deref()
    }
    pub fn anonymous(&self) -> Option<bool> {
        self._anonymous
    }
    pub fn custom(&self) -> &HashMap<String, AttributeValue> {
        &self.custom
    }
    pub fn private_attribute_names(&self) -> &[String] {
        &self.private_attribute_names
    }

    /// Resolve an attribute reference the way clauses do: built-in names map to their fields,
    /// anything else is looked up in the custom map.
    pub fn value_of(&self, attr: &str) -> Option<AttributeValue> {
        match attr {
            "key" => Some(AttributeValue::String(self._key.clone())),
            "secondary" => self._secondary.as_deref().map(AttributeValue::from),
            "ip" => self._ip.as_deref().map(AttributeValue::from),
            "country" => self._country.as_deref().map(AttributeValue::from),
            "email" => self._email.as_deref().map(AttributeValue::from),
            "firstName" => self._first_name.as_deref().map(AttributeValue::from),
            "lastName" => self._last_name.as_deref().map(AttributeValue::from),
            "avatar" => self._avatar.as_deref().map(AttributeValue::from),
            "name" => self._name.as_deref().map(AttributeValue::from),
            "anonymous" => self._anonymous.map(AttributeValue::from),
            _ => self.custom.get(attr).cloned(),
        }
    }

    /// Compute this user's rollout bucket for the given flag (or segment) key and salt.
    ///
    /// The bucket is a deterministic value in [0, 1): SHA-1 of `key.salt.attribute-value`
    /// (with the user's `secondary` key appended when present), first 15 hex digits scaled down.
    /// Users whose bucketing attribute is missing or unbucketable land at 0.0.
    pub fn bucket(&self, bucketing_key: &str, by_attr: Option<&str>, salt: &str) -> f32 {
        let attr_value = match by_attr {
            Some(attr) => self.value_of(attr),
            None => Some(AttributeValue::String(self._key.clone())),
        };
        self.bucket_inner(bucketing_key, attr_value.as_ref(), salt)
            .unwrap_or(0.0)
    }

    fn bucket_inner(
        &self,
        bucketing_key: &str,
        attr_value: Option<&AttributeValue>,
        salt: &str,
    ) -> Option<f32> {
        let mut id = attr_value?.as_bucketable()?;

        if let Some(secondary) = self.secondary() {
            id.push('.');
            id.push_str(secondary);
        }

        let mut hash = Sha1::new();
        hash.update(bucketing_key.as_bytes());
        hash.update(b".");
        hash.update(salt.as_bytes());
        hash.update(b".");
        hash.update(id.as_bytes());
        let hexhash = hash.digest().to_string();

        let hexhash_15 = &hexhash[..15]; // 15 chars, not 16: the scale below has 15 F's
        let numhash = i64::from_str_radix(hexhash_15, 16).unwrap();

        Some(numhash as f32 / BUCKET_SCALE)
    }
}

/// Fluent constructor for [`User`].
pub struct UserBuilder {
    key: String,
    secondary: Option<String>,
    ip: Option<String>,
    country: Option<String>,
    email: Option<String>,
    first_name: Option<String>,
    last_name: Option<String>,
    avatar: Option<String>,
    name: Option<String>,
    anonymous: Option<bool>,
    custom: HashMap<String, AttributeValue>,
    private_attribute_names: Vec<String>,
}

impl UserBuilder {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            secondary: None,
            ip: None,
            country: None,
            email: None,
            first_name: None,
            last_name: None,
            avatar: None,
            name: None,
            anonymous: None,
            custom: HashMap::with_capacity(CUSTOM_STARTING_CAPACITY),
            private_attribute_names: Vec::new(),
        }
    }

    pub fn secondary(mut self, secondary: impl Into<String>) -> Self {
        self.secondary = Some(secondary.into());
        self
    }
    pub fn ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self
    }
    pub fn country(mut self, country: impl Into<String>) -> Self {
        self.country = Some(country.into());
        self
    }
    pub fn email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }
    pub fn first_name(mut self, first_name: impl Into<String>) -> Self {
        self.first_name = Some(first_name.into());
        self
    }
    pub fn last_name(mut self, last_name: impl Into<String>) -> Self {
        self.last_name = Some(last_name.into());
        self
    }
    pub fn avatar(mut self, avatar: impl Into<String>) -> Self {
        self.avatar = Some(avatar.into());
        self
    }
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
    pub fn anonymous(mut self, anonymous: bool) -> Self {
        self.anonymous = Some(anonymous);
        self
    }
    pub fn custom(mut self, custom: HashMap<String, AttributeValue>) -> Self {
        self.custom.extend(custom);
        self
    }
    /// Mark attributes as private for this user only; they still participate in evaluation but
    /// are scrubbed from analytics events.
    pub fn private_attribute_names(mut self, names: Vec<String>) -> Self {
        self.private_attribute_names = names;
        self
    }

    pub fn build(self) -> User {
        User {
            _key: self.key,
            _secondary: self.secondary,
            _ip: self.ip,
            _country: self.country,
            _email: self.email,
            _first_name: self.first_name,
            _last_name: self.last_name,
            _avatar: self.avatar,
            _name: self.name,
            _anonymous: self.anonymous,
            custom: self.custom,
            private_attribute_names: self.private_attribute_names,
        }
    }
}

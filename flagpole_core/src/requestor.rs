//! Single-shot HTTP fetches of flag data, used by the polling data source and one-shot lookups.

use std::collections::HashMap;

use log::debug;
use reqwest::{header, StatusCode};
use serde::de::DeserializeOwned;

use crate::store::AllData;
use crate::{Error, Flag, Result, Segment};

const LATEST_ALL_PATH: &str = "/sdk/latest-all";
const LATEST_FLAGS_PATH: &str = "/sdk/latest-flags";
const LATEST_SEGMENTS_PATH: &str = "/sdk/latest-segments";

/// A stateless GET wrapper with per-URL ETag caching.
///
/// The `reqwest::Client` handed in holds the connection pool and the credential headers, so it is
/// shared with the other subsystems; the requestor only adds conditional-request handling. On a
/// 304 the previously cached body is served back, so callers always get a full dataset.
pub struct Requestor {
    // Client holds a connection pool internally, so we're reusing the client between requests.
    http: reqwest::Client,
    base_uri: String,
    etag_cache: HashMap<String, (String, Vec<u8>)>,
}

impl Requestor {
    pub fn new(http: reqwest::Client, base_uri: impl AsRef<str>) -> Requestor {
        Requestor {
            http,
            base_uri: crate::util::strip_trailing_slash(base_uri.as_ref()),
            etag_cache: HashMap::new(),
        }
    }

    /// Fetch the full flag/segment snapshot.
    pub async fn get_all(&mut self) -> Result<AllData> {
        self.get_json(LATEST_ALL_PATH.to_owned()).await
    }

    /// Fetch a single flag.
    pub async fn get_flag(&mut self, key: &str) -> Result<Flag> {
        self.get_json(format!("{}/{}", LATEST_FLAGS_PATH, key)).await
    }

    /// Fetch a single segment.
    pub async fn get_segment(&mut self, key: &str) -> Result<Segment> {
        self.get_json(format!("{}/{}", LATEST_SEGMENTS_PATH, key))
            .await
    }

    async fn get_json<T: DeserializeOwned>(&mut self, path: String) -> Result<T> {
        let url = format!("{}{}", self.base_uri, path);

        let mut request = self.http.get(&url);
        if let Some((etag, _)) = self.etag_cache.get(&url) {
            request = request.header(header::IF_NONE_MATCH, etag);
        }

        let response = request.send().await?;
        let status = response.status();

        if status == StatusCode::NOT_MODIFIED {
            debug!(target: "flagpole", "{} not modified, serving cached body", url);
            let (_, body) = self
                .etag_cache
                .get(&url)
                .ok_or_else(|| Error::MalformedResponse("304 without a cached body".to_owned()))?;
            return parse_body(body);
        }

        if !status.is_success() {
            return Err(Error::for_status(status.as_u16()));
        }

        let etag = response
            .headers()
            .get(header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);

        let body = response.bytes().await?;
        let parsed = parse_body(&body)?;

        match etag {
            Some(etag) => {
                debug!(target: "flagpole", "caching response for {} under etag {}", url, etag);
                self.etag_cache.insert(url, (etag, body.to_vec()));
            }
            None => {
                self.etag_cache.remove(&url);
            }
        }

        Ok(parsed)
    }
}

fn parse_body<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    serde_json::from_slice(body).map_err(|e| Error::MalformedResponse(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_body_parses_into_all_data() {
        let body = br#"{
            "flags": {
                "f": {
                    "key": "f", "version": 2, "on": true,
                    "fallthrough": {"variation": 0}, "offVariation": 0,
                    "variations": [true, false], "salt": "s"
                }
            },
            "segments": {
                "s": {"key": "s", "version": 1, "included": [], "excluded": [], "rules": [], "salt": "s"}
            }
        }"#;
        let all: AllData = parse_body(body).unwrap();
        assert_eq!(all.flags.len(), 1);
        assert_eq!(all.segments.len(), 1);
        assert_eq!(all.flags["f"].version, 2);
    }

    #[test]
    fn snapshot_tolerates_missing_sections() {
        let all: AllData = parse_body(br#"{"flags": {}}"#).unwrap();
        assert!(all.flags.is_empty());
        assert!(all.segments.is_empty());
    }

    #[test]
    fn garbage_body_is_a_malformed_response() {
        let result: Result<AllData> = parse_body(b"not json");
        assert!(matches!(result, Err(Error::MalformedResponse(_))));
    }
}

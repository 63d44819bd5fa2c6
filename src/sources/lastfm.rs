//! Last.fm adapter: `artist.getinfo` / `track.getinfo` by MusicBrainz id.
//!
//! Rate limited to 5 requests per second per Last.fm API guidelines.

use super::{throttle, RawRecord, SourceAdapter, SourceError};
use crate::signal_store::{EntityKind, Platform};
use anyhow::Result;
use chrono::Utc;
use reqwest::blocking::Client;
use serde_json::Value;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const LASTFM_API_BASE: &str = "https://ws.audioscrobbler.com/2.0/";
const RATE_LIMIT_INTERVAL: Duration = Duration::from_millis(200); // 5 req/sec

pub struct LastFmAdapter {
    client: Client,
    api_key: String,
    api_base: String,
    last_request: Mutex<Instant>,
}

impl LastFmAdapter {
    pub fn new(api_key: &str) -> Result<Self> {
        Self::with_base_url(api_key, LASTFM_API_BASE)
    }

    pub fn with_base_url(api_key: &str, api_base: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            api_key: api_key.to_string(),
            api_base: api_base.to_string(),
            last_request: Mutex::new(Instant::now() - RATE_LIMIT_INTERVAL),
        })
    }
}

/// Maps a Last.fm API error code onto the source error taxonomy.
///
/// 6: invalid parameters (unknown mbid), 8: operation failed, 11: service
/// offline, 16: temporary error, 29: rate limit exceeded.
fn classify_error_code(code: i64, message: &str) -> SourceError {
    let message = format!("error {}: {}", code, message);
    match code {
        8 | 11 | 16 | 29 => SourceError::transient(Platform::LastFm, message),
        _ => SourceError::permanent(Platform::LastFm, message),
    }
}

/// Extracts the entity object from a getinfo response body.
fn parse_body(kind: EntityKind, body: Value) -> Result<Option<Value>, SourceError> {
    if let Some(code) = body.get("error").and_then(Value::as_i64) {
        let message = body
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        return Err(classify_error_code(code, message));
    }

    let key = match kind {
        EntityKind::Artist => "artist",
        EntityKind::Track => "track",
    };
    Ok(match body {
        Value::Object(mut map) => map.remove(key),
        _ => None,
    })
}

impl SourceAdapter for LastFmAdapter {
    fn platform(&self) -> Platform {
        Platform::LastFm
    }

    fn fetch(&self, kind: EntityKind, platform_id: &str) -> Result<Option<RawRecord>, SourceError> {
        throttle(&self.last_request, RATE_LIMIT_INTERVAL);

        let method = match kind {
            EntityKind::Artist => "artist.getinfo",
            EntityKind::Track => "track.getinfo",
        };
        let url = format!(
            "{}?method={}&mbid={}&api_key={}&format=json",
            self.api_base,
            method,
            urlencoding::encode(platform_id),
            self.api_key
        );

        let response = self
            .client
            .get(&url)
            .send()
            .map_err(|e| SourceError::from_reqwest(Platform::LastFm, e))?;
        let status = response.status();

        // Last.fm reports most failures as a JSON error body, sometimes with a
        // 4xx status, so the body is inspected before the status.
        let body: Value = match response.json() {
            Ok(body) => body,
            Err(_) if !status.is_success() => {
                return Err(SourceError::from_status(Platform::LastFm, status))
            }
            Err(e) => return Err(SourceError::from_reqwest(Platform::LastFm, e)),
        };
        let payload = parse_body(kind, body)?;
        if !status.is_success() {
            return Err(SourceError::from_status(Platform::LastFm, status));
        }

        Ok(payload.map(|payload| RawRecord {
            platform: Platform::LastFm,
            kind,
            platform_id: platform_id.to_string(),
            fetched_at: Utc::now(),
            payload,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_error_codes() {
        assert!(!classify_error_code(6, "Artist not found").is_transient());
        for code in [8, 11, 16, 29] {
            assert!(classify_error_code(code, "x").is_transient());
        }
        assert!(!classify_error_code(10, "Invalid API key").is_transient());
    }

    #[test]
    fn test_parse_body_extracts_entity() {
        let body = json!({"artist": {"name": "Burial", "stats": {"listeners": "100"}}});
        let payload = parse_body(EntityKind::Artist, body).unwrap().unwrap();
        assert_eq!(payload["stats"]["listeners"], "100");

        let body = json!({"track": {"listeners": "5"}});
        assert!(parse_body(EntityKind::Artist, body).unwrap().is_none());
    }

    #[test]
    fn test_parse_body_error() {
        let body = json!({"error": 6, "message": "The artist you supplied could not be found"});
        let err = parse_body(EntityKind::Artist, body).unwrap_err();
        assert!(!err.is_transient());
        assert!(err.to_string().contains("could not be found"));
    }
}

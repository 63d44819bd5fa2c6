//! Spotify Web API adapter (client-credentials flow).

use super::{throttle, RawRecord, SourceAdapter, SourceError};
use crate::signal_store::{EntityKind, Platform};
use anyhow::Result;
use chrono::Utc;
use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde::Deserialize;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

const SPOTIFY_API_BASE: &str = "https://api.spotify.com/v1";
const SPOTIFY_TOKEN_URL: &str = "https://accounts.spotify.com/api/token";
const RATE_LIMIT_INTERVAL: Duration = Duration::from_millis(100);
/// Tokens are refreshed this long before Spotify says they expire.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

pub struct SpotifyAdapter {
    client: Client,
    client_id: String,
    client_secret: String,
    api_base: String,
    token_url: String,
    token: Mutex<Option<CachedToken>>,
    last_request: Mutex<Instant>,
}

impl SpotifyAdapter {
    pub fn new(client_id: &str, client_secret: &str) -> Result<Self> {
        Self::with_endpoints(client_id, client_secret, SPOTIFY_API_BASE, SPOTIFY_TOKEN_URL)
    }

    pub fn with_endpoints(
        client_id: &str,
        client_secret: &str,
        api_base: &str,
        token_url: &str,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            api_base: api_base.trim_end_matches('/').to_string(),
            token_url: token_url.to_string(),
            token: Mutex::new(None),
            last_request: Mutex::new(Instant::now() - RATE_LIMIT_INTERVAL),
        })
    }

    fn access_token(&self) -> Result<String, SourceError> {
        let mut token = self.token.lock().unwrap();
        if let Some(cached) = token.as_ref() {
            if Instant::now() < cached.expires_at {
                return Ok(cached.value.clone());
            }
        }

        debug!("Requesting new Spotify access token");
        throttle(&self.last_request, RATE_LIMIT_INTERVAL);
        let response = self
            .client
            .post(&self.token_url)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .map_err(|e| SourceError::from_reqwest(Platform::Spotify, e))?;

        let status = response.status();
        if !status.is_success() {
            // Bad credentials will not fix themselves.
            return Err(match status {
                StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED => SourceError::permanent(
                    Platform::Spotify,
                    format!("token request rejected: HTTP {}", status),
                ),
                _ => SourceError::from_status(Platform::Spotify, status),
            });
        }

        let body: TokenResponse = response
            .json()
            .map_err(|e| SourceError::from_reqwest(Platform::Spotify, e))?;
        let lifetime = Duration::from_secs(body.expires_in).saturating_sub(TOKEN_EXPIRY_MARGIN);
        *token = Some(CachedToken {
            value: body.access_token.clone(),
            expires_at: Instant::now() + lifetime,
        });
        Ok(body.access_token)
    }

    fn endpoint(kind: EntityKind) -> &'static str {
        match kind {
            EntityKind::Artist => "artists",
            EntityKind::Track => "tracks",
        }
    }
}

impl SourceAdapter for SpotifyAdapter {
    fn platform(&self) -> Platform {
        Platform::Spotify
    }

    fn fetch(&self, kind: EntityKind, platform_id: &str) -> Result<Option<RawRecord>, SourceError> {
        let token = self.access_token()?;
        throttle(&self.last_request, RATE_LIMIT_INTERVAL);

        let url = format!(
            "{}/{}/{}",
            self.api_base,
            Self::endpoint(kind),
            urlencoding::encode(platform_id)
        );
        let response = self
            .client
            .get(&url)
            .bearer_auth(token)
            .send()
            .map_err(|e| SourceError::from_reqwest(Platform::Spotify, e))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            // Token revoked or expired early; fetch a fresh one next time.
            self.token.lock().unwrap().take();
            return Err(SourceError::transient(
                Platform::Spotify,
                "access token rejected",
            ));
        }
        if !status.is_success() {
            return Err(SourceError::from_status(Platform::Spotify, status));
        }

        let payload: serde_json::Value = response
            .json()
            .map_err(|e| SourceError::from_reqwest(Platform::Spotify, e))?;

        Ok(Some(RawRecord {
            platform: Platform::Spotify,
            kind,
            platform_id: platform_id.to_string(),
            fetched_at: Utc::now(),
            payload,
        }))
    }
}

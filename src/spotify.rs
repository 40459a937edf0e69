use std::time::{Duration, Instant};

use anyhow::{Context as _, anyhow};
use async_trait::async_trait;
use log::{debug, info};
use reqwest::{Client, StatusCode};
use serde_derive::Deserialize;
use tokio::sync::Mutex;

use crate::config::{self, SpotifyConfig};
use crate::dispatcher::NowPlayingSource;
use crate::messages::{CoverImageRef, NowPlayingInfo};

const TOKEN_URL: &str = "https://accounts.spotify.com/api/token";
const CURRENTLY_PLAYING_URL: &str = "https://api.spotify.com/v1/me/player/currently-playing";

/// Refresh this long before Spotify says the token expires.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct CurrentlyPlaying {
    progress_ms: Option<u64>,
    item: Option<Track>,
}

#[derive(Debug, Deserialize)]
struct Track {
    name: Option<String>,
    #[serde(default)]
    artists: Vec<Artist>,
    album: Album,
}

#[derive(Debug, Deserialize)]
struct Album {
    name: String,
    #[serde(default)]
    artists: Vec<Artist>,
    #[serde(default)]
    images: Vec<Image>,
}

#[derive(Debug, Deserialize)]
struct Artist {
    name: String,
}

#[derive(Debug, Deserialize)]
struct Image {
    url: String,
    width: Option<u32>,
    height: Option<u32>,
}

struct AccessToken {
    value: String,
    expires_at: Instant,
}

/// Spotify Web API client authorised through a long-lived refresh token.
pub struct SpotifyClient {
    client: Client,
    client_id: String,
    client_secret: String,
    refresh_token: String,
    token: Mutex<Option<AccessToken>>,
}

impl SpotifyClient {
    /// Builds the client and performs one token refresh so bad credentials fail at startup.
    pub async fn connect(config: &SpotifyConfig) -> anyhow::Result<Self> {
        let client_id = config::secret(&config.client_id, "SPOTIFY_CLIENT_ID")
            .ok_or_else(|| anyhow!("spotify client_id is not set"))?;
        let client_secret = config::secret(&config.client_secret, "SPOTIFY_CLIENT_SECRET")
            .ok_or_else(|| anyhow!("spotify client_secret is not set"))?;
        let refresh_token = config::secret(&config.refresh_token, "SPOTIFY_REFRESH_TOKEN")
            .ok_or_else(|| anyhow!("spotify refresh_token is not set"))?;

        let spotify = SpotifyClient {
            client: Client::builder().timeout(Duration::from_secs(30)).build()?,
            client_id,
            client_secret,
            refresh_token,
            token: Mutex::new(None),
        };
        spotify.access_token().await?;
        info!("Authorised with Spotify");
        Ok(spotify)
    }

    async fn access_token(&self) -> anyhow::Result<String> {
        let mut token = self.token.lock().await;
        if let Some(current) = token.as_ref() {
            if current.expires_at > Instant::now() {
                return Ok(current.value.clone());
            }
        }

        debug!("Refreshing Spotify access token");
        let response: TokenResponse = self
            .client
            .post(TOKEN_URL)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", self.refresh_token.as_str()),
            ])
            .send()
            .await?
            .error_for_status()
            .context("spotify token refresh rejected")?
            .json()
            .await?;

        let lifetime = Duration::from_secs(response.expires_in).saturating_sub(TOKEN_EXPIRY_MARGIN);
        *token = Some(AccessToken {
            value: response.access_token.clone(),
            expires_at: Instant::now() + lifetime,
        });
        Ok(response.access_token)
    }
}

#[async_trait]
impl NowPlayingSource for SpotifyClient {
    async fn currently_playing(&self) -> anyhow::Result<Option<NowPlayingInfo>> {
        let token = self.access_token().await?;
        let response = self
            .client
            .get(CURRENTLY_PLAYING_URL)
            .bearer_auth(token)
            .send()
            .await?
            .error_for_status()
            .context("spotify currently-playing request rejected")?;

        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let playing: CurrentlyPlaying = response.json().await?;
        Ok(playing.into_now_playing())
    }
}

impl CurrentlyPlaying {
    fn into_now_playing(self) -> Option<NowPlayingInfo> {
        let track = self.item?;
        Some(NowPlayingInfo {
            track_name: track.name,
            artists: track.artists.into_iter().map(|a| a.name).collect(),
            album_name: track.album.name,
            album_artists: track.album.artists.into_iter().map(|a| a.name).collect(),
            progress_ms: self.progress_ms.unwrap_or_default(),
            images: track
                .album
                .images
                .into_iter()
                .map(|img| CoverImageRef {
                    url: img.url,
                    width: img.width,
                    height: img.height,
                })
                .collect(),
        })
    }
}

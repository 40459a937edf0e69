use std::time::Duration;

use anyhow::{Context as _, anyhow};
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;
use hmac::{Hmac, Mac};
use log::{debug, info};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use rand::Rng as _;
use rand::distributions::Alphanumeric;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Method, RequestBuilder};
use serde_derive::Deserialize;
use serde_json::{Value, json};
use sha1::Sha1;

use crate::config::{self, TwitterConfig};
use crate::dispatcher::Publisher;
use crate::messages::Post;

const VERIFY_URL: &str = "https://api.twitter.com/2/users/me";
const TWEET_URL: &str = "https://api.twitter.com/2/tweets";
const MEDIA_UPLOAD_URL: &str = "https://upload.twitter.com/1.1/media/upload.json";
const MEDIA_METADATA_URL: &str = "https://upload.twitter.com/1.1/media/metadata/create.json";

/// RFC 3986 unreserved characters pass through; everything else is escaped.
const OAUTH_ENCODE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

#[derive(Debug, Deserialize)]
struct MediaUploadResponse {
    media_id_string: String,
}

#[derive(Debug, Deserialize)]
struct UserResponse {
    data: User,
}

#[derive(Debug, Deserialize)]
struct User {
    username: String,
}

/// OAuth 1.0a user-context credentials.
#[derive(Clone)]
struct Credentials {
    consumer_key: String,
    consumer_secret: String,
    access_token: String,
    access_token_secret: String,
}

impl Credentials {
    fn from_config(config: &TwitterConfig) -> anyhow::Result<Self> {
        let required = |value: &Option<String>, var: &str| {
            config::secret(value, var).ok_or_else(|| anyhow!("{var} is not set"))
        };
        Ok(Credentials {
            consumer_key: required(&config.consumer_key, "TWITTER_CONSUMER_KEY")?,
            consumer_secret: required(&config.consumer_secret, "TWITTER_CONSUMER_SECRET")?,
            access_token: required(&config.access_token, "TWITTER_ACCESS_TOKEN")?,
            access_token_secret: required(
                &config.access_token_secret,
                "TWITTER_ACCESS_TOKEN_SECRET",
            )?,
        })
    }

    fn authorization(&self, method: &Method, url: &str) -> anyhow::Result<String> {
        let timestamp = Utc::now().timestamp().to_string();
        self.authorization_with(method, url, &[], &nonce(), &timestamp)
    }

    /// Builds the `Authorization: OAuth ...` header value.
    ///
    /// `params` are the query or form parameters that take part in the
    /// signature; JSON and multipart bodies never do.
    fn authorization_with(
        &self,
        method: &Method,
        url: &str,
        params: &[(&str, &str)],
        nonce: &str,
        timestamp: &str,
    ) -> anyhow::Result<String> {
        let oauth = [
            ("oauth_consumer_key", self.consumer_key.as_str()),
            ("oauth_nonce", nonce),
            ("oauth_signature_method", "HMAC-SHA1"),
            ("oauth_timestamp", timestamp),
            ("oauth_token", self.access_token.as_str()),
            ("oauth_version", "1.0"),
        ];
        let mut signed: Vec<(&str, &str)> = oauth.to_vec();
        signed.extend_from_slice(params);
        let signature = self.signature(method, url, &signed)?;

        let mut fields: Vec<String> = oauth
            .iter()
            .map(|(k, v)| format!("{}=\"{}\"", encode(k), encode(v)))
            .collect();
        fields.push(format!("oauth_signature=\"{}\"", encode(&signature)));
        fields.sort();
        Ok(format!("OAuth {}", fields.join(", ")))
    }

    fn signature(
        &self,
        method: &Method,
        url: &str,
        params: &[(&str, &str)],
    ) -> anyhow::Result<String> {
        let mut encoded: Vec<(String, String)> =
            params.iter().map(|(k, v)| (encode(k), encode(v))).collect();
        encoded.sort();
        let parameter_string = encoded
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        let base = format!(
            "{}&{}&{}",
            method.as_str(),
            encode(url),
            encode(&parameter_string)
        );
        let key = format!(
            "{}&{}",
            encode(&self.consumer_secret),
            encode(&self.access_token_secret)
        );

        let mut mac = <Hmac<Sha1> as Mac>::new_from_slice(key.as_bytes())
            .map_err(|_| anyhow!("invalid OAuth signing key"))?;
        mac.update(base.as_bytes());
        Ok(STANDARD.encode(mac.finalize().into_bytes()))
    }
}

fn encode(value: &str) -> String {
    utf8_percent_encode(value, OAUTH_ENCODE).to_string()
}

fn nonce() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}

fn tweet_body(text: &str, media_id: &str) -> Value {
    json!({ "text": text, "media": { "media_ids": [media_id] } })
}

fn metadata_body(media_id: &str, alt_text: &str) -> Value {
    json!({ "media_id": media_id, "alt_text": { "text": alt_text } })
}

/// Tweets the post with the cover attached: v1.1 media upload, alt text via
/// media metadata, then a v2 tweet referencing the media id.
pub struct TwitterPublisher {
    client: Client,
    credentials: Credentials,
}

impl TwitterPublisher {
    /// Verifies the credentials immediately so bad keys fail at startup.
    pub async fn connect(config: &TwitterConfig) -> anyhow::Result<Self> {
        let credentials = Credentials::from_config(config)?;
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        let publisher = TwitterPublisher {
            client,
            credentials,
        };

        let me: UserResponse = publisher
            .signed(Method::GET, VERIFY_URL)?
            .send()
            .await?
            .error_for_status()
            .context("twitter credentials rejected")?
            .json()
            .await?;
        info!("Logged into Twitter as: @{}", me.data.username);
        Ok(publisher)
    }

    fn signed(&self, method: Method, url: &str) -> anyhow::Result<RequestBuilder> {
        let authorization = self.credentials.authorization(&method, url)?;
        Ok(self
            .client
            .request(method, url)
            .header(reqwest::header::AUTHORIZATION, authorization))
    }

    async fn upload_media(&self, post: &Post) -> anyhow::Result<String> {
        let image = &post.image;
        let part = Part::stream_with_length(image.bytes.clone(), image.bytes.len() as u64)
            .file_name("cover.png")
            .mime_str(image.mime)?;
        let response: MediaUploadResponse = self
            .signed(Method::POST, MEDIA_UPLOAD_URL)?
            .multipart(Form::new().part("media", part))
            .send()
            .await?
            .error_for_status()
            .context("twitter media upload rejected")?
            .json()
            .await?;
        debug!("Uploaded cover as media {}", response.media_id_string);
        Ok(response.media_id_string)
    }

    async fn set_alt_text(&self, media_id: &str, alt_text: &str) -> anyhow::Result<()> {
        self.signed(Method::POST, MEDIA_METADATA_URL)?
            .json(&metadata_body(media_id, alt_text))
            .send()
            .await?
            .error_for_status()
            .context("twitter media metadata rejected")?;
        Ok(())
    }
}

#[async_trait]
impl Publisher for TwitterPublisher {
    fn name(&self) -> &str {
        "Twitter"
    }

    async fn publish(&self, post: &Post) -> anyhow::Result<()> {
        let media_id = self.upload_media(post).await?;
        self.set_alt_text(&media_id, &post.alt_text).await?;
        self.signed(Method::POST, TWEET_URL)?
            .json(&tweet_body(&post.text, &media_id))
            .send()
            .await?
            .error_for_status()
            .context("tweet rejected")?;
        Ok(())
    }
}

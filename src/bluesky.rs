use std::time::{Duration, Instant};

use anyhow::{Context as _, anyhow};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use log::{debug, info};
use reqwest::Client;
use serde_derive::Deserialize;
use serde_json::{Value, json};
use tokio::sync::Mutex;

use crate::config::{self, BlueskyConfig};
use crate::dispatcher::Publisher;
use crate::messages::Post;

const DEFAULT_SERVICE: &str = "https://bsky.social";

/// Access JWTs live for roughly two hours; log in again well before that.
const SESSION_LIFETIME: Duration = Duration::from_secs(90 * 60);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionResponse {
    access_jwt: String,
    did: String,
    handle: String,
}

#[derive(Debug, Deserialize)]
struct UploadBlobResponse {
    blob: Value,
}

struct Session {
    access_jwt: String,
    did: String,
    created_at: Instant,
}

/// Posts to Bluesky through the AT Protocol XRPC endpoints.
pub struct BlueskyPublisher {
    client: Client,
    service: String,
    handle: String,
    password: String,
    session: Mutex<Session>,
}

impl BlueskyPublisher {
    /// Logs in immediately so bad credentials fail at startup.
    pub async fn login(config: &BlueskyConfig) -> anyhow::Result<Self> {
        let handle = config::secret(&config.handle, "BLUESKY_HANDLE")
            .ok_or_else(|| anyhow!("bluesky handle is not set"))?;
        let password = config::secret(&config.password, "BLUESKY_PASSWORD")
            .ok_or_else(|| anyhow!("bluesky password is not set"))?;
        let service = config
            .service
            .as_deref()
            .unwrap_or(DEFAULT_SERVICE)
            .trim_end_matches('/')
            .to_string();
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;

        let session = create_session(&client, &service, &handle, &password).await?;
        Ok(BlueskyPublisher {
            client,
            service,
            handle,
            password,
            session: Mutex::new(session),
        })
    }

    fn xrpc(&self, method: &str) -> String {
        format!("{}/xrpc/{}", self.service, method)
    }

    async fn upload_blob(&self, jwt: &str, post: &Post) -> anyhow::Result<Value> {
        let response: UploadBlobResponse = self
            .client
            .post(self.xrpc("com.atproto.repo.uploadBlob"))
            .bearer_auth(jwt)
            .header(reqwest::header::CONTENT_TYPE, post.image.mime)
            .body(blob_body(post))
            .send()
            .await?
            .error_for_status()
            .context("bluesky blob upload rejected")?
            .json()
            .await?;
        Ok(response.blob)
    }
}

async fn create_session(
    client: &Client,
    service: &str,
    handle: &str,
    password: &str,
) -> anyhow::Result<Session> {
    let response: SessionResponse = client
        .post(format!("{service}/xrpc/com.atproto.server.createSession"))
        .json(&json!({ "identifier": handle, "password": password }))
        .send()
        .await?
        .error_for_status()
        .context("bluesky login rejected")?
        .json()
        .await?;
    info!("Logged into Bluesky as: {}", response.handle);
    Ok(Session {
        access_jwt: response.access_jwt,
        did: response.did,
        created_at: Instant::now(),
    })
}

/// The upload body shares the cover's buffer instead of copying it.
fn blob_body(post: &Post) -> Bytes {
    post.image.bytes.clone()
}

fn post_record(did: &str, post: &Post, blob: Value, created_at: DateTime<Utc>) -> Value {
    json!({
        "repo": did,
        "collection": "app.bsky.feed.post",
        "record": {
            "$type": "app.bsky.feed.post",
            "text": post.text,
            "createdAt": created_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            "embed": {
                "$type": "app.bsky.embed.images",
                "images": [{ "alt": post.alt_text, "image": blob }],
            },
        },
    })
}

#[async_trait]
impl Publisher for BlueskyPublisher {
    fn name(&self) -> &str {
        "Bluesky"
    }

    async fn publish(&self, post: &Post) -> anyhow::Result<()> {
        let (jwt, did) = {
            let mut session = self.session.lock().await;
            if session.created_at.elapsed() > SESSION_LIFETIME {
                debug!("Renewing Bluesky session");
                *session =
                    create_session(&self.client, &self.service, &self.handle, &self.password)
                        .await?;
            }
            (session.access_jwt.clone(), session.did.clone())
        };

        let blob = self.upload_blob(&jwt, post).await?;
        self.client
            .post(self.xrpc("com.atproto.repo.createRecord"))
            .bearer_auth(&jwt)
            .json(&post_record(&did, post, blob, Utc::now()))
            .send()
            .await?
            .error_for_status()
            .context("bluesky post rejected")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::TimeZone as _;

    use super::*;
    use crate::messages::CoverImage;

    #[test]
    fn test_post_record_embeds_image_with_alt_text() {
        let post = Post {
            text: "Currently playing: 'Xtal' by Aphex Twin (02:05)".to_string(),
            alt_text: "Album cover for 'SAW 85-92' by Aphex Twin.".to_string(),
            image: Arc::new(CoverImage {
                bytes: Bytes::from_static(&[0xFF, 0xD8, 0xFF]),
                mime: "image/jpeg",
            }),
        };
        let blob = json!({
            "$type": "blob",
            "ref": { "$link": "bafk" },
            "mimeType": "image/jpeg",
            "size": 3,
        });
        let created_at = Utc.with_ymd_and_hms(2025, 4, 6, 13, 23, 39).unwrap();

        let record = post_record("did:plc:abc", &post, blob.clone(), created_at);
        assert_eq!(record["repo"], "did:plc:abc");
        assert_eq!(record["record"]["text"], post.text.as_str());
        assert_eq!(record["record"]["createdAt"], "2025-04-06T13:23:39.000Z");
        let image = &record["record"]["embed"]["images"][0];
        assert_eq!(image["alt"], post.alt_text.as_str());
        assert_eq!(image["image"], blob);
    }

    #[test]
    fn test_blob_body_shares_cover_buffer() {
        let post = Post {
            text: String::new(),
            alt_text: String::new(),
            image: Arc::new(CoverImage {
                bytes: Bytes::from(vec![0x89, b'P', b'N', b'G']),
                mime: "image/png",
            }),
        };
        let body = blob_body(&post);
        assert_eq!(body, post.image.bytes);
        assert_eq!(body.as_ptr(), post.image.bytes.as_ptr());
    }
}

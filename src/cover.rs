use std::io::Cursor;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use bytes::Bytes;
use image::{GenericImageView as _, ImageFormat};
use log::debug;
use reqwest::Client;

use crate::dispatcher::CoverFetcher;
use crate::messages::CoverImage;

pub struct HttpCoverFetcher {
    client: Client,
}

impl HttpCoverFetcher {
    pub fn new() -> anyhow::Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(HttpCoverFetcher { client })
    }
}

#[async_trait]
impl CoverFetcher for HttpCoverFetcher {
    async fn fetch(&self, url: &str) -> anyhow::Result<CoverImage> {
        debug!("Downloading cover {}", url);
        let bytes = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()
            .with_context(|| format!("downloading {url}"))?
            .bytes()
            .await?;
        to_png(&bytes)
    }
}

/// Decodes whatever the image host served and re-encodes it as PNG.
pub fn to_png(raw: &[u8]) -> anyhow::Result<CoverImage> {
    let decoded = image::load_from_memory(raw)
        .with_context(|| format!("decoding cover image ({} bytes)", raw.len()))?;
    let mut png = Vec::new();
    decoded
        .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
        .context("encoding cover as PNG")?;
    let (width, height) = decoded.dimensions();
    debug!("Re-encoded {width}x{height} cover, {} -> {} bytes", raw.len(), png.len());
    Ok(CoverImage {
        bytes: Bytes::from(png),
        mime: "image/png",
    })
}

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;

/// Marker byte sent by the sensor node for every detected approach.
pub const FIRE: u8 = 0x01;

/// Byte written back by the listener once a fire marker has been read.
pub const ACK: u8 = 0x06;

/// The only event the trigger channel carries. No identity or sequence number.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TriggerEvent {
    Fire,
}

impl TriggerEvent {
    pub fn as_byte(self) -> u8 {
        match self {
            TriggerEvent::Fire => FIRE,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            FIRE => Some(TriggerEvent::Fire),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ProximitySample {
    pub distance: f64,
    pub taken_at: Instant,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CoverImageRef {
    pub url: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

/// Snapshot of what the music service reports as playing, fetched fresh per trigger.
#[derive(Clone, Debug, PartialEq)]
pub struct NowPlayingInfo {
    pub track_name: Option<String>,
    pub artists: Vec<String>,
    pub album_name: String,
    pub album_artists: Vec<String>,
    pub progress_ms: u64,
    pub images: Vec<CoverImageRef>,
}

/// Cover art in its canonical encoding. Clones share the same buffer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CoverImage {
    pub bytes: Bytes,
    pub mime: &'static str,
}

/// Formatted post handed to every publisher. The cover is shared, never re-fetched.
#[derive(Clone, Debug)]
pub struct Post {
    pub text: String,
    pub alt_text: String,
    pub image: Arc<CoverImage>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PublishResult {
    Success,
    Failure(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublisherOutcome {
    pub publisher: String,
    pub result: PublishResult,
}

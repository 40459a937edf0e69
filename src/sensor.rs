use std::path::PathBuf;

use anyhow::Context as _;
use async_trait::async_trait;
use log::debug;

#[async_trait]
pub trait DistanceSensor: Send {
    /// Returns the current distance in the sensor's configured unit.
    async fn measure(&mut self) -> anyhow::Result<f64>;
}

#[async_trait]
pub trait Indicator: Send {
    async fn set(&mut self, on: bool) -> std::io::Result<()>;
}

/// Ultrasonic ranger exposed through the Linux IIO subsystem (e.g. the `srf04` driver).
pub struct IioDistanceSensor {
    path: PathBuf,
    scale: f64,
}

impl IioDistanceSensor {
    pub fn new(path: impl Into<PathBuf>, scale: f64) -> Self {
        IioDistanceSensor {
            path: path.into(),
            scale,
        }
    }
}

#[async_trait]
impl DistanceSensor for IioDistanceSensor {
    async fn measure(&mut self) -> anyhow::Result<f64> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading {}", self.path.display()))?;
        parse_raw(&raw, self.scale)
    }
}

fn parse_raw(raw: &str, scale: f64) -> anyhow::Result<f64> {
    let value: f64 = raw
        .trim()
        .parse()
        .with_context(|| format!("invalid distance reading {:?}", raw.trim()))?;
    Ok(value * scale)
}

/// LED driven through its sysfs `brightness` file.
pub struct SysfsLed {
    path: PathBuf,
}

impl SysfsLed {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        SysfsLed { path: path.into() }
    }
}

#[async_trait]
impl Indicator for SysfsLed {
    async fn set(&mut self, on: bool) -> std::io::Result<()> {
        debug!("Setting {} to {}", self.path.display(), on);
        tokio::fs::write(&self.path, if on { "1" } else { "0" }).await
    }
}

#[async_trait]
impl<T: Indicator + ?Sized> Indicator for Box<T> {
    async fn set(&mut self, on: bool) -> std::io::Result<()> {
        (**self).set(on).await
    }
}

pub struct NoIndicator;

#[async_trait]
impl Indicator for NoIndicator {
    async fn set(&mut self, _on: bool) -> std::io::Result<()> {
        Ok(())
    }
}

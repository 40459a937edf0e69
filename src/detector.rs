use std::time::Instant;

use log::{debug, warn};

use crate::messages::{ProximitySample, TriggerEvent};
use crate::sensor::DistanceSensor;

/// Rising-edge detector over a proximity sensor.
///
/// Emits one [`TriggerEvent`] per transition from "far" to "near". There is no
/// hysteresis: every crossing into the near zone fires again.
pub struct EdgeDetector<S> {
    sensor: S,
    threshold: f64,
    triggered: bool,
}

impl<S: DistanceSensor> EdgeDetector<S> {
    pub fn new(sensor: S, threshold: f64) -> Self {
        EdgeDetector {
            sensor,
            threshold,
            triggered: false,
        }
    }

    /// Takes one sample and advances the edge state.
    pub async fn poll(&mut self) -> Option<TriggerEvent> {
        let sample = match self.sensor.measure().await {
            Ok(distance) => Some(ProximitySample {
                distance,
                taken_at: Instant::now(),
            }),
            Err(err) => {
                warn!("Distance read failed: {:#}", err);
                None
            }
        };
        self.observe(sample.as_ref())
    }

    /// A missing sample counts as "not near".
    pub fn observe(&mut self, sample: Option<&ProximitySample>) -> Option<TriggerEvent> {
        let near = sample.is_some_and(|s| {
            debug!("Distance: {:.3} ({:?} ago)", s.distance, s.taken_at.elapsed());
            s.distance.is_finite() && s.distance >= 0.0 && s.distance <= self.threshold
        });
        let rising = near && !self.triggered;
        self.triggered = near;
        rising.then_some(TriggerEvent::Fire)
    }
}

//! Hourly consumption derived from successive total-volume readings.
//!
//! Policy: hour-aligned anchor. The first sample of each UTC clock hour
//! becomes the anchor and reports 0; later samples in that hour report the
//! volume consumed since the anchor. A sample below the anchor (meter reset
//! or rollover) reports nothing rather than a negative rate.

use crate::utils::{hour_start, round_to};
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq)]
struct Anchor {
    hour: DateTime<Utc>,
    volume: f64,
}

#[derive(Debug, Clone, Default)]
pub struct RateTracker {
    anchor: Option<Anchor>,
}

impl RateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the latest total volume (litres) observed at `now`.
    pub fn update(&mut self, now: DateTime<Utc>, latest_volume: Option<f64>) -> Option<f64> {
        let volume = latest_volume?;
        let hour = hour_start(now);

        match self.anchor {
            Some(anchor) if anchor.hour == hour => {
                let delta = volume - anchor.volume;
                (delta >= 0.0).then(|| round_to(delta, 3))
            }
            _ => {
                self.anchor = Some(Anchor { hour, volume });
                Some(0.0)
            }
        }
    }
}

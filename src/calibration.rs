//! Calibration store and raw-to-amps conversion.
//!
//! The device reports three origin points per (channel, granularity):
//! the ADC code at zero load, at the reference load and at full scale.
//! From these,
//!
//! ```text
//! counts_per_amp = (scale - reference) / I_ref
//! current_amps   = (raw - zero) / counts_per_amp
//! ```
//!
//! A triad with `scale <= reference` has no usable slope and is rejected, so
//! every accepted triad maps raw codes to amps monotonically and never yields
//! NaN or infinity.

use crate::error::{PowerMonitorError, Result};
use crate::types::{Channel, Granularity, Origin};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const CHANNELS: usize = Channel::ALL.len();
const GRANULARITIES: usize = Granularity::ALL.len();
const ORIGINS: usize = Origin::ALL.len();

/// The three origin values of one (channel, granularity) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Triad {
    /// ADC code at zero load.
    pub zero: i32,
    /// ADC code at the reference load.
    pub reference: i32,
    /// ADC code at full scale.
    pub scale: i32,
}

impl Triad {
    /// Build a triad from its three origin values.
    #[must_use]
    pub fn new(zero: i32, reference: i32, scale: i32) -> Self {
        Self {
            zero,
            reference,
            scale,
        }
    }

    /// ADC counts per amp for a given reference current, or `None` when the
    /// triad (or the reference current) cannot define a positive slope.
    #[must_use]
    pub fn counts_per_amp(&self, reference_amps: f64) -> Option<f64> {
        let span = i64::from(self.scale) - i64::from(self.reference);
        if span <= 0 || !reference_amps.is_finite() || reference_amps <= 0.0 {
            return None;
        }
        Some(span as f64 / reference_amps)
    }

    /// Convert a raw ADC code to amps.
    ///
    /// Returns [`PowerMonitorError::CalibrationIncomplete`] for a degenerate
    /// triad; `channel` and `granularity` only label the error.
    pub fn current_amps(
        &self,
        raw: i32,
        reference_amps: f64,
        channel: Channel,
        granularity: Granularity,
    ) -> Result<f64> {
        let counts_per_amp = self.counts_per_amp(reference_amps).ok_or_else(|| {
            PowerMonitorError::incomplete(
                channel,
                granularity,
                format!(
                    "degenerate triad (zero={}, reference={}, scale={}, I_ref={} A)",
                    self.zero, self.reference, self.scale, reference_amps
                ),
            )
        })?;
        let offset = i64::from(raw) - i64::from(self.zero);
        Ok(offset as f64 / counts_per_amp)
    }
}

/// Every origin value, indexed by (channel, granularity, origin).
///
/// Slots that were never reported are `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CalibrationSet {
    values: [[[Option<i32>; ORIGINS]; GRANULARITIES]; CHANNELS],
}

impl CalibrationSet {
    /// An empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A set where every (channel, granularity) pair uses the same triad.
    #[must_use]
    pub fn uniform(triad: Triad) -> Self {
        let mut set = Self::new();
        for channel in Channel::ALL {
            for granularity in Granularity::ALL {
                set.set_triad(channel, granularity, triad);
            }
        }
        set
    }

    /// Set one origin value.
    pub fn set(&mut self, channel: Channel, granularity: Granularity, origin: Origin, value: i32) {
        self.values[channel.index()][granularity.index()][origin.index()] = Some(value);
    }

    /// Set all three origin values of one pair.
    pub fn set_triad(&mut self, channel: Channel, granularity: Granularity, triad: Triad) {
        self.set(channel, granularity, Origin::Zero, triad.zero);
        self.set(channel, granularity, Origin::Reference, triad.reference);
        self.set(channel, granularity, Origin::Scale, triad.scale);
    }

    /// One origin value, if reported.
    #[must_use]
    pub fn value(&self, channel: Channel, granularity: Granularity, origin: Origin) -> Option<i32> {
        self.values[channel.index()][granularity.index()][origin.index()]
    }

    /// The full triad of a pair, if all three origins were reported.
    #[must_use]
    pub fn triad(&self, channel: Channel, granularity: Granularity) -> Option<Triad> {
        let [zero, reference, scale] = self.values[channel.index()][granularity.index()];
        Some(Triad {
            zero: zero?,
            reference: reference?,
            scale: scale?,
        })
    }

    /// Slots that were never reported, in wire-code order.
    #[must_use]
    pub fn missing(&self) -> Vec<(Channel, Granularity, Origin)> {
        let mut missing = Vec::new();
        for channel in Channel::ALL {
            for granularity in Granularity::ALL {
                for origin in Origin::ALL {
                    if self.value(channel, granularity, origin).is_none() {
                        missing.push((channel, granularity, origin));
                    }
                }
            }
        }
        missing
    }

    /// Whether every slot has been reported.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.values.iter().flatten().flatten().all(Option::is_some)
    }
}

/// Shared calibration store.
///
/// Cloning yields another handle to the same store. The sampling task reads
/// it once per sample, so an update made from any thread applies from the
/// next sample onward; a whole triad is always read under one lock.
#[derive(Debug, Clone, Default)]
pub struct CalibrationStore {
    inner: Arc<RwLock<CalibrationSet>>,
}

impl CalibrationStore {
    /// An empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A store pre-populated with `set`.
    #[must_use]
    pub fn with_set(set: CalibrationSet) -> Self {
        Self {
            inner: Arc::new(RwLock::new(set)),
        }
    }

    /// Overwrite one origin value.
    pub fn update(&self, channel: Channel, granularity: Granularity, origin: Origin, value: i32) {
        self.inner.write().set(channel, granularity, origin, value);
    }

    /// Overwrite a whole triad.
    pub fn update_triad(&self, channel: Channel, granularity: Granularity, triad: Triad) {
        self.inner.write().set_triad(channel, granularity, triad);
    }

    /// The triad of a pair, or [`PowerMonitorError::CalibrationIncomplete`]
    /// naming the first missing origin.
    pub fn get(&self, channel: Channel, granularity: Granularity) -> Result<Triad> {
        let set = self.inner.read();
        if let Some(triad) = set.triad(channel, granularity) {
            return Ok(triad);
        }
        let missing: Vec<String> = Origin::ALL
            .iter()
            .filter(|origin| set.value(channel, granularity, **origin).is_none())
            .map(ToString::to_string)
            .collect();
        Err(PowerMonitorError::incomplete(
            channel,
            granularity,
            format!("{} not set", missing.join(", ")),
        ))
    }

    pub(crate) fn triad(&self, channel: Channel, granularity: Granularity) -> Option<Triad> {
        self.inner.read().triad(channel, granularity)
    }

    /// Whether every slot has been reported.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.inner.read().is_complete()
    }

    /// Slots that were never reported.
    #[must_use]
    pub fn missing(&self) -> Vec<(Channel, Granularity, Origin)> {
        self.inner.read().missing()
    }

    /// Forget every value.
    pub fn clear(&self) {
        *self.inner.write() = CalibrationSet::new();
    }

    /// Copy of the current values.
    #[must_use]
    pub fn snapshot(&self) -> CalibrationSet {
        *self.inner.read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_half_scale_to_half_reference() {
        let triad = Triad::new(0, 1000, 2000);
        let amps = triad
            .current_amps(500, 1.0, Channel::Main, Granularity::Coarse)
            .unwrap();
        assert!((amps - 0.5).abs() < 1e-12);
    }

    #[test]
    fn flat_triad_is_incomplete() {
        let triad = Triad::new(100, 100, 100);
        let err = triad
            .current_amps(150, 1.0, Channel::Main, Granularity::Fine)
            .unwrap_err();
        assert!(matches!(
            err,
            PowerMonitorError::CalibrationIncomplete {
                channel: Channel::Main,
                granularity: Granularity::Fine,
                ..
            }
        ));
    }

    #[test]
    fn inverted_triad_and_bad_reference_are_rejected() {
        assert!(Triad::new(0, 2000, 1000).counts_per_amp(1.0).is_none());
        assert!(Triad::new(0, 1000, 2000).counts_per_amp(0.0).is_none());
        assert!(Triad::new(0, 1000, 2000).counts_per_amp(f64::NAN).is_none());
    }

    #[test]
    fn conversion_is_monotonic_and_finite() {
        let triads = [
            Triad::new(0, 1000, 2000),
            Triad::new(-500, 10, 11),
            Triad::new(i32::MAX, i32::MIN, i32::MAX),
            Triad::new(7, -32768, 32767),
        ];
        let raws = [i32::MIN, -40000, -1, 0, 1, 499, 500, 32767, i32::MAX];
        for triad in triads {
            let mut previous = f64::NEG_INFINITY;
            for raw in raws {
                let amps = triad
                    .current_amps(raw, 0.03, Channel::Aux, Granularity::Fine)
                    .unwrap();
                assert!(amps.is_finite());
                assert!(amps > previous, "{triad:?} not monotonic at raw={raw}");
                previous = amps;
            }
        }
    }

    #[test]
    fn store_reports_missing_origins() {
        let store = CalibrationStore::new();
        store.update(Channel::Usb, Granularity::Coarse, Origin::Zero, 3);
        let err = store.get(Channel::Usb, Granularity::Coarse).unwrap_err();
        assert!(err.to_string().contains("reference, scale not set"));
        assert_eq!(store.missing().len(), 17);
        assert!(!store.is_complete());
    }

    #[test]
    fn updates_supersede_previous_values() {
        let store = CalibrationStore::with_set(CalibrationSet::uniform(Triad::new(0, 1000, 2000)));
        assert!(store.is_complete());

        store.update(Channel::Main, Granularity::Fine, Origin::Zero, 50);
        let triad = store.get(Channel::Main, Granularity::Fine).unwrap();
        assert_eq!(triad, Triad::new(50, 1000, 2000));
        // Other pairs keep their own values.
        assert_eq!(
            store.get(Channel::Main, Granularity::Coarse).unwrap(),
            Triad::new(0, 1000, 2000)
        );
    }

    #[test]
    fn clones_share_one_store() {
        let store = CalibrationStore::new();
        let other = store.clone();
        other.update_triad(Channel::Aux, Granularity::Coarse, Triad::new(1, 2, 3));
        assert_eq!(
            store.get(Channel::Aux, Granularity::Coarse).unwrap(),
            Triad::new(1, 2, 3)
        );

        store.clear();
        assert_eq!(other.snapshot(), CalibrationSet::new());
    }
}

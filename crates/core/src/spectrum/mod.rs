use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};

use crate::{BridgeError, Result};

/// Immutable per-frame result of the audio analysis.
///
/// The maximum amplitude is computed once on construction, so it can never
/// drift from the bins it summarises.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawSnapshot", into = "RawSnapshot")]
pub struct SpectrumSnapshot {
    bins: Vec<f32>,
    max_amplitude: f32,
    /// Width of a single bin in Hz.
    frequency_resolution: f32,
}

impl SpectrumSnapshot {
    /// Builds a snapshot whose bins are one Hz apart.
    pub fn new(bins: Vec<f32>) -> Self {
        Self::with_resolution(bins, 1.0)
    }

    /// Negative and non-finite amplitudes are stored as zero.
    pub fn with_resolution(mut bins: Vec<f32>, frequency_resolution: f32) -> Self {
        for bin in &mut bins {
            if !bin.is_finite() || *bin < 0.0 {
                *bin = 0.0;
            }
        }
        let max_amplitude = bins.iter().copied().fold(0.0_f32, f32::max);
        Self {
            bins,
            max_amplitude,
            frequency_resolution,
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn bins(&self) -> &[f32] {
        &self.bins
    }

    pub fn len(&self) -> usize {
        self.bins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bins.is_empty()
    }

    pub fn max_amplitude(&self) -> f32 {
        self.max_amplitude
    }

    pub fn frequency_resolution(&self) -> f32 {
        self.frequency_resolution
    }

    pub fn bin(&self, index: usize) -> Result<f32> {
        self.bins
            .get(index)
            .copied()
            .ok_or(BridgeError::OutOfRange {
                index: i64::try_from(index).unwrap_or(i64::MAX),
                len: self.bins.len(),
            })
    }

    /// Frequency of the highest bin.
    pub fn max_frequency(&self) -> f32 {
        self.bin_frequency(self.bins.len().saturating_sub(1))
    }

    /// Amplitude at `frequency`, linearly interpolated between neighbouring bins.
    pub fn frequency_amplitude(&self, frequency: f32) -> Option<f32> {
        if !frequency.is_finite() || frequency < 0.0 || self.frequency_resolution <= 0.0 {
            return None;
        }
        let precise = frequency / self.frequency_resolution;
        let lower = precise as usize;
        let low = *self.bins.get(lower)?;
        if precise == lower as f32 {
            return Some(low);
        }
        let high = *self.bins.get(lower + 1)?;
        Some(low + (precise - lower as f32) * (high - low))
    }

    /// Mean amplitude over `[lower, upper]` Hz, using the trapezoidal area
    /// under the bin curve.
    pub fn average_amplitude(&self, lower: f32, upper: f32) -> Option<f32> {
        if lower > upper {
            return None;
        }
        if lower == upper {
            return self.frequency_amplitude(lower);
        }
        Some(self.area_under_curve(lower, upper)? / (upper - lower))
    }

    fn area_under_curve(&self, lower: f32, upper: f32) -> Option<f32> {
        // Both ends must lie inside the spectrum before they are turned into indices.
        let low_amplitude = self.frequency_amplitude(lower)?;
        let upper_amplitude = self.frequency_amplitude(upper)?;
        let low_known = ((lower / self.frequency_resolution) as usize).checked_add(1)?;
        let upper_known = (upper / self.frequency_resolution) as usize;

        if low_known > upper_known {
            return Some((low_amplitude + upper_amplitude) / 2.0 * (upper - lower));
        }

        let lower_partial = (low_amplitude + self.bins.get(low_known)?) / 2.0
            * (self.bin_frequency(low_known) - lower);
        let upper_partial = (upper_amplitude + self.bins.get(upper_known)?) / 2.0
            * (upper - self.bin_frequency(upper_known));
        let inner: f32 = self
            .bins
            .get(low_known..=upper_known)?
            .windows(2)
            .map(|pair| (pair[0] + pair[1]) / 2.0 * self.frequency_resolution)
            .sum();

        Some(inner + lower_partial + upper_partial)
    }

    fn bin_frequency(&self, index: usize) -> f32 {
        index as f32 * self.frequency_resolution
    }
}

impl Default for SpectrumSnapshot {
    fn default() -> Self {
        Self::empty()
    }
}

#[derive(Serialize, Deserialize)]
struct RawSnapshot {
    bins: Vec<f32>,
    #[serde(default = "unit_resolution")]
    frequency_resolution: f32,
}

fn unit_resolution() -> f32 {
    1.0
}

impl From<RawSnapshot> for SpectrumSnapshot {
    fn from(raw: RawSnapshot) -> Self {
        Self::with_resolution(raw.bins, raw.frequency_resolution)
    }
}

impl From<SpectrumSnapshot> for RawSnapshot {
    fn from(snapshot: SpectrumSnapshot) -> Self {
        Self {
            bins: snapshot.bins,
            frequency_resolution: snapshot.frequency_resolution,
        }
    }
}

/// Process-wide "current snapshot" cell.
///
/// Publishing swaps in a fresh `Arc`; holders of an older `Arc` keep seeing
/// the snapshot they were given.
#[derive(Clone)]
pub struct SpectrumSlot {
    current: Arc<RwLock<Arc<SpectrumSnapshot>>>,
}

impl SpectrumSlot {
    pub fn new() -> Self {
        tracing::debug!("initialising spectrum slot");
        Self {
            current: Arc::new(RwLock::new(Arc::new(SpectrumSnapshot::empty()))),
        }
    }

    /// Replaces the current snapshot and returns the shared handle to it.
    pub fn publish(&self, snapshot: SpectrumSnapshot) -> Result<Arc<SpectrumSnapshot>> {
        let snapshot = Arc::new(snapshot);
        let mut slot = self.write()?;
        *slot = snapshot.clone();
        Ok(snapshot)
    }

    pub fn current(&self) -> Result<Arc<SpectrumSnapshot>> {
        Ok(self.read()?.clone())
    }

    /// Drops the published snapshot, leaving an empty one behind.
    pub fn teardown(&self) -> Result<()> {
        tracing::debug!("tearing down spectrum slot");
        let mut slot = self.write()?;
        *slot = Arc::new(SpectrumSnapshot::empty());
        Ok(())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Arc<SpectrumSnapshot>>> {
        self.current
            .read()
            .map_err(|_| BridgeError::msg("spectrum slot has been poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Arc<SpectrumSnapshot>>> {
        self.current
            .write()
            .map_err(|_| BridgeError::msg("spectrum slot has been poisoned"))
    }
}

impl Default for SpectrumSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SpectrumSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpectrumSlot").finish()
    }
}

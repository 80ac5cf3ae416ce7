use std::{f32::consts::PI, fmt, sync::Arc};

use realfft::{num_complex::Complex32, RealFftPlanner, RealToComplex};

use crate::{BridgeError, Result, SpectrumSnapshot};

/// Turns blocks of mono samples into [`SpectrumSnapshot`]s.
///
/// This is the reference producer used by the app driver and tests; a real
/// host plugs its own capture pipeline in front of the scheduler instead.
pub struct SpectrumAnalyzer {
    sample_rate: u32,
    fft_planner: RealFftPlanner<f32>,
    fft: Option<FftResources>,
    processed_blocks: u64,
}

impl SpectrumAnalyzer {
    /// Creates a new analyzer using the default 48 kHz sample rate.
    pub fn new() -> Self {
        Self::with_sample_rate(48_000)
    }

    pub fn with_sample_rate(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            fft_planner: RealFftPlanner::new(),
            fft: None,
            processed_blocks: 0,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn processed_blocks(&self) -> u64 {
        self.processed_blocks
    }

    /// Windows and transforms `samples`, returning one magnitude per bin.
    pub fn process_block(&mut self, samples: &[f32]) -> Result<SpectrumSnapshot> {
        if samples.len() < 2 {
            return Err(BridgeError::msg(
                "spectrum analysis requires blocks with at least two samples",
            ));
        }

        let len = samples.len();
        let resolution = self.sample_rate as f32 / len as f32;
        let fft = self.prepare_fft(len);

        for (index, value) in samples.iter().enumerate() {
            fft.input[index] = *value * hann_value(index, len);
        }

        fft.plan
            .process_with_scratch(&mut fft.input, &mut fft.spectrum, &mut fft.scratch)?;

        let scale = 2.0 / len as f32;
        let bins = fft.spectrum.iter().map(|bin| bin.norm() * scale).collect();

        self.processed_blocks += 1;
        Ok(SpectrumSnapshot::with_resolution(bins, resolution))
    }

    fn prepare_fft(&mut self, size: usize) -> &mut FftResources {
        let stale = self
            .fft
            .as_ref()
            .map(|fft| fft.size != size)
            .unwrap_or(false);
        if stale {
            self.fft = None;
        }

        let planner = &mut self.fft_planner;
        self.fft
            .get_or_insert_with(|| FftResources::plan(planner, size))
    }
}

impl Default for SpectrumAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

struct FftResources {
    size: usize,
    plan: Arc<dyn RealToComplex<f32>>,
    scratch: Vec<Complex32>,
    spectrum: Vec<Complex32>,
    input: Vec<f32>,
}

impl FftResources {
    fn plan(planner: &mut RealFftPlanner<f32>, size: usize) -> Self {
        let plan = planner.plan_fft_forward(size);
        Self {
            size,
            scratch: plan.make_scratch_vec(),
            spectrum: plan.make_output_vec(),
            input: plan.make_input_vec(),
            plan,
        }
    }
}

impl fmt::Debug for SpectrumAnalyzer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpectrumAnalyzer")
            .field("sample_rate", &self.sample_rate)
            .field("fft_size", &self.fft.as_ref().map(|fft| fft.size))
            .field("processed_blocks", &self.processed_blocks)
            .finish()
    }
}

fn hann_value(index: usize, len: usize) -> f32 {
    if len <= 1 {
        return 1.0;
    }

    0.5 - 0.5 * ((2.0 * PI * index as f32) / (len as f32 - 1.0)).cos()
}

/// Generates `len` samples of a sine tone starting at sample `offset`.
pub fn sine_block(frequency: f32, sample_rate: u32, offset: usize, len: usize) -> Vec<f32> {
    let sample_rate = sample_rate.max(1) as f32;
    (offset..offset + len)
        .map(|n| (2.0 * PI * frequency * n as f32 / sample_rate).sin())
        .collect()
}

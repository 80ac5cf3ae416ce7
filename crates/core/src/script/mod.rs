//! The per-frame entry point a lighting effect exposes to the host.

mod engine;

use std::time::{Duration, Instant};

use crate::{ColorBufferView, Result, ScriptReturn, SnapshotView};

pub use engine::RhaiScript;

/// Everything a script sees during one frame.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub frame: u64,
    pub colors: ColorBufferView,
    pub spectrum: SnapshotView,
    pub started: Instant,
    pub budget: Duration,
}

impl Invocation {
    pub fn deadline(&self) -> Instant {
        self.started + self.budget
    }

    pub fn is_past_deadline(&self) -> bool {
        Instant::now() >= self.deadline()
    }
}

/// A script body the scheduler can drive once per frame.
pub trait FrameScript {
    fn invoke(&mut self, invocation: &Invocation) -> Result<ScriptReturn>;
}

impl<F> FrameScript for F
where
    F: FnMut(&Invocation) -> Result<ScriptReturn>,
{
    fn invoke(&mut self, invocation: &Invocation) -> Result<ScriptReturn> {
        self(invocation)
    }
}

/// Smoke-test hook exposed to scripts as `rusty(n)`.
pub fn rusty(value: i64) -> Option<i64> {
    value.checked_mul(2)
}

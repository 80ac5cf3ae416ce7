//! Bridge between an audio-reactive LED host and user-written effect scripts.
//!
//! Once per frame the host publishes a [`SpectrumSnapshot`], lends its
//! [`ColorBuffer`] to a [`FrameScript`] through the marshaling layer and
//! takes the buffer back after re-validating every channel. The
//! [`FrameScheduler`] owns that cycle, enforces the per-frame time budget and
//! falls back to the previous contents whenever a script misbehaves.

pub mod analysis;
pub mod color;
pub mod config;
pub mod error;
pub mod marshal;
pub mod scheduler;
pub mod script;
pub mod spectrum;

pub use analysis::{sine_block, SpectrumAnalyzer};
pub use color::{add_clamped, Channel, ChannelBounds, Color, ColorBuffer};
pub use config::{
    BridgeConfig, BufferConfig, DiagnosticsConfig, FrameConfig, ScriptConfig, SizePolicy,
};
pub use error::{BridgeError, Result};
pub use marshal::{
    commit, BufferLease, ColorBufferView, CommitReport, PixelRef, ScriptReturn, SnapshotView,
};
pub use scheduler::{
    FrameDiagnostic, FrameOutcome, FramePhase, FrameReport, FrameScheduler, FrameStats,
};
pub use script::{rusty, FrameScript, Invocation, RhaiScript};
pub use spectrum::{SpectrumSlot, SpectrumSnapshot};

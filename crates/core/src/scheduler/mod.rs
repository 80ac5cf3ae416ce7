//! Once-per-frame orchestration of snapshot publication, script invocation
//! and buffer hand-back.
//!
//! A frame walks `Idle -> SnapshotPublished -> ScriptRunning` and ends in
//! `Committed`, `Faulted` or `TimedOut` before returning to `Idle`. Only a
//! committed frame changes the caller's buffer; every other outcome restores
//! the contents it had before the call.

use std::{
    any::Any,
    collections::VecDeque,
    mem,
    panic::{self, AssertUnwindSafe},
    time::{Duration, Instant},
};

use crate::{
    marshal::commit, BridgeConfig, BridgeError, BufferLease, ColorBuffer, CommitReport,
    FrameScript, Invocation, Result, ScriptReturn, SnapshotView, SpectrumSlot, SpectrumSnapshot,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramePhase {
    Idle,
    SnapshotPublished,
    ScriptRunning,
    Committed,
    Faulted,
    TimedOut,
}

/// How a frame ended.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameOutcome {
    Committed(CommitReport),
    Faulted { reason: String },
    TimedOut { elapsed: Duration, budget: Duration },
}

impl FrameOutcome {
    pub fn phase(&self) -> FramePhase {
        match self {
            Self::Committed(_) => FramePhase::Committed,
            Self::Faulted { .. } => FramePhase::Faulted,
            Self::TimedOut { .. } => FramePhase::TimedOut,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Committed(_) => "committed",
            Self::Faulted { .. } => "script_fault",
            Self::TimedOut { .. } => "budget_exceeded",
        }
    }

    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Committed(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FrameReport {
    pub frame: u64,
    pub outcome: FrameOutcome,
    pub elapsed: Duration,
    pub buffer_len: usize,
}

/// Host-visible record of a frame that did not go as planned.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameDiagnostic {
    pub frame: u64,
    pub kind: &'static str,
    pub elapsed: Duration,
    pub message: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub committed: u64,
    pub faulted: u64,
    pub timed_out: u64,
    pub clamped_channels: u64,
    /// Frames whose script kept running past budget plus grace.
    pub grace_overruns: u64,
}

pub struct FrameScheduler<S> {
    script: S,
    config: BridgeConfig,
    spectrum: SpectrumSlot,
    phase: FramePhase,
    next_frame: u64,
    diagnostics: VecDeque<FrameDiagnostic>,
    stats: FrameStats,
}

impl<S: FrameScript> FrameScheduler<S> {
    pub fn new(script: S, config: BridgeConfig) -> Self {
        Self::with_slot(script, config, SpectrumSlot::new())
    }

    /// Uses an existing slot, e.g. one shared with a monitoring thread.
    pub fn with_slot(script: S, config: BridgeConfig, spectrum: SpectrumSlot) -> Self {
        tracing::info!(
            budget_ms = config.frame.budget_ms,
            policy = ?config.buffer.size_policy,
            "frame scheduler ready"
        );
        Self {
            script,
            config,
            spectrum,
            phase: FramePhase::Idle,
            next_frame: 0,
            diagnostics: VecDeque::new(),
            stats: FrameStats::default(),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn script(&self) -> &S {
        &self.script
    }

    pub fn script_mut(&mut self) -> &mut S {
        &mut self.script
    }

    pub fn spectrum_slot(&self) -> &SpectrumSlot {
        &self.spectrum
    }

    pub fn phase(&self) -> FramePhase {
        self.phase
    }

    pub fn stats(&self) -> FrameStats {
        self.stats
    }

    pub fn diagnostics(&self) -> impl Iterator<Item = &FrameDiagnostic> {
        self.diagnostics.iter()
    }

    /// Runs one frame. `buffer` is only changed when the frame commits.
    pub fn run_frame(&mut self, snapshot: SpectrumSnapshot, buffer: &mut ColorBuffer) -> FrameReport {
        let frame = self.next_frame;
        self.next_frame += 1;
        let frame_started = Instant::now();

        let published = match self.spectrum.publish(snapshot) {
            Ok(published) => published,
            Err(err) => {
                let outcome = FrameOutcome::Faulted {
                    reason: err.to_string(),
                };
                return self.finish(frame, frame_started.elapsed(), outcome, buffer.len());
            }
        };
        self.phase = FramePhase::SnapshotPublished;

        let budget = self.config.frame.budget();
        let backup = buffer.clone();
        let mut lent = mem::take(buffer);
        let rebound = lent.rebind(self.config.channels);
        let lease = BufferLease::lend(lent);
        let original_len = lease.original_len();
        let invocation = Invocation {
            frame,
            colors: lease.view(),
            spectrum: SnapshotView::new(published),
            started: Instant::now(),
            budget,
        };

        self.phase = FramePhase::ScriptRunning;
        let script = &mut self.script;
        let result = panic::catch_unwind(AssertUnwindSafe(|| script.invoke(&invocation)))
            .unwrap_or_else(|payload| Err(BridgeError::ScriptFault(panic_message(payload))));
        let elapsed = invocation.started.elapsed();
        drop(invocation);

        let outcome = match self.resolve(result, lease, original_len, elapsed) {
            Ok((committed, mut report)) => {
                report.clamped_channels += rebound;
                *buffer = committed;
                FrameOutcome::Committed(report)
            }
            Err(outcome) => {
                *buffer = backup;
                outcome
            }
        };

        self.finish(frame, elapsed, outcome, buffer.len())
    }

    fn resolve(
        &self,
        result: Result<ScriptReturn>,
        lease: BufferLease,
        original_len: usize,
        elapsed: Duration,
    ) -> std::result::Result<(ColorBuffer, CommitReport), FrameOutcome> {
        let budget = self.config.frame.budget();
        let mut native = lease.reclaim().map_err(|err| FrameOutcome::Faulted {
            reason: err.to_string(),
        })?;

        let returned = match result {
            Err(BridgeError::BudgetExceeded { elapsed, budget }) => {
                return Err(FrameOutcome::TimedOut { elapsed, budget })
            }
            Err(err) => {
                return Err(FrameOutcome::Faulted {
                    reason: err.to_string(),
                })
            }
            // The runtime could not be preempted; its late result is dropped.
            Ok(_) if elapsed > budget => return Err(FrameOutcome::TimedOut { elapsed, budget }),
            Ok(returned) => returned,
        };

        let policy = self.config.buffer.size_policy;
        commit(&mut native, original_len, returned, policy)
            .map(|report| (native, report))
            .map_err(|err| FrameOutcome::Faulted {
                reason: err.to_string(),
            })
    }

    fn finish(
        &mut self,
        frame: u64,
        elapsed: Duration,
        outcome: FrameOutcome,
        buffer_len: usize,
    ) -> FrameReport {
        self.phase = outcome.phase();

        match &outcome {
            FrameOutcome::Committed(report) => {
                self.stats.committed += 1;
                self.stats.clamped_channels += report.clamped_channels as u64;
                tracing::debug!(
                    frame,
                    len = report.len,
                    clamped = report.clamped_channels,
                    dropped = report.dropped_entries,
                    elapsed_us = elapsed.as_micros() as u64,
                    "frame committed"
                );
            }
            FrameOutcome::Faulted { reason } => {
                self.stats.faulted += 1;
                tracing::warn!(frame, %reason, "script faulted, reusing previous buffer");
                self.record(frame, outcome.kind(), elapsed, reason.clone());
            }
            FrameOutcome::TimedOut { elapsed, budget } => {
                self.stats.timed_out += 1;
                tracing::warn!(frame, ?elapsed, ?budget, "script exceeded frame budget");
                self.record(
                    frame,
                    outcome.kind(),
                    *elapsed,
                    format!("ran for {elapsed:?} with a budget of {budget:?}"),
                );
            }
        }

        let limit = self.config.frame.budget() + self.config.frame.grace();
        if elapsed > limit {
            self.stats.grace_overruns += 1;
            tracing::warn!(frame, ?elapsed, ?limit, "script was not cancelled within the grace period");
            self.record(
                frame,
                "grace_overrun",
                elapsed,
                format!("returned after {elapsed:?}, limit {limit:?}"),
            );
        }

        self.phase = FramePhase::Idle;
        FrameReport {
            frame,
            outcome,
            elapsed,
            buffer_len,
        }
    }

    fn record(&mut self, frame: u64, kind: &'static str, elapsed: Duration, message: String) {
        let history = self.config.diagnostics.history;
        if history == 0 {
            return;
        }
        while self.diagnostics.len() >= history {
            self.diagnostics.pop_front();
        }
        self.diagnostics.push_back(FrameDiagnostic {
            frame,
            kind,
            elapsed,
            message,
        });
    }
}

impl<S> FrameScheduler<S> {
    /// Drops the published snapshot so nothing outlives the scheduler.
    pub fn shutdown(&mut self) -> Result<()> {
        self.phase = FramePhase::Idle;
        self.spectrum.teardown()
    }
}

impl<S> Drop for FrameScheduler<S> {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            tracing::warn!(error = %err, "failed to tear down spectrum slot");
        }
    }
}

impl<S> std::fmt::Debug for FrameScheduler<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameScheduler")
            .field("phase", &self.phase)
            .field("next_frame", &self.next_frame)
            .field("stats", &self.stats)
            .finish()
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("script panicked: {detail}")
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc, thread};

    use super::*;
    use crate::{
        Channel, ChannelBounds, Color, ColorBufferView, RhaiScript, ScriptConfig, SizePolicy,
    };

    const INCREMENT: &str = r#"
        fn update(colors) {
            for color in colors {
                color.red += 1;
                color.blue += 1;
                color.green += 1;
            }
            colors
        }
    "#;

    fn rhai_scheduler(source: &str, config: BridgeConfig) -> FrameScheduler<RhaiScript> {
        let script = RhaiScript::compile(source, &config.script, config.channels).unwrap();
        FrameScheduler::new(script, config)
    }

    fn buffer(colors: &[Color]) -> ColorBuffer {
        ColorBuffer::from_colors(colors.to_vec(), ChannelBounds::FULL)
    }

    #[test]
    fn increments_black_pixel() {
        let mut scheduler = rhai_scheduler(INCREMENT, BridgeConfig::default());
        let mut colors = buffer(&[Color::new(0, 0, 0)]);

        let report = scheduler.run_frame(SpectrumSnapshot::empty(), &mut colors);

        assert!(report.outcome.is_committed());
        assert_eq!(colors.as_slice(), &[Color::new(1, 1, 1)]);
        assert_eq!(scheduler.phase(), FramePhase::Idle);
    }

    #[test]
    fn increments_saturate_at_the_top() {
        let mut scheduler = rhai_scheduler(INCREMENT, BridgeConfig::default());
        let mut colors = buffer(&[Color::new(255, 10, 255)]);

        scheduler.run_frame(SpectrumSnapshot::empty(), &mut colors);

        assert_eq!(colors.as_slice(), &[Color::new(255, 11, 255)]);
    }

    #[test]
    fn appended_pixels_propagate() {
        let source = r#"
            fn update(colors) {
                colors.append(Color());
                for color in colors {
                    color.red += 1;
                    color.blue += 1;
                    color.green += 1;
                }
                colors
            }
        "#;
        let mut scheduler = rhai_scheduler(source, BridgeConfig::default());
        let mut colors = buffer(&[]);

        let report = scheduler.run_frame(SpectrumSnapshot::empty(), &mut colors);

        assert_eq!(report.buffer_len, 1);
        assert_eq!(colors.as_slice(), &[Color::new(1, 1, 1)]);
        match report.outcome {
            FrameOutcome::Committed(commit) => {
                assert_eq!((commit.original_len, commit.len), (0, 1));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn fixed_policy_keeps_frame_length() {
        let source = "fn update(colors) { colors.append(Color(9, 9, 9)); colors }";
        let mut config = BridgeConfig::default();
        config.buffer.size_policy = SizePolicy::Fixed;
        let mut scheduler = rhai_scheduler(source, config);
        let mut colors = buffer(&[Color::BLACK; 2]);

        let report = scheduler.run_frame(SpectrumSnapshot::empty(), &mut colors);

        assert_eq!(colors.len(), 2);
        assert!(matches!(
            report.outcome,
            FrameOutcome::Committed(CommitReport { dropped_entries: 1, .. })
        ));
    }

    #[test]
    fn script_sees_published_maximum() {
        let source = r#"
            fn update(colors) {
                let max = fft_result().getMaxAmplitude();
                colors[0].red = (max * 100.0).round().to_int();
                colors
            }
        "#;
        let mut scheduler = rhai_scheduler(source, BridgeConfig::default());
        let mut colors = buffer(&[Color::BLACK]);

        scheduler.run_frame(SpectrumSnapshot::new(vec![0.2, 0.9, 0.5]), &mut colors);

        assert_eq!(colors.get(0).unwrap().red, 90);
        assert_eq!(scheduler.spectrum_slot().current().unwrap().max_amplitude(), 0.9);
    }

    #[test]
    fn thrown_errors_restore_previous_contents() {
        let source = r#"
            fn update(colors) {
                colors[0].red = 200;
                colors.append(Color());
                throw "effect crashed";
            }
        "#;
        let mut scheduler = rhai_scheduler(source, BridgeConfig::default());
        let before = buffer(&[Color::new(3, 4, 5), Color::new(6, 7, 8)]);
        let mut colors = before.clone();

        let report = scheduler.run_frame(SpectrumSnapshot::empty(), &mut colors);

        assert!(matches!(report.outcome, FrameOutcome::Faulted { .. }));
        assert_eq!(colors, before);
        assert_eq!(scheduler.stats().faulted, 1);
        let diagnostic = scheduler.diagnostics().next().unwrap();
        assert_eq!(diagnostic.kind, "script_fault");
        assert!(diagnostic.message.contains("effect crashed"));
    }

    #[test]
    fn native_errors_and_panics_restore_previous_contents() {
        let before = buffer(&[Color::new(1, 2, 3)]);

        let failing = |inv: &Invocation| -> Result<ScriptReturn> {
            inv.colors.set_channel(0, Channel::Red, 99)?;
            Err(BridgeError::ScriptFault("bad frame".to_string()))
        };
        let mut scheduler = FrameScheduler::new(failing, BridgeConfig::default());
        let mut colors = before.clone();
        let report = scheduler.run_frame(SpectrumSnapshot::empty(), &mut colors);
        assert!(matches!(report.outcome, FrameOutcome::Faulted { .. }));
        assert_eq!(colors, before);

        let panicking = |inv: &Invocation| -> Result<ScriptReturn> {
            inv.colors.append(Color::BLACK)?;
            panic!("effect bug");
        };
        let mut scheduler = FrameScheduler::new(panicking, BridgeConfig::default());
        let mut colors = before.clone();
        let report = scheduler.run_frame(SpectrumSnapshot::empty(), &mut colors);
        match report.outcome {
            FrameOutcome::Faulted { reason } => assert!(reason.contains("effect bug")),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(colors, before);
        assert_eq!(scheduler.phase(), FramePhase::Idle);
    }

    #[test]
    fn runaway_script_is_cancelled() {
        let mut config = BridgeConfig::default();
        config.frame.budget_ms = 10;
        let source = r#"
            fn update(colors) {
                colors[0].green = 77;
                let n = 0;
                loop { n += 1; }
            }
        "#;
        let mut scheduler = rhai_scheduler(source, config);
        let before = buffer(&[Color::new(5, 5, 5)]);
        let mut colors = before.clone();

        let report = scheduler.run_frame(SpectrumSnapshot::empty(), &mut colors);

        assert!(matches!(report.outcome, FrameOutcome::TimedOut { .. }));
        assert_eq!(colors, before);
        assert!(report.elapsed < Duration::from_secs(1));
        assert_eq!(scheduler.stats().timed_out, 1);
    }

    #[test]
    fn late_results_from_unpreemptible_scripts_are_dropped() {
        let mut config = BridgeConfig::default();
        config.frame.budget_ms = 5;
        let slow = |inv: &Invocation| -> Result<ScriptReturn> {
            inv.colors.set_channel(0, Channel::Blue, 250)?;
            thread::sleep(Duration::from_millis(30));
            Ok(ScriptReturn::InPlace)
        };
        let mut scheduler = FrameScheduler::new(slow, config);
        let before = buffer(&[Color::BLACK]);
        let mut colors = before.clone();

        let report = scheduler.run_frame(SpectrumSnapshot::empty(), &mut colors);

        assert!(matches!(report.outcome, FrameOutcome::TimedOut { .. }));
        assert_eq!(colors, before);
        assert_eq!(scheduler.stats().grace_overruns, 1);
        assert!(scheduler.diagnostics().any(|d| d.kind == "grace_overrun"));
    }

    #[test]
    fn raw_writes_are_clamped_on_the_way_back() {
        let mut config = BridgeConfig::default();
        config.channels = ChannelBounds { min: 0, max: 200 };
        let raw = |inv: &Invocation| -> Result<ScriptReturn> {
            inv.colors.with_color_mut(0, |color| color.red = color.red.wrapping_add(250))?;
            Ok(ScriptReturn::InPlace)
        };
        let mut scheduler = FrameScheduler::new(raw, config);
        let mut colors = ColorBuffer::with_len(1, ChannelBounds { min: 0, max: 200 });

        let report = scheduler.run_frame(SpectrumSnapshot::empty(), &mut colors);

        assert!(matches!(
            report.outcome,
            FrameOutcome::Committed(CommitReport { clamped_channels: 1, .. })
        ));
        assert_eq!(colors.get(0).unwrap().red, 200);
        assert_eq!(scheduler.stats().clamped_channels, 1);
    }

    #[test]
    fn configured_bounds_override_the_buffer_bounds() {
        let mut config = BridgeConfig::default();
        config.channels = ChannelBounds { min: 0, max: 200 };
        let mut scheduler = rhai_scheduler(
            "fn update(colors) { colors[0].red = 250; colors[1].green += 1; colors }",
            config,
        );
        let mut colors = buffer(&[Color::BLACK, Color::new(0, 230, 0)]);

        let report = scheduler.run_frame(SpectrumSnapshot::empty(), &mut colors);

        assert!(report.outcome.is_committed());
        assert_eq!(colors.as_slice(), &[Color::new(200, 0, 0), Color::new(0, 200, 0)]);
        assert_eq!(colors.bounds(), ChannelBounds { min: 0, max: 200 });
    }

    #[test]
    fn oversized_allocations_fail_fast() {
        let mut scheduler = rhai_scheduler(
            "fn update(colors) { let a = []; a.pad(60000000, 0); colors }",
            BridgeConfig::default(),
        );
        let before = buffer(&[Color::new(9, 9, 9)]);
        let mut colors = before.clone();

        let report = scheduler.run_frame(SpectrumSnapshot::empty(), &mut colors);

        assert!(matches!(report.outcome, FrameOutcome::Faulted { .. }));
        assert!(report.elapsed < Duration::from_millis(500));
        assert_eq!(colors, before);
    }

    #[test]
    fn huge_frequency_bands_read_as_silence() {
        let source = r#"
            fn update(colors, fft) {
                colors[0].red = fft.get_average_amplitude(1e30, 2e30).to_int() + 1;
                colors
            }
        "#;
        let mut scheduler = rhai_scheduler(source, BridgeConfig::default());
        let mut colors = buffer(&[Color::BLACK]);

        let report = scheduler.run_frame(SpectrumSnapshot::new(vec![0.2, 0.9]), &mut colors);

        assert!(report.outcome.is_committed());
        assert_eq!(colors.get(0).unwrap().red, 1);
    }

    #[test]
    fn views_from_earlier_frames_expire_and_snapshots_stay_put() {
        let kept_views: Rc<RefCell<Vec<(ColorBufferView, SnapshotView)>>> = Rc::default();
        let sink = kept_views.clone();
        let hoarder = move |inv: &Invocation| -> Result<ScriptReturn> {
            if let Some((old_colors, _)) = sink.borrow().first() {
                assert!(matches!(old_colors.len(), Err(BridgeError::ViewUnavailable(_))));
            }
            sink.borrow_mut()
                .push((inv.colors.clone(), inv.spectrum.clone()));
            Ok(ScriptReturn::InPlace)
        };
        let mut scheduler = FrameScheduler::new(hoarder, BridgeConfig::default());
        let mut colors = buffer(&[Color::BLACK]);

        scheduler.run_frame(SpectrumSnapshot::new(vec![0.2, 0.9, 0.5]), &mut colors);
        scheduler.run_frame(SpectrumSnapshot::new(vec![0.1]), &mut colors);

        let views = kept_views.borrow();
        assert_eq!(views[0].1.max_amplitude(), 0.9);
        assert_eq!(views[1].1.max_amplitude(), 0.1);
        assert!(views[0].0.is_expired());
        assert_eq!(scheduler.stats().committed, 2);
    }

    #[test]
    fn diagnostics_history_is_bounded() {
        let mut config = BridgeConfig::default();
        config.diagnostics.history = 2;
        let failing =
            |_: &Invocation| -> Result<ScriptReturn> { Err(BridgeError::msg("always fails")) };
        let mut scheduler = FrameScheduler::new(failing, config);
        let mut colors = buffer(&[]);

        for _ in 0..5 {
            scheduler.run_frame(SpectrumSnapshot::empty(), &mut colors);
        }

        let frames: Vec<u64> = scheduler.diagnostics().map(|d| d.frame).collect();
        assert_eq!(frames, vec![3, 4]);
        assert_eq!(scheduler.stats().faulted, 5);
    }

    #[test]
    fn shutdown_clears_the_slot() {
        let mut scheduler = rhai_scheduler(INCREMENT, BridgeConfig::default());
        let slot = scheduler.spectrum_slot().clone();
        let mut colors = buffer(&[Color::BLACK]);
        scheduler.run_frame(SpectrumSnapshot::new(vec![1.0]), &mut colors);
        assert_eq!(slot.current().unwrap().len(), 1);

        drop(scheduler);
        assert!(slot.current().unwrap().is_empty());
    }

    #[test]
    fn script_config_is_honoured() {
        let mut config = BridgeConfig::default();
        config.script = ScriptConfig {
            entry_point: "tick".to_string(),
            progress_interval: 16,
            ..ScriptConfig::default()
        };
        let source = "fn tick(colors) { colors[0].red = 7; colors }";
        let mut scheduler = rhai_scheduler(source, config);
        let mut colors = buffer(&[Color::BLACK]);

        assert!(scheduler
            .run_frame(SpectrumSnapshot::empty(), &mut colors)
            .outcome
            .is_committed());
        assert_eq!(colors.get(0).unwrap().red, 7);
    }
}

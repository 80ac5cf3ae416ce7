//! Boundary crossings between host-owned frame data and script-visible proxies.
//!
//! A [`BufferLease`] moves the frame's [`ColorBuffer`] into a shared cell for
//! the length of one invocation. Every [`ColorBufferView`] and [`PixelRef`]
//! handed to the script points into that cell, so writes land in the host
//! buffer directly. Reclaiming the lease empties the cell: a proxy that the
//! script managed to stash somewhere fails with
//! [`BridgeError::ViewUnavailable`] instead of reaching next frame's data.
//!
//! [`commit`] is the way back in. It re-checks every channel no matter how the
//! script wrote it and applies the buffer size policy.

use std::{cell::RefCell, fmt, rc::Rc, sync::Arc};

use crate::{
    BridgeError, Channel, Color, ColorBuffer, Result, SizePolicy, SpectrumSnapshot,
};

type SharedBuffer = Rc<RefCell<Option<ColorBuffer>>>;

/// Exclusive loan of one frame's buffer to a single invocation.
pub struct BufferLease {
    shared: SharedBuffer,
    original_len: usize,
}

impl BufferLease {
    /// Moves `buffer` into the lease; it stays there until [`reclaim`](Self::reclaim).
    pub fn lend(buffer: ColorBuffer) -> Self {
        let original_len = buffer.len();
        Self {
            shared: Rc::new(RefCell::new(Some(buffer))),
            original_len,
        }
    }

    /// Returns a new proxy over the leased buffer.
    pub fn view(&self) -> ColorBufferView {
        ColorBufferView {
            shared: self.shared.clone(),
        }
    }

    /// Length of the buffer when it was lent out.
    pub fn original_len(&self) -> usize {
        self.original_len
    }

    /// Takes the buffer back. Views created from this lease expire.
    pub fn reclaim(self) -> Result<ColorBuffer> {
        let mut slot = self
            .shared
            .try_borrow_mut()
            .map_err(|_| BridgeError::ViewUnavailable("color buffer is still borrowed"))?;
        slot.take()
            .ok_or(BridgeError::ViewUnavailable("color buffer was already reclaimed"))
    }
}

impl fmt::Debug for BufferLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferLease")
            .field("original_len", &self.original_len)
            .field("views", &(Rc::strong_count(&self.shared) - 1))
            .finish()
    }
}

/// Script-visible proxy over the leased buffer.
#[derive(Clone)]
pub struct ColorBufferView {
    shared: SharedBuffer,
}

impl ColorBufferView {
    /// Returns the current length, including pixels appended this frame.
    pub fn len(&self) -> Result<usize> {
        self.with_buffer(|buffer| Ok(buffer.len()))
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Returns a copy of the pixel at `index`.
    pub fn get(&self, index: i64) -> Result<Color> {
        self.with_buffer(|buffer| buffer.get(checked_index(index, buffer.len())?))
    }

    /// Stores `color` at `index`, clamped to the buffer's bounds.
    pub fn set(&self, index: i64, color: Color) -> Result<()> {
        self.with_buffer_mut(|buffer| buffer.set(checked_index(index, buffer.len())?, color))
    }

    pub fn channel(&self, index: i64, channel: Channel) -> Result<u8> {
        Ok(self.get(index)?.channel(channel))
    }

    /// Clamped write of a single channel; returns the stored value.
    pub fn set_channel(&self, index: i64, channel: Channel, value: i64) -> Result<u8> {
        self.with_buffer_mut(|buffer| {
            buffer.set_channel(checked_index(index, buffer.len())?, channel, value)
        })
    }

    /// Grows the leased buffer by one clamped pixel.
    pub fn append(&self, color: Color) -> Result<()> {
        self.with_buffer_mut(|buffer| {
            buffer.append(color);
            Ok(())
        })
    }

    /// Live handle to the pixel at `index`.
    pub fn pixel(&self, index: i64) -> Result<PixelRef> {
        let index = checked_index(index, self.len()?)?;
        Ok(PixelRef {
            view: self.clone(),
            index,
        })
    }

    /// Handles for every pixel present right now.
    pub fn pixels(&self) -> Result<Vec<PixelRef>> {
        let len = self.len()?;
        Ok((0..len)
            .map(|index| PixelRef {
                view: self.clone(),
                index,
            })
            .collect())
    }

    /// Unchecked mutation of a pixel, for runtimes that assign fields directly.
    /// Out-of-bounds values written here are repaired by [`commit`].
    pub fn with_color_mut<R>(&self, index: i64, f: impl FnOnce(&mut Color) -> R) -> Result<R> {
        self.with_buffer_mut(|buffer| {
            let index = checked_index(index, buffer.len())?;
            Ok(f(buffer.color_mut(index)?))
        })
    }

    /// Returns `true` once the lease behind this view has been reclaimed.
    pub fn is_expired(&self) -> bool {
        self.shared
            .try_borrow()
            .map(|slot| slot.is_none())
            .unwrap_or(false)
    }

    /// Returns `true` when both views point at the same lease.
    pub fn same_buffer(&self, other: &ColorBufferView) -> bool {
        Rc::ptr_eq(&self.shared, &other.shared)
    }

    fn with_buffer<R>(&self, f: impl FnOnce(&ColorBuffer) -> Result<R>) -> Result<R> {
        let slot = self
            .shared
            .try_borrow()
            .map_err(|_| BridgeError::ViewUnavailable("color buffer is being mutated"))?;
        let buffer = slot.as_ref().ok_or(EXPIRED)?;
        f(buffer)
    }

    fn with_buffer_mut<R>(&self, f: impl FnOnce(&mut ColorBuffer) -> Result<R>) -> Result<R> {
        let mut slot = self
            .shared
            .try_borrow_mut()
            .map_err(|_| BridgeError::ViewUnavailable("color buffer is already borrowed"))?;
        let buffer = slot.as_mut().ok_or(EXPIRED)?;
        f(buffer)
    }
}

const EXPIRED: BridgeError = BridgeError::ViewUnavailable("color buffer view outlived its frame");

/// Iteration covers the pixels present when the loop starts. An expired view
/// iterates as empty.
impl IntoIterator for ColorBufferView {
    type Item = PixelRef;
    type IntoIter = std::vec::IntoIter<PixelRef>;

    fn into_iter(self) -> Self::IntoIter {
        self.pixels().unwrap_or_default().into_iter()
    }
}

impl fmt::Debug for ColorBufferView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ColorBufferView")
            .field("len", &self.len().ok())
            .finish()
    }
}

/// Live handle to one pixel of a leased buffer.
#[derive(Clone)]
pub struct PixelRef {
    view: ColorBufferView,
    index: usize,
}

impl PixelRef {
    /// Returns the position of this pixel in the buffer.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Returns the pixel's current color.
    pub fn get(&self) -> Result<Color> {
        self.view.get(self.signed_index())
    }

    pub fn set(&self, color: Color) -> Result<()> {
        self.view.set(self.signed_index(), color)
    }

    pub fn channel(&self, channel: Channel) -> Result<u8> {
        self.view.channel(self.signed_index(), channel)
    }

    /// Clamped write of one channel; returns the stored value.
    pub fn set_channel(&self, channel: Channel, value: i64) -> Result<u8> {
        self.view.set_channel(self.signed_index(), channel, value)
    }

    fn signed_index(&self) -> i64 {
        i64::try_from(self.index).unwrap_or(i64::MAX)
    }
}

impl fmt::Debug for PixelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PixelRef")
            .field("index", &self.index)
            .field("color", &self.get().ok())
            .finish()
    }
}

/// Read-only proxy over the snapshot published for the current frame.
#[derive(Clone)]
pub struct SnapshotView {
    snapshot: Arc<SpectrumSnapshot>,
}

impl SnapshotView {
    pub fn new(snapshot: Arc<SpectrumSnapshot>) -> Self {
        Self { snapshot }
    }

    pub fn snapshot(&self) -> &SpectrumSnapshot {
        &self.snapshot
    }

    /// Returns the largest bin amplitude of the snapshot.
    pub fn max_amplitude(&self) -> f32 {
        self.snapshot.max_amplitude()
    }

    pub fn len(&self) -> usize {
        self.snapshot.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot.is_empty()
    }

    /// Returns the amplitude of bin `index`, or `OutOfRange`.
    pub fn bin(&self, index: i64) -> Result<f32> {
        self.snapshot
            .bin(checked_index(index, self.snapshot.len())?)
    }

    pub fn frequency_amplitude(&self, frequency: f32) -> Option<f32> {
        self.snapshot.frequency_amplitude(frequency)
    }

    pub fn average_amplitude(&self, lower: f32, upper: f32) -> Option<f32> {
        self.snapshot.average_amplitude(lower, upper)
    }

    pub fn max_frequency(&self) -> f32 {
        self.snapshot.max_frequency()
    }

    /// Every write attempt lands here and is refused.
    pub fn assign(&self, target: &'static str) -> Result<()> {
        Err(BridgeError::ImmutableAccess(target))
    }
}

impl fmt::Debug for SnapshotView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotView")
            .field("bins", &self.snapshot.len())
            .field("max_amplitude", &self.snapshot.max_amplitude())
            .finish()
    }
}

/// What the script handed back from its entry point.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptReturn {
    /// The leased buffer, mutated in place.
    InPlace,
    /// A fresh sequence that replaces the buffer contents.
    Replaced(Vec<Color>),
}

/// Summary of one result crossing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitReport {
    pub original_len: usize,
    pub len: usize,
    pub clamped_channels: usize,
    pub dropped_entries: usize,
    pub replaced: bool,
}

/// Validates a reclaimed buffer before it goes back to the rendering pipeline.
pub fn commit(
    buffer: &mut ColorBuffer,
    original_len: usize,
    returned: ScriptReturn,
    policy: SizePolicy,
) -> Result<CommitReport> {
    let mut report = CommitReport {
        original_len,
        ..Default::default()
    };

    if let ScriptReturn::Replaced(colors) = returned {
        if colors.len() < original_len {
            return Err(BridgeError::ScriptFault(format!(
                "script returned {} colors for a {original_len}-pixel frame",
                colors.len()
            )));
        }
        report.clamped_channels += buffer.replace(colors);
        report.replaced = true;
    }

    report.clamped_channels += buffer.revalidate();

    if policy == SizePolicy::Fixed && buffer.len() > original_len {
        report.dropped_entries = buffer.len() - original_len;
        buffer.truncate(original_len);
    }

    report.len = buffer.len();
    Ok(report)
}

fn checked_index(index: i64, len: usize) -> Result<usize> {
    usize::try_from(index)
        .ok()
        .filter(|&i| i < len)
        .ok_or(BridgeError::OutOfRange { index, len })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ChannelBounds;

    fn lease_of(colors: Vec<Color>) -> BufferLease {
        BufferLease::lend(ColorBuffer::from_colors(colors, ChannelBounds::FULL))
    }

    #[test]
    fn view_writes_reach_the_native_buffer() {
        let lease = lease_of(vec![Color::BLACK; 2]);
        let view = lease.view();

        view.set_channel(1, Channel::Red, 300).unwrap();
        view.append(Color::new(1, 2, 3)).unwrap();

        let buffer = lease.reclaim().unwrap();
        assert_eq!(buffer.as_slice(), &[
            Color::BLACK,
            Color::new(255, 0, 0),
            Color::new(1, 2, 3)
        ]);
    }

    #[test]
    fn negative_and_past_end_indices_are_out_of_range() {
        let lease = lease_of(vec![Color::BLACK]);
        let view = lease.view();

        assert!(matches!(
            view.get(-1),
            Err(BridgeError::OutOfRange { index: -1, len: 1 })
        ));
        assert!(matches!(
            view.set(1, Color::BLACK),
            Err(BridgeError::OutOfRange { index: 1, len: 1 })
        ));
        assert!(view.pixel(3).is_err());
    }

    #[test]
    fn views_expire_when_lease_is_reclaimed() {
        let lease = lease_of(vec![Color::BLACK]);
        let view = lease.view();
        let pixel = view.pixel(0).unwrap();

        lease.reclaim().unwrap();

        assert!(view.is_expired());
        assert!(matches!(view.len(), Err(BridgeError::ViewUnavailable(_))));
        assert!(matches!(
            pixel.set_channel(Channel::Red, 1),
            Err(BridgeError::ViewUnavailable(_))
        ));
        assert_eq!(view.into_iter().count(), 0);
    }

    #[test]
    fn reentrant_mutation_is_refused() {
        let lease = lease_of(vec![Color::BLACK]);
        let view = lease.view();
        let inner = view.clone();

        let nested = view
            .with_color_mut(0, |_| inner.set_channel(0, Channel::Red, 1))
            .unwrap();
        assert!(matches!(nested, Err(BridgeError::ViewUnavailable(_))));
    }

    #[test]
    fn iteration_snapshots_length_at_loop_start() {
        let lease = lease_of(vec![Color::BLACK; 2]);
        let view = lease.view();

        let mut visited = 0;
        for pixel in view.clone() {
            view.append(Color::BLACK).unwrap();
            pixel.set_channel(Channel::Blue, 7).unwrap();
            visited += 1;
        }

        assert_eq!(visited, 2);
        assert_eq!(view.len().unwrap(), 4);
        assert_eq!(view.get(1).unwrap().blue, 7);
        assert_eq!(view.get(3).unwrap().blue, 0);
    }

    #[test]
    fn snapshot_view_is_read_only() {
        let view = SnapshotView::new(Arc::new(SpectrumSnapshot::new(vec![0.2, 0.9, 0.5])));
        assert_eq!(view.max_amplitude(), 0.9);
        assert_eq!(view.bin(2).unwrap(), 0.5);
        assert!(matches!(view.bin(-1), Err(BridgeError::OutOfRange { .. })));
        assert!(matches!(
            view.assign("max_amplitude"),
            Err(BridgeError::ImmutableAccess("max_amplitude"))
        ));
    }

    #[test]
    fn commit_clamps_raw_writes() {
        let bounds = ChannelBounds { min: 0, max: 200 };
        let lease = BufferLease::lend(ColorBuffer::with_len(1, bounds));
        let view = lease.view();
        view.with_color_mut(0, |color| color.red = 250).unwrap();

        let mut buffer = lease.reclaim().unwrap();
        let report = commit(&mut buffer, 1, ScriptReturn::InPlace, SizePolicy::GrowOnAppend).unwrap();

        assert_eq!(report.clamped_channels, 1);
        assert_eq!(buffer.get(0).unwrap().red, 200);
    }

    #[test]
    fn commit_applies_size_policy() {
        let mut grown = ColorBuffer::with_len(3, ChannelBounds::FULL);
        let report = commit(&mut grown, 1, ScriptReturn::InPlace, SizePolicy::GrowOnAppend).unwrap();
        assert_eq!((report.len, report.dropped_entries), (3, 0));

        let mut fixed = ColorBuffer::with_len(3, ChannelBounds::FULL);
        let report = commit(&mut fixed, 1, ScriptReturn::InPlace, SizePolicy::Fixed).unwrap();
        assert_eq!((report.len, report.dropped_entries), (1, 2));
        assert_eq!(fixed.len(), 1);
    }

    #[test]
    fn commit_rejects_short_replacements() {
        let mut buffer = ColorBuffer::with_len(2, ChannelBounds::FULL);
        let err = commit(
            &mut buffer,
            2,
            ScriptReturn::Replaced(vec![Color::BLACK]),
            SizePolicy::GrowOnAppend,
        )
        .unwrap_err();
        assert!(matches!(err, BridgeError::ScriptFault(_)));
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn commit_takes_replacements() {
        let mut buffer = ColorBuffer::with_len(1, ChannelBounds { min: 5, max: 250 });
        let report = commit(
            &mut buffer,
            1,
            ScriptReturn::Replaced(vec![Color::new(0, 100, 255), Color::new(9, 9, 9)]),
            SizePolicy::GrowOnAppend,
        )
        .unwrap();

        assert!(report.replaced);
        assert_eq!(report.clamped_channels, 2);
        assert_eq!(buffer.as_slice(), &[Color::new(5, 100, 250), Color::new(9, 9, 9)]);
    }
}

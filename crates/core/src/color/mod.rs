//! Per-pixel colors and the frame buffer that scripts mutate.
//!
//! Every write path funnels through [`ChannelBounds`], so a stored channel is
//! always inside the configured bounds. The one exception is
//! [`ColorBuffer::color_mut`], which hands out raw access; buffers touched that
//! way are brought back into bounds by [`ColorBuffer::revalidate`].

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{BridgeError, Result};

/// An RGB triple with 8-bit channels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Color {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
}

impl Color {
    pub const BLACK: Color = Color::new(0, 0, 0);

    /// Creates a color without clamping; callers store it through a buffer.
    pub const fn new(red: u8, green: u8, blue: u8) -> Self {
        Self { red, green, blue }
    }

    /// Builds a color from unbounded integers, clamping every channel.
    pub fn from_raw(red: i64, green: i64, blue: i64, bounds: ChannelBounds) -> Self {
        Self {
            red: bounds.clamp(red),
            green: bounds.clamp(green),
            blue: bounds.clamp(blue),
        }
    }

    /// Returns the value of a single channel.
    pub fn channel(&self, channel: Channel) -> u8 {
        match channel {
            Channel::Red => self.red,
            Channel::Green => self.green,
            Channel::Blue => self.blue,
        }
    }

    pub fn channel_mut(&mut self, channel: Channel) -> &mut u8 {
        match channel {
            Channel::Red => &mut self.red,
            Channel::Green => &mut self.green,
            Channel::Blue => &mut self.blue,
        }
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.red, self.green, self.blue)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Red,
    Green,
    Blue,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Channel::Red, Channel::Green, Channel::Blue];

    /// Returns the property name scripts use for this channel.
    pub fn name(self) -> &'static str {
        match self {
            Channel::Red => "red",
            Channel::Green => "green",
            Channel::Blue => "blue",
        }
    }
}

/// Inclusive range every stored channel must fall into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelBounds {
    pub min: u8,
    pub max: u8,
}

impl ChannelBounds {
    pub const FULL: ChannelBounds = ChannelBounds { min: 0, max: 255 };

    /// Clamps an unbounded value into `[min, max]`.
    pub fn clamp(&self, value: i64) -> u8 {
        // Inverted bounds are rejected by config validation; fall back to `max`.
        if self.min > self.max {
            return self.max;
        }
        value.clamp(i64::from(self.min), i64::from(self.max)) as u8
    }

    /// Saturating channel arithmetic: `clamp(current + delta)`.
    pub fn add(&self, current: u8, delta: i64) -> u8 {
        self.clamp(i64::from(current).saturating_add(delta))
    }

    /// Returns `true` when `value` already lies inside the bounds.
    pub fn contains(&self, value: u8) -> bool {
        (self.min..=self.max).contains(&value)
    }

    pub fn clamp_color(&self, color: Color) -> Color {
        Color {
            red: self.clamp(color.red.into()),
            green: self.clamp(color.green.into()),
            blue: self.clamp(color.blue.into()),
        }
    }
}

impl Default for ChannelBounds {
    fn default() -> Self {
        Self::FULL
    }
}

/// `min(255, max(0, current + delta))`.
pub fn add_clamped(current: u8, delta: i64) -> u8 {
    ChannelBounds::FULL.add(current, delta)
}

/// Ordered pixel colors for one frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColorBuffer {
    colors: Vec<Color>,
    bounds: ChannelBounds,
}

impl ColorBuffer {
    pub fn new(bounds: ChannelBounds) -> Self {
        Self {
            colors: Vec::new(),
            bounds,
        }
    }

    /// Creates `len` pixels, all at the lowest allowed value.
    pub fn with_len(len: usize, bounds: ChannelBounds) -> Self {
        let base = bounds.clamp_color(Color::BLACK);
        Self {
            colors: vec![base; len],
            bounds,
        }
    }

    /// Wraps existing colors, clamping any that fall outside `bounds`.
    pub fn from_colors(colors: Vec<Color>, bounds: ChannelBounds) -> Self {
        let mut buffer = Self { colors, bounds };
        buffer.revalidate();
        buffer
    }

    /// Returns the number of pixels in the buffer.
    pub fn len(&self) -> usize {
        self.colors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.colors.is_empty()
    }

    /// Returns the bounds every stored channel is clamped to.
    pub fn bounds(&self) -> ChannelBounds {
        self.bounds
    }

    /// Switches to new bounds and clamps existing pixels into them.
    /// Returns how many channels had to be adjusted.
    pub fn rebind(&mut self, bounds: ChannelBounds) -> usize {
        self.bounds = bounds;
        self.revalidate()
    }

    /// Returns the color at `index`, or `OutOfRange` past the end.
    pub fn get(&self, index: usize) -> Result<Color> {
        self.colors
            .get(index)
            .copied()
            .ok_or_else(|| self.out_of_range(index))
    }

    /// Stores `color` after clamping each channel.
    pub fn set(&mut self, index: usize, color: Color) -> Result<()> {
        let clamped = self.bounds.clamp_color(color);
        let slot = self.slot_mut(index)?;
        *slot = clamped;
        Ok(())
    }

    /// Stores an unbounded channel value after clamping it.
    pub fn set_channel(&mut self, index: usize, channel: Channel, value: i64) -> Result<u8> {
        let clamped = self.bounds.clamp(value);
        let slot = self.slot_mut(index)?;
        *slot.channel_mut(channel) = clamped;
        Ok(clamped)
    }

    /// Saturating `channel += delta` on one pixel; returns the stored value.
    pub fn add_to_channel(&mut self, index: usize, channel: Channel, delta: i64) -> Result<u8> {
        let bounds = self.bounds;
        let slot = self.slot_mut(index)?;
        let value = slot.channel_mut(channel);
        *value = bounds.add(*value, delta);
        Ok(*value)
    }

    /// Pushes a clamped copy of `color` onto the end of the buffer.
    pub fn append(&mut self, color: Color) {
        self.colors.push(self.bounds.clamp_color(color));
    }

    /// Raw access that skips the clamp. Callers must [`revalidate`](Self::revalidate)
    /// before the buffer leaves their hands.
    pub fn color_mut(&mut self, index: usize) -> Result<&mut Color> {
        self.slot_mut(index)
    }

    /// Returns the pixels in order.
    pub fn as_slice(&self) -> &[Color] {
        &self.colors
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Color> {
        self.colors.iter()
    }

    /// Drops every pixel from `len` onwards.
    pub fn truncate(&mut self, len: usize) {
        self.colors.truncate(len);
    }

    /// Replaces the contents wholesale, clamping the new entries.
    pub fn replace(&mut self, colors: Vec<Color>) -> usize {
        self.colors = colors;
        self.revalidate()
    }

    /// Clamps any channel outside the bounds and returns how many were fixed.
    pub fn revalidate(&mut self) -> usize {
        let bounds = self.bounds;
        let mut clamped = 0;
        for color in &mut self.colors {
            for channel in Channel::ALL {
                let value = color.channel_mut(channel);
                if !bounds.contains(*value) {
                    *value = bounds.clamp(i64::from(*value));
                    clamped += 1;
                }
            }
        }
        clamped
    }

    fn slot_mut(&mut self, index: usize) -> Result<&mut Color> {
        let len = self.colors.len();
        self.colors
            .get_mut(index)
            .ok_or_else(|| out_of_range(index, len))
    }

    fn out_of_range(&self, index: usize) -> BridgeError {
        out_of_range(index, self.colors.len())
    }
}

impl<'a> IntoIterator for &'a ColorBuffer {
    type Item = &'a Color;
    type IntoIter = std::slice::Iter<'a, Color>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

fn out_of_range(index: usize, len: usize) -> BridgeError {
    BridgeError::OutOfRange {
        index: i64::try_from(index).unwrap_or(i64::MAX),
        len,
    }
}

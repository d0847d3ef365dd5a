//! Output frame size planning. libx264 with yuv420p needs even width and height.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// FFmpeg `scale` filter argument for these dimensions.
    pub fn scale_filter(&self) -> String {
        format!("scale={}:{}", self.width, self.height)
    }
}

impl std::fmt::Display for Dimensions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Round down to the nearest even value, never below 2.
fn floor_even(value: u32) -> u32 {
    (value - value % 2).max(2)
}

/// Picks the encode size for a source frame.
///
/// With `maintain_aspect_ratio` the longer edge is bounded by `max_edge` (sources already
/// within the bound keep their size) and both edges are floored to even values.
/// Without it, `fallback` is used as-is after the same even rounding.
pub fn plan_dimensions(
    source: Dimensions,
    maintain_aspect_ratio: bool,
    max_edge: u32,
    fallback: Dimensions,
) -> Dimensions {
    if !maintain_aspect_ratio {
        return Dimensions::new(floor_even(fallback.width), floor_even(fallback.height));
    }

    let longest = source.width.max(source.height).max(1);
    let max_edge = max_edge.max(2);
    if longest <= max_edge {
        return Dimensions::new(floor_even(source.width), floor_even(source.height));
    }

    let scaled = |edge: u32| (edge as u64 * max_edge as u64 / longest as u64) as u32;
    Dimensions::new(floor_even(scaled(source.width)), floor_even(scaled(source.height)))
}

//! Utilities module for logging, charts, and helper functions
//!
//! This module provides:
//! - Error handling types
//! - Structured logging with tracing and progress bars
//! - SVG loss-curve rendering
//! - General helper functions

pub mod charts;
pub mod error;
pub mod logging;

pub use error::{CoTrainError, Result};
pub use logging::init_logging;

/// Format a duration in a human-readable way
pub fn format_duration(seconds: f64) -> String {
    if seconds < 60.0 {
        format!("{:.1}s", seconds)
    } else if seconds < 3600.0 {
        let minutes = (seconds / 60.0).floor();
        let secs = seconds % 60.0;
        format!("{}m {:.0}s", minutes as u32, secs)
    } else {
        let hours = (seconds / 3600.0).floor();
        let minutes = ((seconds % 3600.0) / 60.0).floor();
        format!("{}h {}m", hours as u32, minutes as u32)
    }
}

/// Min-max normalize a buffer into [0, 1] in place.
///
/// Constant buffers map to all zeros.
pub fn min_max_normalize(values: &mut [f32]) {
    let (min, max) = values
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    let range = max - min;
    if !range.is_finite() || range <= f32::EPSILON {
        values.iter_mut().for_each(|v| *v = 0.0);
        return;
    }
    values.iter_mut().for_each(|v| *v = (*v - min) / range);
}

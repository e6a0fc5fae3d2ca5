//! # kiln-io
//!
//! File formats consumed by the kiln OCR driver.
//!
//! Provides:
//! - 24-bit uncompressed BMP decode and encode ([`bmp`])
//! - Whitespace-separated text weight files ([`weights`])

pub mod bmp;
pub mod weights;

pub use bmp::{BmpError, RgbImage};
pub use weights::WeightError;

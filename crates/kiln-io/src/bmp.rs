//! 24-bit uncompressed Windows bitmap files.
//!
//! Reads both bottom-up (positive height) and top-down (negative height)
//! files and honours 4-byte row padding. Pixels come out as interleaved RGB,
//! top row first.

use std::path::{Path, PathBuf};

const FILE_HEADER_LEN: usize = 14;
const INFO_HEADER_LEN: usize = 40;
const HEADER_LEN: usize = FILE_HEADER_LEN + INFO_HEADER_LEN;

#[derive(Debug, thiserror::Error)]
pub enum BmpError {
    #[error("failed to access '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("not a BMP file (magic {0:02x?})")]
    BadMagic([u8; 2]),

    #[error("unsupported BMP: {bits} bits per pixel, compression {compression}")]
    Unsupported { bits: u16, compression: u32 },

    #[error("invalid BMP dimensions {width}x{height}")]
    InvalidDimensions { width: i64, height: i64 },

    #[error("truncated BMP: need {expected} bytes, have {actual}")]
    Truncated { expected: usize, actual: usize },
}

/// An RGB image with rows stored top-down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RgbImage {
    pub width: usize,
    pub height: usize,
    /// `3 * width * height` bytes, `R G B` per pixel.
    pub pixels: Vec<u8>,
}

impl RgbImage {
    /// A black image.
    pub fn new(width: usize, height: usize) -> Self {
        Self { width, height, pixels: vec![0; 3 * width * height] }
    }

    pub fn pixel(&self, x: usize, y: usize) -> [u8; 3] {
        let i = 3 * (y * self.width + x);
        [self.pixels[i], self.pixels[i + 1], self.pixels[i + 2]]
    }

    pub fn set_pixel(&mut self, x: usize, y: usize, rgb: [u8; 3]) {
        let i = 3 * (y * self.width + x);
        self.pixels[i..i + 3].copy_from_slice(&rgb);
    }
}

fn row_stride(width: usize) -> usize {
    (width * 3 + 3) & !3
}

fn u16_at(b: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([b[off], b[off + 1]])
}

fn u32_at(b: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([b[off], b[off + 1], b[off + 2], b[off + 3]])
}

fn i32_at(b: &[u8], off: usize) -> i32 {
    u32_at(b, off) as i32
}

/// Decode a BMP from memory.
pub fn decode_bmp(bytes: &[u8]) -> Result<RgbImage, BmpError> {
    if bytes.len() < HEADER_LEN {
        return Err(BmpError::Truncated { expected: HEADER_LEN, actual: bytes.len() });
    }
    if &bytes[0..2] != b"BM" {
        return Err(BmpError::BadMagic([bytes[0], bytes[1]]));
    }

    let data_offset = u32_at(bytes, 10) as usize;
    let raw_width = i32_at(bytes, 18);
    let raw_height = i32_at(bytes, 22);
    let bits = u16_at(bytes, 28);
    let compression = u32_at(bytes, 30);

    if bits != 24 || compression != 0 {
        return Err(BmpError::Unsupported { bits, compression });
    }
    if raw_width <= 0 || raw_height == 0 || raw_height == i32::MIN {
        return Err(BmpError::InvalidDimensions {
            width: raw_width as i64,
            height: raw_height as i64,
        });
    }

    let width = raw_width as usize;
    let height = raw_height.unsigned_abs() as usize;
    let top_down = raw_height < 0;
    let stride = row_stride(width);

    let expected = stride
        .checked_mul(height)
        .and_then(|n| n.checked_add(data_offset))
        .ok_or(BmpError::InvalidDimensions { width: raw_width as i64, height: raw_height as i64 })?;
    if bytes.len() < expected {
        return Err(BmpError::Truncated { expected, actual: bytes.len() });
    }

    let mut image = RgbImage::new(width, height);
    for y in 0..height {
        let stored_row = if top_down { y } else { height - 1 - y };
        let row = &bytes[data_offset + stored_row * stride..][..width * 3];
        let dst = &mut image.pixels[y * width * 3..(y + 1) * width * 3];
        for (bgr, rgb) in row.chunks_exact(3).zip(dst.chunks_exact_mut(3)) {
            rgb[0] = bgr[2];
            rgb[1] = bgr[1];
            rgb[2] = bgr[0];
        }
    }
    Ok(image)
}

/// Read and decode a BMP file.
pub fn read_bmp(path: impl AsRef<Path>) -> Result<RgbImage, BmpError> {
    let path = path.as_ref();
    let bytes = std::fs::read(path).map_err(|source| BmpError::Io { path: path.to_path_buf(), source })?;
    let image = decode_bmp(&bytes)?;
    tracing::debug!("read {}x{} bitmap from {}", image.width, image.height, path.display());
    Ok(image)
}

/// Encode as a bottom-up 24-bit BMP.
pub fn encode_bmp(image: &RgbImage) -> Vec<u8> {
    let stride = row_stride(image.width);
    let data_len = stride * image.height;
    let file_len = HEADER_LEN + data_len;

    let mut out = Vec::with_capacity(file_len);
    out.extend_from_slice(b"BM");
    out.extend_from_slice(&(file_len as u32).to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(&(HEADER_LEN as u32).to_le_bytes());

    out.extend_from_slice(&(INFO_HEADER_LEN as u32).to_le_bytes());
    out.extend_from_slice(&(image.width as i32).to_le_bytes());
    out.extend_from_slice(&(image.height as i32).to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&24u16.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(&(data_len as u32).to_le_bytes());
    // 2835 px/m = 72 dpi
    out.extend_from_slice(&2835i32.to_le_bytes());
    out.extend_from_slice(&2835i32.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());

    let padding = stride - image.width * 3;
    for y in (0..image.height).rev() {
        let row = &image.pixels[y * image.width * 3..(y + 1) * image.width * 3];
        for rgb in row.chunks_exact(3) {
            out.extend_from_slice(&[rgb[2], rgb[1], rgb[0]]);
        }
        out.extend(std::iter::repeat(0u8).take(padding));
    }
    out
}

/// Encode and write a BMP file.
pub fn write_bmp(path: impl AsRef<Path>, image: &RgbImage) -> Result<(), BmpError> {
    let path = path.as_ref();
    std::fs::write(path, encode_bmp(image)).map_err(|source| BmpError::Io { path: path.to_path_buf(), source })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(width: i32, height: i32, bits: u16, data_len: usize) -> Vec<u8> {
        let mut b = Vec::new();
        b.extend_from_slice(b"BM");
        b.extend_from_slice(&((HEADER_LEN + data_len) as u32).to_le_bytes());
        b.extend_from_slice(&0u32.to_le_bytes());
        b.extend_from_slice(&(HEADER_LEN as u32).to_le_bytes());
        b.extend_from_slice(&40u32.to_le_bytes());
        b.extend_from_slice(&width.to_le_bytes());
        b.extend_from_slice(&height.to_le_bytes());
        b.extend_from_slice(&1u16.to_le_bytes());
        b.extend_from_slice(&bits.to_le_bytes());
        b.extend_from_slice(&[0u8; 24]);
        b
    }

    #[test]
    fn test_row_stride() {
        assert_eq!(row_stride(1), 4);
        assert_eq!(row_stride(4), 12);
        assert_eq!(row_stride(28), 84);
        assert_eq!(row_stride(5), 16);
    }

    #[test]
    fn test_decode_bottom_up_with_padding() {
        // 2x2: stored bottom row first, each row padded from 6 to 8 bytes.
        let mut bytes = header(2, 2, 24, 16);
        bytes.extend_from_slice(&[255, 0, 0, 0, 255, 0, 0, 0]); // bottom: blue, green
        bytes.extend_from_slice(&[0, 0, 255, 255, 255, 255, 0, 0]); // top: red, white
        let img = decode_bmp(&bytes).unwrap();
        assert_eq!((img.width, img.height), (2, 2));
        assert_eq!(img.pixel(0, 0), [255, 0, 0]);
        assert_eq!(img.pixel(1, 0), [255, 255, 255]);
        assert_eq!(img.pixel(0, 1), [0, 0, 255]);
        assert_eq!(img.pixel(1, 1), [0, 255, 0]);
    }

    #[test]
    fn test_decode_top_down() {
        let mut bytes = header(1, -2, 24, 8);
        bytes.extend_from_slice(&[0, 0, 255, 0]); // top: red
        bytes.extend_from_slice(&[255, 0, 0, 0]); // bottom: blue
        let img = decode_bmp(&bytes).unwrap();
        assert_eq!(img.pixel(0, 0), [255, 0, 0]);
        assert_eq!(img.pixel(0, 1), [0, 0, 255]);
    }

    #[test]
    fn test_encode_decode() {
        let mut img = RgbImage::new(3, 2);
        img.set_pixel(0, 0, [10, 20, 30]);
        img.set_pixel(2, 1, [200, 100, 50]);
        let bytes = encode_bmp(&img);
        assert_eq!(bytes.len(), HEADER_LEN + 2 * 12);
        assert_eq!(decode_bmp(&bytes).unwrap(), img);
    }

    #[test]
    fn test_rejects_bad_magic() {
        let mut bytes = header(1, 1, 24, 4);
        bytes[0] = b'P';
        bytes.extend_from_slice(&[0; 4]);
        assert!(matches!(decode_bmp(&bytes), Err(BmpError::BadMagic([b'P', b'M']))));
    }

    #[test]
    fn test_rejects_palette_images() {
        let bytes = header(1, 1, 8, 4);
        assert!(matches!(
            decode_bmp(&bytes),
            Err(BmpError::Unsupported { bits: 8, compression: 0 })
        ));
    }

    #[test]
    fn test_rejects_truncated_pixels() {
        let mut bytes = header(4, 4, 24, 48);
        bytes.extend_from_slice(&[0; 20]);
        assert!(matches!(
            decode_bmp(&bytes),
            Err(BmpError::Truncated { expected: 102, actual: 74 })
        ));
    }

    #[test]
    fn test_rejects_short_header() {
        assert!(matches!(decode_bmp(b"BM"), Err(BmpError::Truncated { .. })));
    }
}

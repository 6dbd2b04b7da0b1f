// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Thumbnail encoder: raster image to `M4010` preview commands.
//
// Pixels are packed to RGB565 with bit 5 cleared; that bit marks the first
// word of a run pair (`color | 0x20`, `0x3000 | length`). Hex words are
// accumulated and flushed as `M4010 I<offset> T<count> '<hex>'` lines once
// the pending text reaches the flush length. A pair that would push a line
// past the flush length starts the next line instead.

use std::fmt::Write as _;
use std::path::Path;

use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView};
use tracing::{debug, instrument};

use chitulink_core::error::{ChituLinkError, Result};

/// Longest edge the device accepts.
pub const MAX_EDGE: u32 = 320;
/// Pending hex length that triggers a flush.
pub const FLUSH_LEN: usize = 180;
/// Longest run one pair can encode.
pub const MAX_RUN: u16 = 4095;
/// Bit 5: set on the color word of a run pair, never on a literal.
pub const RUN_FLAG: u16 = 0x0020;
const RUN_LENGTH_TAG: u16 = 0x3000;

/// Pixel rectangle to capture, end-exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureRect {
    pub start_x: u32,
    pub start_y: u32,
    pub end_x: u32,
    pub end_y: u32,
}

impl Default for CaptureRect {
    /// The full 300x300 snapshot.
    fn default() -> Self {
        Self {
            start_x: 0,
            start_y: 0,
            end_x: 300,
            end_y: 300,
        }
    }
}

impl CaptureRect {
    pub fn width(&self) -> u32 {
        self.end_x.saturating_sub(self.start_x)
    }

    pub fn height(&self) -> u32 {
        self.end_y.saturating_sub(self.start_y)
    }

    fn clamp_to(self, width: u32, height: u32) -> Self {
        Self {
            end_x: self.end_x.min(width),
            end_y: self.end_y.min(height),
            ..self
        }
    }

    fn scaled(self, scale: f64) -> Self {
        let s = |v: u32| (f64::from(v) * scale) as u32;
        Self {
            start_x: s(self.start_x),
            start_y: s(self.start_y),
            end_x: s(self.end_x),
            end_y: s(self.end_y),
        }
    }
}

/// One unit of encoder output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelRun {
    Literal(u16),
    Run { color: u16, length: u16 },
}

impl PixelRun {
    fn new(color: u16, length: u16) -> Self {
        if length >= 2 {
            Self::Run { color, length }
        } else {
            Self::Literal(color)
        }
    }

    /// Pixels this unit covers.
    pub fn pixels(&self) -> u64 {
        match self {
            Self::Literal(_) => 1,
            Self::Run { length, .. } => u64::from(*length),
        }
    }

    fn hex_len(&self) -> usize {
        match self {
            Self::Literal(_) => 4,
            Self::Run { .. } => 8,
        }
    }

    fn write_hex(&self, out: &mut String) {
        // Writing to a String cannot fail.
        let _ = match self {
            Self::Literal(color) => write!(out, "{color:04x}"),
            Self::Run { color, length } => {
                write!(out, "{:04x}{:04x}", color | RUN_FLAG, RUN_LENGTH_TAG | length)
            }
        };
    }
}

/// Pack 8-bit RGB into RGB565 with the run flag bit cleared.
pub fn pack_rgb565(r: u8, g: u8, b: u8) -> u16 {
    let packed = (u16::from(r >> 3) << 11) | (u16::from(g >> 2) << 5) | u16::from(b >> 3);
    packed & !RUN_FLAG
}

#[derive(Debug, Clone)]
pub struct ThumbnailEncoder {
    max_edge: u32,
    flush_len: usize,
}

impl Default for ThumbnailEncoder {
    fn default() -> Self {
        Self {
            max_edge: MAX_EDGE,
            flush_len: FLUSH_LEN,
        }
    }
}

impl ThumbnailEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load an image file and encode the default capture rectangle.
    pub fn encode_file(&self, path: &Path) -> Result<String> {
        let image = image::open(path).map_err(|err| {
            ChituLinkError::Image(format!("failed to open {}: {err}", path.display()))
        })?;
        Ok(self.encode(&image, CaptureRect::default()))
    }

    /// Encode `rect` of `image` into the `M4010` command block.
    ///
    /// The output is a pure function of the pixels and the rectangle.
    #[instrument(skip(self, image), fields(width = image.width(), height = image.height()))]
    pub fn encode(&self, image: &DynamicImage, rect: CaptureRect) -> String {
        let (mut width, mut height) = image.dimensions();
        let mut rect = rect.clamp_to(width, height);

        let longest = rect.width().max(rect.height());
        let resized;
        let mut source = image;
        if longest > self.max_edge {
            let scale = f64::from(self.max_edge) / f64::from(longest);
            width = (f64::from(width) * scale) as u32;
            height = (f64::from(height) * scale) as u32;
            rect = rect.scaled(scale).clamp_to(width, height);
            debug!(scale, width, height, "downscaling thumbnail");
            resized = image.resize_exact(width, height, FilterType::Nearest);
            source = &resized;
        }

        let mut stream = RunStream::new(self.flush_len);
        stream.out.push_str(&format!("M4010 X{} Y{}\n", rect.width(), rect.height()));

        let rgba = source.to_rgba8();
        for y in rect.start_y..rect.end_y {
            for x in rect.start_x..rect.end_x {
                let [r, g, b, a] = rgba.get_pixel(x, y).0;
                let color = if a == 0 {
                    pack_rgb565(255, 255, 255)
                } else {
                    pack_rgb565(r, g, b)
                };
                stream.push(color);
            }
        }
        stream.finish()
    }
}

/// Run-length state machine plus line accumulation.
struct RunStream {
    out: String,
    pending: String,
    flush_len: usize,
    /// Pixel index of the first pixel in `pending`.
    index: u64,
    /// Pixels covered by `pending`.
    count: u64,
    current: Option<(u16, u16)>,
}

impl RunStream {
    fn new(flush_len: usize) -> Self {
        Self {
            out: String::new(),
            pending: String::new(),
            flush_len,
            index: 0,
            count: 0,
            current: None,
        }
    }

    fn push(&mut self, color: u16) {
        match self.current {
            None => self.current = Some((color, 1)),
            Some((last, length)) if last == color && length < MAX_RUN => {
                self.current = Some((last, length + 1));
            }
            Some((last, length)) => {
                self.emit(PixelRun::new(last, length));
                self.current = Some((color, 1));
            }
        }
        if self.pending.len() >= self.flush_len {
            self.flush();
        }
    }

    fn emit(&mut self, run: PixelRun) {
        if !self.pending.is_empty() && self.pending.len() + run.hex_len() > self.flush_len {
            self.flush();
        }
        run.write_hex(&mut self.pending);
        self.count += run.pixels();
    }

    fn flush(&mut self) {
        self.out.push_str(&format!(
            "M4010 I{} T{} '{}'\n",
            self.index, self.count, self.pending
        ));
        self.pending.clear();
        self.index += self.count;
        self.count = 0;
    }

    /// Emit the open run and the final line, which is always written.
    fn finish(mut self) -> String {
        if let Some((last, length)) = self.current.take() {
            self.emit(PixelRun::new(last, length));
        }
        self.flush();
        self.out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    /// Decoded `(offset, count, words)` of every data line.
    fn data_lines(code: &str) -> Vec<(u64, u64, Vec<u16>)> {
        code.lines()
            .skip(1)
            .map(|line| {
                let rest = line.strip_prefix("M4010 I").unwrap();
                let (offset, rest) = rest.split_once(" T").unwrap();
                let (count, rest) = rest.split_once(' ').unwrap();
                let hex = rest.trim_matches('\'');
                assert_eq!(hex.len() % 4, 0, "words are 4 hex digits: {hex}");
                let words = (0..hex.len())
                    .step_by(4)
                    .map(|i| u16::from_str_radix(&hex[i..i + 4], 16).unwrap())
                    .collect();
                (offset.parse().unwrap(), count.parse().unwrap(), words)
            })
            .collect()
    }

    /// Decode words back into run lengths, checking the flag invariants.
    fn run_lengths(words: &[u16]) -> Vec<u64> {
        let mut lengths = Vec::new();
        let mut i = 0;
        while i < words.len() {
            if words[i] & RUN_FLAG != 0 {
                let tag = words[i + 1];
                assert_eq!(tag & 0xf000, RUN_LENGTH_TAG);
                let length = tag & 0x0fff;
                assert!((2..=MAX_RUN).contains(&length));
                lengths.push(u64::from(length));
                i += 2;
            } else {
                lengths.push(1);
                i += 1;
            }
        }
        lengths
    }

    fn solid(width: u32, height: u32, color: [u8; 4]) -> DynamicImage {
        DynamicImage::ImageRgba8(RgbaImage::from_pixel(width, height, Rgba(color)))
    }

    fn noisy(width: u32, height: u32) -> DynamicImage {
        let img = RgbaImage::from_fn(width, height, |x, y| {
            let v = ((x * 31 + y * 17) % 7) as u8;
            Rgba([v * 36, 255 - v * 30, v * 20, 255])
        });
        DynamicImage::ImageRgba8(img)
    }

    #[test]
    fn packs_rgb565_without_flag() {
        assert_eq!(pack_rgb565(255, 255, 255), 0xffdf);
        assert_eq!(pack_rgb565(0, 0, 0), 0);
        assert_eq!(pack_rgb565(0, 4, 0) & RUN_FLAG, 0);
    }

    #[test]
    fn header_names_capture_size() {
        let code = ThumbnailEncoder::new().encode(&solid(300, 300, [1, 2, 3, 255]), CaptureRect::default());
        assert_eq!(code.lines().next(), Some("M4010 X300 Y300"));
    }

    #[test]
    fn uniform_run_splits_at_4095() {
        let image = solid(100, 90, [10, 200, 30, 255]);
        let rect = CaptureRect {
            start_x: 0,
            start_y: 0,
            end_x: 100,
            end_y: 90,
        };
        let code = ThumbnailEncoder::new().encode(&image, rect);
        let lengths: Vec<u64> = data_lines(&code)
            .iter()
            .flat_map(|(_, _, words)| run_lengths(words))
            .collect();
        assert_eq!(lengths, vec![4095, 4095, 810]);
    }

    #[test]
    fn pixel_counts_cover_rectangle() {
        let image = noisy(120, 80);
        let rect = CaptureRect {
            start_x: 10,
            start_y: 5,
            end_x: 110,
            end_y: 75,
        };
        let code = ThumbnailEncoder::new().encode(&image, rect);
        let lines = data_lines(&code);

        let mut expected_offset = 0;
        for (offset, count, words) in &lines {
            assert_eq!(*offset, expected_offset, "offsets are contiguous");
            assert_eq!(run_lengths(words).iter().sum::<u64>(), *count);
            expected_offset += count;
        }
        assert_eq!(expected_offset, 100 * 70);
    }

    #[test]
    fn lines_stay_within_flush_length() {
        let code = ThumbnailEncoder::new().encode(&noisy(64, 64), CaptureRect::default());
        for (_, _, words) in data_lines(&code) {
            assert!(words.len() * 4 <= FLUSH_LEN, "{} hex chars", words.len() * 4);
        }
    }

    #[test]
    fn literal_words_never_carry_flag() {
        let code = ThumbnailEncoder::new().encode(&noisy(50, 50), CaptureRect::default());
        for (_, _, words) in data_lines(&code) {
            run_lengths(&words);
        }
    }

    #[test]
    fn transparent_pixels_become_white() {
        let code = ThumbnailEncoder::new().encode(
            &solid(2, 1, [0, 0, 0, 0]),
            CaptureRect::default(),
        );
        assert_eq!(code, "M4010 X2 Y1\nM4010 I0 T2 'ffff3002'\n");
    }

    #[test]
    fn single_pixel_is_a_literal() {
        let code = ThumbnailEncoder::new().encode(&solid(1, 1, [255, 0, 0, 255]), CaptureRect::default());
        assert_eq!(code, "M4010 X1 Y1\nM4010 I0 T1 'f800'\n");
    }

    #[test]
    fn large_capture_is_downscaled() {
        let image = solid(640, 480, [0, 0, 255, 255]);
        let rect = CaptureRect {
            start_x: 0,
            start_y: 0,
            end_x: 640,
            end_y: 480,
        };
        let code = ThumbnailEncoder::new().encode(&image, rect);
        assert_eq!(code.lines().next(), Some("M4010 X320 Y240"));
        let total: u64 = data_lines(&code).iter().map(|(_, count, _)| count).sum();
        assert_eq!(total, 320 * 240);
    }

    #[test]
    fn encoding_is_reproducible() {
        let image = noisy(90, 90);
        let encoder = ThumbnailEncoder::new();
        assert_eq!(
            encoder.encode(&image, CaptureRect::default()),
            encoder.encode(&image, CaptureRect::default())
        );
    }

    #[test]
    fn empty_capture_has_empty_data_line() {
        let rect = CaptureRect {
            start_x: 5,
            start_y: 5,
            end_x: 5,
            end_y: 5,
        };
        let code = ThumbnailEncoder::new().encode(&solid(10, 10, [0, 0, 0, 255]), rect);
        assert_eq!(code, "M4010 X0 Y0\nM4010 I0 T0 ''\n");
    }

    #[test]
    fn missing_image_file_is_an_image_error() {
        let err = ThumbnailEncoder::new()
            .encode_file(Path::new("/no/such/snapshot.png"))
            .unwrap_err();
        assert!(matches!(err, ChituLinkError::Image(_)));
    }
}

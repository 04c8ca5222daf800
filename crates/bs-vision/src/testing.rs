//! A scripted recogniser for tests: solid blocks of a known luma read as a known word.

use crate::text::{Charset, TextRecognizer, TextWord};
use anyhow::{bail, Result};
use bs_capture::Rect;
use image::{GrayImage, Luma, Pixel, Rgba, RgbaImage};
use imageproc::region_labelling::{connected_components, Connectivity};
use std::collections::BTreeMap;

/// Smallest block reported as a word, in pixels per side
const MIN_GLYPH: i32 = 4;

#[derive(Debug, Clone, Default)]
pub struct GlyphRecognizer {
    glyphs: Vec<(u8, String)>,
    fail: bool,
}

impl GlyphRecognizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// A recogniser whose backend always errors.
    pub fn failing() -> Self {
        Self {
            glyphs: Vec::new(),
            fail: true,
        }
    }

    /// Blocks painted in `color` read as `word`.
    pub fn glyph(mut self, color: Rgba<u8>, word: &str) -> Self {
        self.glyphs.push((color.to_luma()[0], word.to_string()));
        self
    }

    /// Fill `rect` of `image` with `color`.
    pub fn paint(image: &mut RgbaImage, rect: Rect, color: Rgba<u8>) {
        if let Some(r) = rect.clamp_to(image.width(), image.height()) {
            for y in r.y..r.bottom() {
                for x in r.x..r.right() {
                    image.put_pixel(x as u32, y as u32, color);
                }
            }
        }
    }
}

impl TextRecognizer for GlyphRecognizer {
    fn name(&self) -> &str {
        "glyph"
    }

    fn recognize(&self, image: &GrayImage, _charset: Charset) -> Result<Vec<TextWord>> {
        if self.fail {
            bail!("glyph backend scripted to fail");
        }

        let mut words = Vec::new();
        for (luma, word) in &self.glyphs {
            let mask = GrayImage::from_fn(image.width(), image.height(), |x, y| {
                if image.get_pixel(x, y)[0] == *luma {
                    Luma([255])
                } else {
                    Luma([0])
                }
            });
            let labels = connected_components(&mask, Connectivity::Eight, Luma([0u8]));

            let mut bounds: BTreeMap<u32, (u32, u32, u32, u32)> = BTreeMap::new();
            for (x, y, label) in labels.enumerate_pixels() {
                if label[0] == 0 {
                    continue;
                }
                let b = bounds.entry(label[0]).or_insert((x, y, x, y));
                b.0 = b.0.min(x);
                b.1 = b.1.min(y);
                b.2 = b.2.max(x);
                b.3 = b.3.max(y);
            }

            for (x0, y0, x1, y1) in bounds.into_values() {
                let rect = Rect::new(
                    x0 as i32,
                    y0 as i32,
                    (x1 - x0 + 1) as i32,
                    (y1 - y0 + 1) as i32,
                );
                if rect.w < MIN_GLYPH || rect.h < MIN_GLYPH {
                    continue;
                }
                words.push(TextWord {
                    text: word.clone(),
                    rect,
                    confidence: 0.93,
                });
            }
        }
        words.sort_by_key(|w| (w.rect.y, w.rect.x));
        Ok(words)
    }
}

use anyhow::{bail, Context, Result};
use bs_capture::Rect;
use image::GrayImage;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// Characters the recogniser may return
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Charset {
    Letters,
    Digits,
    /// Digits plus the separators of a coordinate readout
    Coordinates,
}

impl Charset {
    pub fn whitelist(&self) -> &'static str {
        match self {
            Charset::Letters => "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz",
            Charset::Digits => "0123456789",
            Charset::Coordinates => "0123456789,/- ",
        }
    }
}

/// One recognised word, in the coordinates of the image handed to the recogniser
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextWord {
    pub text: String,
    pub rect: Rect,
    /// 0.0-1.0
    pub confidence: f64,
}

/// Optical text recognition backend.
pub trait TextRecognizer: Send + Sync {
    fn name(&self) -> &str;

    fn is_available(&self) -> bool {
        true
    }

    fn recognize(&self, image: &GrayImage, charset: Charset) -> Result<Vec<TextWord>>;
}

/// Runs the Tesseract CLI in TSV mode.
/// Falls back gracefully when Tesseract is not installed.
pub struct TesseractRecognizer {
    command: String,
    available: bool,
    temp_dir: PathBuf,
    /// Upscale factor applied before recognition; boxes are mapped back.
    scale: f64,
    counter: AtomicU64,
}

impl TesseractRecognizer {
    pub fn new(command: &str, scale: f64) -> Self {
        let available = check_tesseract(command);
        if available {
            debug!("Tesseract OCR available");
        } else {
            warn!("Tesseract not found ({}). Text detection disabled.", command);
        }

        let temp_dir = std::env::temp_dir().join("bsbot_ocr");
        let _ = std::fs::create_dir_all(&temp_dir);

        Self {
            command: command.to_string(),
            available,
            temp_dir,
            scale: if scale > 0.0 { scale } else { 1.0 },
            counter: AtomicU64::new(0),
        }
    }
}

impl TextRecognizer for TesseractRecognizer {
    fn name(&self) -> &str {
        "tesseract"
    }

    fn is_available(&self) -> bool {
        self.available
    }

    fn recognize(&self, image: &GrayImage, charset: Charset) -> Result<Vec<TextWord>> {
        if !self.available {
            bail!("tesseract is not available");
        }
        if image.width() == 0 || image.height() == 0 {
            return Ok(Vec::new());
        }

        let scaled = if (self.scale - 1.0).abs() > f64::EPSILON {
            image::imageops::resize(
                image,
                ((image.width() as f64) * self.scale).round().max(1.0) as u32,
                ((image.height() as f64) * self.scale).round().max(1.0) as u32,
                image::imageops::FilterType::CatmullRom,
            )
        } else {
            image.clone()
        };

        // Unique per call, recognition may run from several threads
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let temp_path = self
            .temp_dir
            .join(format!("ocr_{}_{}.png", std::process::id(), n));
        scaled
            .save(&temp_path)
            .with_context(|| format!("Failed to write {}", temp_path.display()))?;

        let output = Command::new(&self.command)
            .arg(&temp_path)
            .arg("stdout")
            .arg("--psm")
            .arg("6") // Uniform block of text
            .arg("-c")
            .arg(format!("tessedit_char_whitelist={}", charset.whitelist()))
            .arg("tsv")
            .output();
        let _ = std::fs::remove_file(&temp_path);
        let output = output.with_context(|| format!("Failed to run {}", self.command))?;

        if !output.status.success() {
            bail!(
                "{} exited with {}: {}",
                self.command,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let tsv = String::from_utf8_lossy(&output.stdout);
        let words = parse_tsv(&tsv, self.scale);
        debug!("OCR: {} words", words.len());
        Ok(words)
    }
}

/// Parse Tesseract TSV output into words. Box coordinates are divided by `scale`.
fn parse_tsv(tsv: &str, scale: f64) -> Vec<TextWord> {
    let mut words = Vec::new();
    for line in tsv.lines().skip(1) {
        let cols: Vec<&str> = line.split('\t').collect();
        if cols.len() < 12 {
            continue;
        }
        // level 5 rows are words
        if cols[0] != "5" {
            continue;
        }
        let text = cols[11].trim();
        let conf: f64 = match cols[10].trim().parse() {
            Ok(c) => c,
            Err(_) => continue,
        };
        if text.is_empty() || conf < 0.0 {
            continue;
        }
        let nums: Vec<f64> = cols[6..10]
            .iter()
            .filter_map(|c| c.trim().parse::<f64>().ok())
            .collect();
        if nums.len() != 4 {
            continue;
        }
        words.push(TextWord {
            text: text.to_string(),
            rect: Rect::new(
                (nums[0] / scale).round() as i32,
                (nums[1] / scale).round() as i32,
                (nums[2] / scale).round() as i32,
                (nums[3] / scale).round() as i32,
            ),
            confidence: (conf / 100.0).clamp(0.0, 1.0),
        });
    }
    words
}

/// Check if Tesseract is installed and accessible
fn check_tesseract(command: &str) -> bool {
    Command::new(command)
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "level\tpage_num\tblock_num\tpar_num\tline_num\tword_num\tleft\ttop\twidth\theight\tconf\ttext
1\t1\t0\t0\t0\t0\t0\t0\t300\t90\t-1\t
4\t1\t1\t1\t1\t0\t15\t30\t240\t30\t-1\t
5\t1\t1\t1\t1\t1\t15\t30\t120\t30\t91.5\tWendigo
5\t1\t1\t1\t1\t2\t150\t30\t105\t30\t88\tAttack
5\t1\t1\t1\t1\t3\t0\t0\t3\t3\t-1\t ";

    #[test]
    fn test_parse_tsv_words() {
        let words = parse_tsv(SAMPLE, 1.5);
        assert_eq!(words.len(), 2);
        assert_eq!(words[0].text, "Wendigo");
        assert_eq!(words[0].rect, Rect::new(10, 20, 80, 20));
        assert!((words[0].confidence - 0.915).abs() < 1e-9);
        assert_eq!(words[1].rect, Rect::new(100, 20, 70, 20));
    }

    #[test]
    fn test_parse_tsv_garbage() {
        assert!(parse_tsv("", 1.0).is_empty());
        assert!(parse_tsv("header\n5\tbroken", 1.0).is_empty());
    }

    #[test]
    fn test_missing_binary_is_unavailable() {
        let ocr = TesseractRecognizer::new("definitely-not-tesseract-xyz", 1.5);
        assert!(!ocr.is_available());
        let img = GrayImage::new(10, 10);
        assert!(ocr.recognize(&img, Charset::Letters).is_err());
    }
}

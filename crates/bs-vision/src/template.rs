use crate::nms::non_max_suppression;
use crate::{DetectionBox, Method};
use anyhow::{bail, Context, Result};
use bs_capture::Rect;
use image::{GrayImage, Luma};
use imageproc::edges::canny;
use imageproc::integral_image::{integral_image, integral_squared_image};
use std::path::Path;
use tracing::debug;

/// Canny hysteresis thresholds for the edge representation
const EDGE_LOW: f32 = 80.0;
const EDGE_HIGH: f32 = 160.0;

/// A template prepared for sliding correlation, in gray and edge form.
#[derive(Debug, Clone)]
pub struct Template {
    pub id: String,
    gray: GrayImage,
    edges: GrayImage,
}

impl Template {
    /// Load and pre-process a template image
    pub fn load(path: &Path, id: &str) -> Result<Self> {
        let img = image::open(path)
            .with_context(|| format!("Failed to open template {}", path.display()))?;
        Self::from_gray(id, img.to_luma8())
    }

    pub fn from_gray(id: &str, gray: GrayImage) -> Result<Self> {
        let (w, h) = gray.dimensions();
        if w < 3 || h < 3 {
            bail!("Template {} is too small ({}x{})", id, w, h);
        }
        let (_, std_dev) = compute_stats(&gray);
        if std_dev < 1e-6 {
            bail!("Template {} is uniform and cannot be correlated", id);
        }
        let edges = canny(&gray, EDGE_LOW, EDGE_HIGH);
        Ok(Self {
            id: id.to_string(),
            gray,
            edges,
        })
    }

    pub fn width(&self) -> u32 {
        self.gray.width()
    }

    pub fn height(&self) -> u32 {
        self.gray.height()
    }

    pub fn gray(&self) -> &GrayImage {
        &self.gray
    }
}

/// Correlation score for every placement of a template inside an image.
/// `width`/`height` count placements, not pixels.
#[derive(Debug, Clone)]
pub struct ScoreMap {
    pub width: u32,
    pub height: u32,
    scores: Vec<f32>,
}

impl ScoreMap {
    pub fn get(&self, x: u32, y: u32) -> f32 {
        self.scores[(y * self.width + x) as usize]
    }

    pub fn max(&self) -> Option<(u32, u32, f32)> {
        let (idx, score) = self
            .scores
            .iter()
            .copied()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))?;
        let idx = idx as u32;
        Some((idx % self.width, idx / self.width, score))
    }

    /// Placements scoring at least `threshold` that are not beaten by any 8-neighbour.
    pub fn peaks(&self, threshold: f32) -> Vec<(u32, u32, f32)> {
        let mut peaks = Vec::new();
        for y in 0..self.height {
            for x in 0..self.width {
                let score = self.get(x, y);
                if score < threshold {
                    continue;
                }
                let mut is_peak = true;
                'neighbours: for dy in -1i64..=1 {
                    for dx in -1i64..=1 {
                        if dx == 0 && dy == 0 {
                            continue;
                        }
                        let nx = x as i64 + dx;
                        let ny = y as i64 + dy;
                        if nx < 0 || ny < 0 || nx >= self.width as i64 || ny >= self.height as i64 {
                            continue;
                        }
                        if self.get(nx as u32, ny as u32) > score {
                            is_peak = false;
                            break 'neighbours;
                        }
                    }
                }
                if is_peak {
                    peaks.push((x, y, score));
                }
            }
        }
        peaks
    }
}

/// Compute mean and standard deviation of pixel values
fn compute_stats(img: &GrayImage) -> (f64, f64) {
    let pixels: Vec<f64> = img.pixels().map(|p| p[0] as f64).collect();
    let n = pixels.len() as f64;
    if n == 0.0 {
        return (0.0, 0.0);
    }
    let mean = pixels.iter().sum::<f64>() / n;
    let variance = pixels.iter().map(|p| (p - mean).powi(2)).sum::<f64>() / n;
    (mean, variance.sqrt())
}

/// Zero-mean normalized cross-correlation of `tmpl` slid over `image`.
/// Window sums come from integral images, so only the cross term is per-pixel.
/// Flat windows score 0. `None` when the template does not fit.
pub fn zncc_map(image: &GrayImage, tmpl: &GrayImage) -> Option<ScoreMap> {
    let (iw, ih) = image.dimensions();
    let (tw, th) = tmpl.dimensions();
    if tw == 0 || th == 0 || tw > iw || th > ih {
        return None;
    }

    let (t_mean, t_std) = compute_stats(tmpl);
    let n = (tw * th) as f64;
    let t_norm = t_std * n.sqrt();
    let (mw, mh) = (iw - tw + 1, ih - th + 1);
    if t_norm < 1e-9 {
        return Some(ScoreMap {
            width: mw,
            height: mh,
            scores: vec![0.0; (mw * mh) as usize],
        });
    }
    let t_zero: Vec<f64> = tmpl.pixels().map(|p| p[0] as f64 - t_mean).collect();

    let sums = integral_image::<Luma<u8>, u64>(image);
    let squares = integral_squared_image::<Luma<u8>, u64>(image);
    let window = |integral: &image::ImageBuffer<Luma<u64>, Vec<u64>>, x: u32, y: u32| -> f64 {
        let a = integral.get_pixel(x, y)[0];
        let b = integral.get_pixel(x + tw, y)[0];
        let c = integral.get_pixel(x, y + th)[0];
        let d = integral.get_pixel(x + tw, y + th)[0];
        ((a + d) - (b + c)) as f64
    };

    let raw = image.as_raw();
    let stride = iw as usize;
    let mut scores = Vec::with_capacity((mw * mh) as usize);
    for y in 0..mh {
        for x in 0..mw {
            let s = window(&sums, x, y);
            let sq = window(&squares, x, y);
            let var = sq - s * s / n;
            if var <= 1e-6 {
                scores.push(0.0);
                continue;
            }
            // sum(I * T') == sum((I - mean_I) * T') since T' is zero-mean
            let mut cross = 0.0;
            for j in 0..th as usize {
                let row = (y as usize + j) * stride + x as usize;
                let trow = j * tw as usize;
                for i in 0..tw as usize {
                    cross += raw[row + i] as f64 * t_zero[trow + i];
                }
            }
            scores.push((cross / (var.sqrt() * t_norm)) as f32);
        }
    }

    Some(ScoreMap {
        width: mw,
        height: mh,
        scores,
    })
}

/// Find every placement of `template` in `haystack` whose gray or edge
/// correlation reaches `threshold`, deduplicated and capped at `max_instances`.
pub fn match_template(
    haystack: &GrayImage,
    template: &Template,
    threshold: f64,
    iou_threshold: f64,
    max_instances: usize,
) -> Vec<DetectionBox> {
    let (hw, hh) = haystack.dimensions();
    if template.width() > hw || template.height() > hh {
        return Vec::new();
    }

    let mut candidates = Vec::new();
    let (tw, th) = (template.width() as i32, template.height() as i32);
    let mut collect = |map: Option<ScoreMap>| {
        if let Some(map) = map {
            for (x, y, score) in map.peaks(threshold as f32) {
                candidates.push(DetectionBox::new(
                    Rect::new(x as i32, y as i32, tw, th),
                    (score as f64).clamp(0.0, 1.0),
                    Method::Template,
                    template.id.as_str(),
                ));
            }
        }
    };

    collect(zncc_map(haystack, &template.gray));
    let hay_edges = canny(haystack, EDGE_LOW, EDGE_HIGH);
    collect(zncc_map(&hay_edges, &template.edges));

    let mut kept = non_max_suppression(candidates, iou_threshold);
    kept.truncate(max_instances);
    debug!(
        "Template {}: {} matches >= {:.2}",
        template.id,
        kept.len(),
        threshold
    );
    kept
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Zero-mean normalized cross-correlation between two same-sized images.
    fn normalized_cross_correlation(
        img: &GrayImage,
        img_mean: f64,
        img_std: f64,
        tmpl: &GrayImage,
        tmpl_mean: f64,
        tmpl_std: f64,
    ) -> f64 {
        let denom = img_std * tmpl_std;
        if denom < 1e-10 {
            return 0.0;
        }
        let n = (img.width() * img.height()) as f64;
        let cross: f64 = img
            .pixels()
            .zip(tmpl.pixels())
            .map(|(ip, tp)| (ip[0] as f64 - img_mean) * (tp[0] as f64 - tmpl_mean))
            .sum();
        cross / (n * denom)
    }

    pub(crate) fn textured(w: u32, h: u32) -> GrayImage {
        GrayImage::from_fn(w, h, |x, y| Luma([((x * 37 + y * 91 + x * y * 3) % 251) as u8]))
    }

    /// Uniform background with `patch` pasted at (px, py).
    pub(crate) fn scene(w: u32, h: u32, patch: &GrayImage, px: u32, py: u32) -> GrayImage {
        let mut img = GrayImage::from_pixel(w, h, Luma([40]));
        image::imageops::replace(&mut img, patch, px as i64, py as i64);
        img
    }

    #[test]
    fn test_map_agrees_with_direct_ncc() {
        let img = textured(30, 20);
        let tmpl = image::imageops::crop_imm(&img, 7, 4, 10, 8).to_image();
        let map = zncc_map(&img, &tmpl).unwrap();

        for (x, y) in [(0u32, 0u32), (7, 4), (12, 9), (20, 12)] {
            let window = image::imageops::crop_imm(&img, x, y, 10, 8).to_image();
            let (wm, ws) = compute_stats(&window);
            let (tm, ts) = compute_stats(&tmpl);
            let direct = normalized_cross_correlation(&window, wm, ws, &tmpl, tm, ts);
            assert!(
                (map.get(x, y) as f64 - direct).abs() < 1e-3,
                "placement ({}, {}): map {} direct {}",
                x,
                y,
                map.get(x, y),
                direct
            );
        }
        let (bx, by, best) = map.max().unwrap();
        assert_eq!((bx, by), (7, 4));
        assert!(best > 0.999);
    }

    #[test]
    fn test_flat_windows_score_zero() {
        let img = GrayImage::from_pixel(20, 20, Luma([90]));
        let map = zncc_map(&img, &textured(5, 5)).unwrap();
        assert_eq!(map.max().unwrap().2, 0.0);
    }

    #[test]
    fn test_template_larger_than_image() {
        assert!(zncc_map(&textured(5, 5), &textured(6, 5)).is_none());
    }

    #[test]
    fn test_match_template_finds_instances() {
        let patch = textured(16, 10);
        let mut img = scene(120, 60, &patch, 10, 12);
        image::imageops::replace(&mut img, &patch, 80, 40);
        let template = Template::from_gray("nameplate", patch).unwrap();

        let matches = match_template(&img, &template, 0.78, 0.5, 10);
        assert_eq!(matches.len(), 2);
        let mut origins: Vec<(i32, i32)> = matches.iter().map(|m| (m.x, m.y)).collect();
        origins.sort();
        assert_eq!(origins, vec![(10, 12), (80, 40)]);
        assert!(matches.iter().all(|m| m.score > 0.95 && m.label == "nameplate"));
    }

    #[test]
    fn test_match_template_none_on_blank() {
        let template = Template::from_gray("nameplate", textured(16, 10)).unwrap();
        let img = GrayImage::from_pixel(80, 40, Luma([40]));
        assert!(match_template(&img, &template, 0.78, 0.5, 10).is_empty());
    }

    #[test]
    fn test_uniform_template_rejected() {
        assert!(Template::from_gray("flat", GrayImage::from_pixel(8, 8, Luma([10]))).is_err());
    }
}

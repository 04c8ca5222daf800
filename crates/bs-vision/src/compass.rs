use crate::color::RedMask;
use image::{Luma, RgbaImage};
use imageproc::region_labelling::{connected_components, Connectivity};
use std::collections::HashMap;

/// Estimates the compass needle direction from the red needle blob.
#[derive(Debug, Clone)]
pub struct NeedleEstimator {
    /// Smallest blob, in pixels, accepted as the needle
    pub min_area: u32,
    pub mask: RedMask,
}

impl Default for NeedleEstimator {
    fn default() -> Self {
        Self::new(150)
    }
}

impl NeedleEstimator {
    pub fn new(min_area: u32) -> Self {
        Self {
            min_area,
            mask: RedMask::NEEDLE,
        }
    }

    /// Needle angle in degrees, 0 = north, positive = clockwise.
    /// Measured from the blob centroid to its farthest pixel (the tip).
    pub fn estimate(&self, image: &RgbaImage) -> Option<f64> {
        if image.width() == 0 || image.height() == 0 {
            return None;
        }
        let mask = self.mask.mask(image);
        let labels = connected_components(&mask, Connectivity::Eight, Luma([0u8]));

        let mut areas: HashMap<u32, u32> = HashMap::new();
        for p in labels.pixels() {
            if p[0] != 0 {
                *areas.entry(p[0]).or_insert(0) += 1;
            }
        }
        let (&needle, &area) = areas.iter().max_by_key(|(label, area)| (**area, std::cmp::Reverse(**label)))?;
        if area < self.min_area {
            return None;
        }

        let pixels: Vec<(f64, f64)> = labels
            .enumerate_pixels()
            .filter(|(_, _, p)| p[0] == needle)
            .map(|(x, y, _)| (x as f64, y as f64))
            .collect();
        let n = pixels.len() as f64;
        let cx = pixels.iter().map(|p| p.0).sum::<f64>() / n;
        let cy = pixels.iter().map(|p| p.1).sum::<f64>() / n;

        let (tx, ty) = pixels.iter().copied().max_by(|a, b| {
            let da = (a.0 - cx).powi(2) + (a.1 - cy).powi(2);
            let db = (b.0 - cx).powi(2) + (b.1 - cy).powi(2);
            da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
        })?;
        let (dx, dy) = (tx - cx, ty - cy);
        if dx == 0.0 && dy == 0.0 {
            return None;
        }
        Some(dx.atan2(-dy).to_degrees())
    }
}

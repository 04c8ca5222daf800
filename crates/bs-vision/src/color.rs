use image::{GrayImage, Luma, RgbaImage};
use imageproc::filter::median_filter;

/// HSV of an 8-bit RGB pixel: hue in degrees [0, 360), saturation and value in [0, 255].
pub fn rgb_to_hsv(r: u8, g: u8, b: u8) -> (f64, f64, f64) {
    let (r, g, b) = (r as f64, g as f64, b as f64);
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;

    let hue = if delta == 0.0 {
        0.0
    } else if max == r {
        60.0 * (((g - b) / delta).rem_euclid(6.0))
    } else if max == g {
        60.0 * ((b - r) / delta + 2.0)
    } else {
        60.0 * ((r - g) / delta + 4.0)
    };
    let saturation = if max == 0.0 { 0.0 } else { delta / max * 255.0 };
    (hue, saturation, max)
}

/// Isolates saturated red pixels: hue in [0, low_hue_max] or [high_hue_min, 360).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RedMask {
    pub low_hue_max: f64,
    pub high_hue_min: f64,
    pub min_saturation: f64,
    pub min_value: f64,
}

impl RedMask {
    /// Red monster nameplates
    pub const NAMEPLATE: RedMask = RedMask {
        low_hue_max: 20.0,
        high_hue_min: 340.0,
        min_saturation: 120.0,
        min_value: 120.0,
    };

    /// Compass needle, slightly wider band
    pub const NEEDLE: RedMask = RedMask {
        low_hue_max: 24.0,
        high_hue_min: 336.0,
        min_saturation: 110.0,
        min_value: 120.0,
    };

    pub fn matches(&self, r: u8, g: u8, b: u8) -> bool {
        let (h, s, v) = rgb_to_hsv(r, g, b);
        (h <= self.low_hue_max || h >= self.high_hue_min)
            && s >= self.min_saturation
            && v >= self.min_value
    }

    /// Binary mask (255 = red), cleaned with a 3x3 median filter.
    pub fn mask(&self, image: &RgbaImage) -> GrayImage {
        let raw = GrayImage::from_fn(image.width(), image.height(), |x, y| {
            let p = image.get_pixel(x, y);
            if self.matches(p[0], p[1], p[2]) {
                Luma([255])
            } else {
                Luma([0])
            }
        });
        median_filter(&raw, 1, 1)
    }

    /// Grayscale image with everything outside the mask blacked out.
    pub fn isolate(&self, image: &RgbaImage) -> GrayImage {
        let mask = self.mask(image);
        let gray = image::imageops::grayscale(image);
        GrayImage::from_fn(image.width(), image.height(), |x, y| {
            if mask.get_pixel(x, y)[0] > 0 {
                *gray.get_pixel(x, y)
            } else {
                Luma([0])
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    #[test]
    fn test_hsv_primaries() {
        assert_eq!(rgb_to_hsv(255, 0, 0), (0.0, 255.0, 255.0));
        assert_eq!(rgb_to_hsv(0, 255, 0).0, 120.0);
        assert_eq!(rgb_to_hsv(0, 0, 255).0, 240.0);
        assert_eq!(rgb_to_hsv(128, 128, 128), (0.0, 0.0, 128.0));
    }

    #[test]
    fn test_red_bands() {
        assert!(RedMask::NAMEPLATE.matches(220, 30, 30));
        // magenta-ish red wraps around 360
        assert!(RedMask::NAMEPLATE.matches(220, 20, 50));
        assert!(!RedMask::NAMEPLATE.matches(230, 230, 230));
        assert!(!RedMask::NAMEPLATE.matches(220, 160, 30));
        // too dark
        assert!(!RedMask::NAMEPLATE.matches(90, 5, 5));
    }

    #[test]
    fn test_mask_drops_speckles() {
        let mut img = RgbaImage::from_pixel(30, 20, Rgba([0, 0, 0, 255]));
        for y in 5..15 {
            for x in 5..20 {
                img.put_pixel(x, y, Rgba([220, 30, 30, 255]));
            }
        }
        img.put_pixel(27, 2, Rgba([220, 30, 30, 255]));

        let mask = RedMask::NAMEPLATE.mask(&img);
        assert_eq!(mask.get_pixel(10, 10)[0], 255);
        assert_eq!(mask.get_pixel(27, 2)[0], 0);

        let isolated = RedMask::NAMEPLATE.isolate(&img);
        assert!(isolated.get_pixel(10, 10)[0] > 0);
        assert_eq!(isolated.get_pixel(0, 0)[0], 0);
    }
}

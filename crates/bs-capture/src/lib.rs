use anyhow::Result;
use image::RgbaImage;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

mod replay;
#[cfg(feature = "window")]
mod window;

pub use replay::ReplaySource;
#[cfg(feature = "window")]
pub use window::WindowSource;

/// Normalized screen region (0.0-1.0 coordinates relative to the captured frame)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScreenRegion {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl ScreenRegion {
    pub const FULL: ScreenRegion = ScreenRegion {
        x: 0.0,
        y: 0.0,
        width: 1.0,
        height: 1.0,
    };

    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Pixel rectangle for a frame of the given size, clamped to the frame.
    pub fn to_rect(&self, frame_width: u32, frame_height: u32) -> Rect {
        let (w, h) = (frame_width as f64, frame_height as f64);
        let x = (self.x * w).round().clamp(0.0, w) as i32;
        let y = (self.y * h).round().clamp(0.0, h) as i32;
        let rw = (self.width * w).round().max(0.0) as i32;
        let rh = (self.height * h).round().max(0.0) as i32;
        Rect::new(
            x,
            y,
            rw.min(frame_width as i32 - x),
            rh.min(frame_height as i32 - y),
        )
    }

    pub fn from_rect(rect: &Rect, frame_width: u32, frame_height: u32) -> Self {
        let (w, h) = (frame_width.max(1) as f64, frame_height.max(1) as f64);
        Self {
            x: rect.x as f64 / w,
            y: rect.y as f64 / h,
            width: rect.w as f64 / w,
            height: rect.h as f64 / h,
        }
    }
}

/// Well-known HUD regions, as fractions of the game window
pub mod regions {
    use super::ScreenRegion;

    /// Right-hand panel that lists the prepare options and weapon slots.
    pub fn prepare_panel() -> ScreenRegion {
        ScreenRegion::new(0.55, 0.07, 0.43, 0.86)
    }

    /// Bottom bar that shows the special attacks during a fight.
    pub fn battle_bar() -> ScreenRegion {
        ScreenRegion::new(0.10, 0.83, 0.80, 0.15)
    }

    /// Coordinate readout under the opened minimap.
    pub fn minimap_coords() -> ScreenRegion {
        ScreenRegion::new(0.79, 0.40, 0.16, 0.10)
    }

    pub fn compass() -> ScreenRegion {
        ScreenRegion::new(0.90, 0.02, 0.08, 0.12)
    }
}

/// Axis-aligned pixel rectangle. Coordinates may be negative before clamping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
}

impl Rect {
    pub fn new(x: i32, y: i32, w: i32, h: i32) -> Self {
        Self { x, y, w, h }
    }

    pub fn right(&self) -> i32 {
        self.x + self.w
    }

    pub fn bottom(&self) -> i32 {
        self.y + self.h
    }

    pub fn area(&self) -> i64 {
        self.w.max(0) as i64 * self.h.max(0) as i64
    }

    pub fn is_empty(&self) -> bool {
        self.w <= 0 || self.h <= 0
    }

    pub fn center(&self) -> (f64, f64) {
        (
            self.x as f64 + self.w as f64 / 2.0,
            self.y as f64 + self.h as f64 / 2.0,
        )
    }

    pub fn translate(&self, dx: i32, dy: i32) -> Rect {
        Rect::new(self.x + dx, self.y + dy, self.w, self.h)
    }

    pub fn intersection(&self, other: &Rect) -> Option<Rect> {
        let x0 = self.x.max(other.x);
        let y0 = self.y.max(other.y);
        let x1 = self.right().min(other.right());
        let y1 = self.bottom().min(other.bottom());
        let overlap = Rect::new(x0, y0, x1 - x0, y1 - y0);
        if overlap.is_empty() {
            return None;
        }
        Some(overlap)
    }

    pub fn union(&self, other: &Rect) -> Rect {
        let x0 = self.x.min(other.x);
        let y0 = self.y.min(other.y);
        let x1 = self.right().max(other.right());
        let y1 = self.bottom().max(other.bottom());
        Rect::new(x0, y0, x1 - x0, y1 - y0)
    }

    /// Intersection over union, 0.0 for disjoint or empty boxes.
    pub fn iou(&self, other: &Rect) -> f64 {
        let inter = match self.intersection(other) {
            Some(r) => r.area(),
            None => return 0.0,
        };
        let union = self.area() + other.area() - inter;
        if union <= 0 {
            return 0.0;
        }
        inter as f64 / union as f64
    }

    pub fn contains_rect(&self, other: &Rect) -> bool {
        other.x >= self.x
            && other.y >= self.y
            && other.right() <= self.right()
            && other.bottom() <= self.bottom()
    }

    /// Clip to a `width` x `height` frame. `None` when nothing remains.
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<Rect> {
        self.intersection(&Rect::new(0, 0, width as i32, height as i32))
    }
}

/// One captured screen image plus where and when it was taken.
#[derive(Debug, Clone)]
pub struct Frame {
    pub image: RgbaImage,
    /// Screen position of the frame's top-left pixel.
    pub origin: (i32, i32),
    /// Seconds since the unix epoch.
    pub timestamp: f64,
}

impl Frame {
    pub fn new(image: RgbaImage, origin: (i32, i32), timestamp: f64) -> Self {
        Self {
            image,
            origin,
            timestamp,
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Frame pixel position to absolute screen position.
    pub fn to_screen(&self, x: i32, y: i32) -> (i32, i32) {
        (self.origin.0 + x, self.origin.1 + y)
    }
}

/// Anything that can hand out frames: a live window, a replay directory, a test fixture.
pub trait FrameSource: Send {
    fn describe(&self) -> String;

    /// Next frame, or `Ok(None)` when the source has nothing to offer right now.
    fn grab(&mut self) -> Result<Option<Frame>>;
}

/// Status of the capture pipeline
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CaptureStatus {
    pub is_capturing: bool,
    pub source_found: bool,
    pub source: Option<String>,
    pub fps: f64,
    pub last_capture_time: Option<u64>,
    pub resolution: Option<(u32, u32)>,
}

pub fn now_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Crop a region from a captured frame using normalized coordinates
pub fn crop_region(frame: &RgbaImage, region: &ScreenRegion) -> RgbaImage {
    let rect = region.to_rect(frame.width(), frame.height());
    crop_rect(frame, &rect).unwrap_or_else(|| RgbaImage::new(0, 0))
}

/// Crop a pixel rectangle, clipped to the image. `None` when the clip is empty.
pub fn crop_rect(frame: &RgbaImage, rect: &Rect) -> Option<RgbaImage> {
    let clipped = rect.clamp_to(frame.width(), frame.height())?;
    Some(
        image::imageops::crop_imm(
            frame,
            clipped.x as u32,
            clipped.y as u32,
            clipped.w as u32,
            clipped.h as u32,
        )
        .to_image(),
    )
}

/// The capture loop that runs as a background task.
/// Publishes only the latest frame; a slow consumer never sees a backlog.
pub async fn capture_loop(
    mut source: Box<dyn FrameSource>,
    frame_tx: watch::Sender<Option<Arc<Frame>>>,
    status_tx: watch::Sender<CaptureStatus>,
    capture_interval: Duration,
    stop: Arc<AtomicBool>,
) {
    info!(
        "Capture loop started, source: {}, interval: {:?}",
        source.describe(),
        capture_interval
    );

    let mut frame_count = 0u64;
    let mut fps_timer = Instant::now();

    loop {
        if stop.load(Ordering::Relaxed) {
            info!("Capture loop stopping (stop signal received)");
            break;
        }
        let tick = Instant::now();
        let name = source.describe();

        // Sources are sync (xcap, png decode), grab on a blocking thread
        let grabbed = tokio::task::spawn_blocking(move || {
            let result = source.grab();
            (source, result)
        })
        .await;

        let result = match grabbed {
            Ok((returned, result)) => {
                source = returned;
                result
            }
            Err(e) => {
                warn!("Capture task panicked: {}", e);
                break;
            }
        };

        match result {
            Ok(Some(frame)) => {
                let resolution = (frame.width(), frame.height());
                frame_count += 1;

                let elapsed = fps_timer.elapsed().as_secs_f64();
                let fps = if elapsed > 0.0 {
                    frame_count as f64 / elapsed
                } else {
                    0.0
                };
                if elapsed > 5.0 {
                    frame_count = 0;
                    fps_timer = Instant::now();
                }

                let _ = status_tx.send(CaptureStatus {
                    is_capturing: true,
                    source_found: true,
                    source: Some(name),
                    fps,
                    last_capture_time: Some((frame.timestamp * 1000.0) as u64),
                    resolution: Some(resolution),
                });
                let _ = frame_tx.send(Some(Arc::new(frame)));
            }
            Ok(None) => {
                debug!("No frame from {}", name);
                let _ = status_tx.send(CaptureStatus {
                    source: Some(name),
                    ..CaptureStatus::default()
                });
            }
            Err(e) => {
                warn!("Capture failed: {:#}", e);
                let _ = status_tx.send(CaptureStatus {
                    source_found: true,
                    source: Some(name),
                    ..CaptureStatus::default()
                });
            }
        }

        let elapsed = tick.elapsed();
        if elapsed < capture_interval {
            tokio::time::sleep(capture_interval - elapsed).await;
        } else {
            // Yield to prevent busy loop
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    let _ = status_tx.send(CaptureStatus::default());
    info!("Capture loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hud_regions_inside_window() {
        for region in [
            regions::prepare_panel(),
            regions::battle_bar(),
            regions::minimap_coords(),
            regions::compass(),
        ] {
            assert!(region.x >= 0.0 && region.y >= 0.0);
            assert!(region.x + region.width <= 1.01);
            assert!(region.y + region.height <= 1.01);
        }
    }

    #[test]
    fn test_crop_region() {
        let img = RgbaImage::new(1920, 1080);
        let region = ScreenRegion {
            x: 0.5,
            y: 0.5,
            width: 0.1,
            height: 0.1,
        };
        let cropped = crop_region(&img, &region);
        assert_eq!(cropped.width(), 192);
        assert_eq!(cropped.height(), 108);
    }

    #[test]
    fn test_crop_rect_clips_to_frame() {
        let img = RgbaImage::new(100, 50);
        let cropped = crop_rect(&img, &Rect::new(90, -10, 40, 30)).unwrap();
        assert_eq!((cropped.width(), cropped.height()), (10, 20));
        assert!(crop_rect(&img, &Rect::new(200, 0, 10, 10)).is_none());
    }

    #[test]
    fn test_rect_iou() {
        let a = Rect::new(0, 0, 10, 10);
        let b = Rect::new(5, 0, 10, 10);
        assert!((a.iou(&b) - 50.0 / 150.0).abs() < 1e-9);
        assert_eq!(a.iou(&Rect::new(20, 20, 5, 5)), 0.0);
        assert_eq!(a.iou(&a), 1.0);
    }

    #[test]
    fn test_rect_union_and_contains() {
        let a = Rect::new(10, 10, 20, 10);
        let b = Rect::new(25, 5, 10, 10);
        let u = a.union(&b);
        assert_eq!(u, Rect::new(10, 5, 25, 15));
        assert!(u.contains_rect(&a) && u.contains_rect(&b));
        assert!(!a.contains_rect(&u));
    }

    #[test]
    fn test_touching_or_degenerate_rects_do_not_intersect() {
        let a = Rect::new(0, 0, 10, 10);
        assert_eq!(a.intersection(&Rect::new(10, 0, 5, 5)), None);
        assert_eq!(a.intersection(&Rect::new(2, 2, 0, 4)), None);
        assert_eq!(a.intersection(&Rect::new(8, 8, 5, 5)), Some(Rect::new(8, 8, 2, 2)));
        assert!(Rect::new(3, 3, 0, 7).is_empty());
        assert_eq!(Rect::new(-5, -5, 4, 4).clamp_to(10, 10), None);
    }

    #[test]
    fn test_region_round_trips_through_rect() {
        let region = ScreenRegion::new(0.25, 0.5, 0.5, 0.25);
        let rect = region.to_rect(800, 600);
        assert_eq!(rect, Rect::new(200, 300, 400, 150));
        assert_eq!(ScreenRegion::from_rect(&rect, 800, 600), region);
    }

    #[test]
    fn test_frame_to_screen() {
        let frame = Frame::new(RgbaImage::new(10, 10), (100, 200), 0.0);
        assert_eq!(frame.to_screen(3, 4), (103, 204));
    }

    struct Counting(u32);

    impl FrameSource for Counting {
        fn describe(&self) -> String {
            "counting".into()
        }

        fn grab(&mut self) -> Result<Option<Frame>> {
            self.0 += 1;
            Ok(Some(Frame::new(RgbaImage::new(4, 4), (0, 0), self.0 as f64)))
        }
    }

    #[tokio::test]
    async fn test_capture_loop_publishes_latest_frame() {
        let (frame_tx, mut frame_rx) = watch::channel(None);
        let (status_tx, status_rx) = watch::channel(CaptureStatus::default());
        let stop = Arc::new(AtomicBool::new(false));

        let handle = tokio::spawn(capture_loop(
            Box::new(Counting(0)),
            frame_tx,
            status_tx,
            Duration::from_millis(5),
            stop.clone(),
        ));

        frame_rx.changed().await.unwrap();
        let first = frame_rx.borrow_and_update().clone().unwrap();
        assert!(first.timestamp >= 1.0);
        assert!(status_rx.borrow().is_capturing);

        stop.store(true, Ordering::Relaxed);
        handle.await.unwrap();
    }
}

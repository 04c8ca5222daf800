use crate::{crop_region, now_secs, Frame, FrameSource, ScreenRegion};
use anyhow::{Context, Result};
use tracing::{debug, warn};
use xcap::Window;

/// Live capture of the game client window.
pub struct WindowSource {
    titles: Vec<String>,
    region: ScreenRegion,
}

impl WindowSource {
    /// `titles` are matched case-insensitively as substrings of window titles.
    pub fn new(titles: Vec<String>, region: ScreenRegion) -> Self {
        Self {
            titles: titles.into_iter().map(|t| t.to_lowercase()).collect(),
            region,
        }
    }

    fn find_window(&self) -> Option<Window> {
        let windows = match Window::all() {
            Ok(w) => w,
            Err(e) => {
                warn!("Failed to enumerate windows: {}", e);
                return None;
            }
        };

        for window in windows {
            let title = match window.title() {
                Ok(t) => t.to_lowercase(),
                Err(_) => continue,
            };
            if self.titles.iter().any(|t| title.contains(t.as_str())) {
                debug!("Found game window: {}", title);
                return Some(window);
            }
        }
        None
    }
}

impl FrameSource for WindowSource {
    fn describe(&self) -> String {
        format!("[Window] {}", self.titles.join(" | "))
    }

    fn grab(&mut self) -> Result<Option<Frame>> {
        let window = match self.find_window() {
            Some(w) => w,
            None => return Ok(None),
        };
        let full = window
            .capture_image()
            .context("Failed to capture window image")?;
        let win_x = window.x().unwrap_or(0);
        let win_y = window.y().unwrap_or(0);

        let rect = self.region.to_rect(full.width(), full.height());
        let image = crop_region(&full, &self.region);
        Ok(Some(Frame::new(
            image,
            (win_x + rect.x, win_y + rect.y),
            now_secs(),
        )))
    }
}

use crate::{crop_region, now_secs, Frame, FrameSource, ScreenRegion};
use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Plays back a directory of recorded PNG frames in file-name order,
/// with the same interface as a live window capture.
pub struct ReplaySource {
    dir: PathBuf,
    files: Vec<PathBuf>,
    next: usize,
    looped: bool,
    region: Option<ScreenRegion>,
}

impl ReplaySource {
    pub fn open(dir: &Path, looped: bool) -> Result<Self> {
        let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
            .with_context(|| format!("Failed to read replay dir {}", dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.extension()
                    .map(|ext| ext.eq_ignore_ascii_case("png"))
                    .unwrap_or(false)
            })
            .collect();
        files.sort();

        if files.is_empty() {
            bail!("No PNG frames in {}", dir.display());
        }
        info!("Replay source: {} frames from {}", files.len(), dir.display());

        Ok(Self {
            dir: dir.to_path_buf(),
            files,
            next: 0,
            looped,
            region: None,
        })
    }

    /// Only hand out this part of each recorded frame.
    pub fn with_region(mut self, region: ScreenRegion) -> Self {
        self.region = Some(region);
        self
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl FrameSource for ReplaySource {
    fn describe(&self) -> String {
        format!("[Replay] {}", self.dir.display())
    }

    fn grab(&mut self) -> Result<Option<Frame>> {
        if self.next >= self.files.len() {
            if !self.looped {
                return Ok(None);
            }
            self.next = 0;
        }
        let path = &self.files[self.next];
        self.next += 1;

        let image = match image::open(path) {
            Ok(img) => img.to_rgba8(),
            Err(e) => {
                warn!("Skipping unreadable frame {}: {}", path.display(), e);
                return Ok(None);
            }
        };

        let (image, origin) = match &self.region {
            Some(region) => {
                let rect = region.to_rect(image.width(), image.height());
                (crop_region(&image, region), (rect.x, rect.y))
            }
            None => (image, (0, 0)),
        };

        Ok(Some(Frame::new(image, origin, now_secs())))
    }
}

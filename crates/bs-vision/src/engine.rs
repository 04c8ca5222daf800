use crate::color::RedMask;
use crate::nms::non_max_suppression;
use crate::template::{match_template, Template};
use crate::text::{Charset, TextRecognizer, TextWord};
use crate::{DetectedBy, Detection, DetectionBox, Method, MethodHint};
use bs_capture::{crop_rect, Frame, Rect};
use bs_data::Tuning;
use image::{GrayImage, RgbaImage};
use std::borrow::Cow;
use std::sync::Arc;
use tracing::debug;

/// Thresholds used by the detection engine
#[derive(Debug, Clone)]
pub struct EngineTuning {
    pub template_threshold: f64,
    pub nms_iou: f64,
    pub max_instances: usize,
    pub min_box: u32,
    pub max_box: u32,
    pub max_aspect: f64,
}

impl Default for EngineTuning {
    fn default() -> Self {
        Self::from(&Tuning::default())
    }
}

impl From<&Tuning> for EngineTuning {
    fn from(t: &Tuning) -> Self {
        Self {
            template_threshold: t.template_threshold,
            nms_iou: t.nms_iou,
            max_instances: t.max_instances,
            min_box: t.text_min_box,
            max_box: t.text_max_box,
            max_aspect: t.text_max_aspect,
        }
    }
}

/// What to look for and where
#[derive(Debug, Clone)]
pub struct TargetSpec {
    pub label: String,
    /// A recognised word matching any of these counts as a hit.
    pub words: Vec<String>,
    pub template: Option<Arc<Template>>,
    /// Search area in frame pixels. `None` searches the whole frame.
    pub roi: Option<Rect>,
    /// Narrower area for the template pass only, e.g. a calibrated override
    pub template_roi: Option<Rect>,
    pub charset: Charset,
    /// Try the red-isolated image before plain grayscale.
    pub color_first: bool,
}

impl TargetSpec {
    pub fn text(label: &str, word: &str) -> Self {
        Self {
            label: label.to_string(),
            words: vec![word.to_string()],
            template: None,
            roi: None,
            template_roi: None,
            charset: Charset::Letters,
            color_first: true,
        }
    }

    pub fn any_of(label: &str, words: &[String]) -> Self {
        Self {
            words: words.to_vec(),
            ..Self::text(label, "")
        }
    }

    /// Any of `digits`, each matched as a whole word.
    pub fn digits(label: &str, digits: &[String]) -> Self {
        Self {
            charset: Charset::Digits,
            color_first: false,
            ..Self::any_of(label, digits)
        }
    }

    pub fn with_template(mut self, template: Option<Arc<Template>>) -> Self {
        self.template = template;
        self
    }

    pub fn with_roi(mut self, roi: Option<Rect>) -> Self {
        self.roi = roi;
        self
    }

    pub fn with_template_roi(mut self, roi: Option<Rect>) -> Self {
        self.template_roi = roi;
        self
    }
}

/// Runs template matching and text recognition over frame regions.
/// Never fails: backend errors come back as an empty detection.
pub struct DetectionEngine {
    recognizer: Arc<dyn TextRecognizer>,
    tuning: EngineTuning,
}

impl DetectionEngine {
    pub fn new(recognizer: Arc<dyn TextRecognizer>, tuning: EngineTuning) -> Self {
        Self { recognizer, tuning }
    }

    pub fn tuning(&self) -> &EngineTuning {
        &self.tuning
    }

    pub fn recognizer_name(&self) -> &str {
        self.recognizer.name()
    }

    /// False when the text backend is missing; text passes then find nothing.
    pub fn text_available(&self) -> bool {
        self.recognizer.is_available()
    }

    pub fn detect(&self, frame: &Frame, hint: MethodHint, spec: &TargetSpec) -> Detection {
        match hint {
            MethodHint::Template => match &spec.template {
                Some(t) => Detection::from_boxes(self.template_in(frame, spec, t), DetectedBy::Template),
                None => Detection::empty(),
            },
            MethodHint::Text => Detection::from_boxes(self.text_in(frame, spec), DetectedBy::Text),
            MethodHint::Auto => match &spec.template {
                Some(t) => {
                    let boxes = self.template_in(frame, spec, t);
                    if !boxes.is_empty() {
                        return Detection::from_boxes(boxes, DetectedBy::Template);
                    }
                    Detection::from_boxes(self.text_in(frame, spec), DetectedBy::TextFallback)
                }
                None => Detection::from_boxes(self.text_in(frame, spec), DetectedBy::Text),
            },
        }
    }

    /// Micro text pass confined to `rect`: is `word` written there?
    pub fn confirm_word(&self, frame: &Frame, rect: Rect, word: &str) -> Option<DetectionBox> {
        let spec = TargetSpec::text("confirm", word).with_roi(Some(rect));
        self.detect(frame, MethodHint::Text, &spec).boxes.into_iter().next()
    }

    /// Raw recognised words inside `rect`, in frame coordinates, reading order.
    pub fn read_words(&self, frame: &Frame, rect: Rect, charset: Charset) -> Vec<TextWord> {
        let (image, (ox, oy)) = match region(&frame.image, Some(rect)) {
            Some(r) => r,
            None => return Vec::new(),
        };
        let gray = image::imageops::grayscale(image.as_ref());
        let mut words = match self.recognizer.recognize(&gray, charset) {
            Ok(words) => words,
            Err(e) => {
                debug!("Text read failed: {:#}", e);
                return Vec::new();
            }
        };
        for w in &mut words {
            w.rect = w.rect.translate(ox, oy);
        }
        words.sort_by_key(|w| (w.rect.y, w.rect.x));
        words
    }

    fn template_in(&self, frame: &Frame, spec: &TargetSpec, template: &Template) -> Vec<DetectionBox> {
        match region(&frame.image, spec.template_roi.or(spec.roi)) {
            Some((image, offset)) => self.template_pass(&image, offset, template),
            None => Vec::new(),
        }
    }

    fn text_in(&self, frame: &Frame, spec: &TargetSpec) -> Vec<DetectionBox> {
        match region(&frame.image, spec.roi) {
            Some((image, offset)) => self.text_pass(&image, offset, spec),
            None => Vec::new(),
        }
    }

    fn template_pass(
        &self,
        image: &RgbaImage,
        (ox, oy): (i32, i32),
        template: &Template,
    ) -> Vec<DetectionBox> {
        let gray = image::imageops::grayscale(image);
        match_template(
            &gray,
            template,
            self.tuning.template_threshold,
            self.tuning.nms_iou,
            self.tuning.max_instances,
        )
        .into_iter()
        .map(|b| DetectionBox::new(b.rect().translate(ox, oy), b.score, b.method, b.label))
        .collect()
    }

    fn text_pass(&self, image: &RgbaImage, offset: (i32, i32), spec: &TargetSpec) -> Vec<DetectionBox> {
        if spec.words.iter().all(|w| w.trim().is_empty()) || !self.recognizer.is_available() {
            return Vec::new();
        }

        if spec.color_first {
            let masked = RedMask::NAMEPLATE.isolate(image);
            let boxes = self.read_matches(&masked, offset, spec);
            if !boxes.is_empty() {
                return boxes;
            }
        }
        let gray = image::imageops::grayscale(image);
        self.read_matches(&gray, offset, spec)
    }

    fn read_matches(&self, gray: &GrayImage, (ox, oy): (i32, i32), spec: &TargetSpec) -> Vec<DetectionBox> {
        let words = match self.recognizer.recognize(gray, spec.charset) {
            Ok(words) => words,
            Err(e) => {
                debug!("{} text pass failed: {:#}", spec.label, e);
                return Vec::new();
            }
        };

        let boxes: Vec<DetectionBox> = words
            .into_iter()
            .filter(|w| self.is_valid_text_box(&w.rect))
            .filter(|w| spec.words.iter().any(|target| word_matches(&w.text, target, spec.charset)))
            .map(|w| {
                DetectionBox::new(
                    w.rect.translate(ox, oy),
                    w.confidence,
                    Method::Text,
                    spec.label.as_str(),
                )
            })
            .collect();
        let mut kept = non_max_suppression(boxes, self.tuning.nms_iou);
        kept.truncate(self.tuning.max_instances);
        kept
    }

    fn is_valid_text_box(&self, rect: &Rect) -> bool {
        let (w, h) = (rect.w, rect.h);
        if w < self.tuning.min_box as i32 || h < self.tuning.min_box as i32 {
            return false;
        }
        if w > self.tuning.max_box as i32 || h > self.tuning.max_box as i32 {
            return false;
        }
        let aspect = w.max(h) as f64 / w.min(h) as f64;
        aspect <= self.tuning.max_aspect
    }
}

/// Case-insensitive; an exact word or a word containing the target both count.
/// Digits must match whole: "12" is not "1".
fn word_matches(text: &str, target: &str, charset: Charset) -> bool {
    let target = target.trim().to_lowercase();
    if target.is_empty() {
        return false;
    }
    let cleaned: String = text
        .chars()
        .filter(|c| c.is_alphanumeric())
        .collect::<String>()
        .to_lowercase();
    match charset {
        Charset::Digits => cleaned == target,
        _ => cleaned == target || cleaned.contains(&target),
    }
}

/// The part of the frame to search and its offset. `None` when the ROI misses the frame.
fn region(image: &RgbaImage, roi: Option<Rect>) -> Option<(Cow<'_, RgbaImage>, (i32, i32))> {
    match roi {
        None => Some((Cow::Borrowed(image), (0, 0))),
        Some(rect) => {
            let clipped = rect.clamp_to(image.width(), image.height())?;
            let crop = crop_rect(image, &clipped)?;
            Some((Cow::Owned(crop), (clipped.x, clipped.y)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::tests::textured;
    use crate::testing::GlyphRecognizer;
    use image::Rgba;

    const RED: Rgba<u8> = Rgba([220, 30, 30, 255]);
    const WHITE: Rgba<u8> = Rgba([230, 230, 230, 255]);

    fn engine(recognizer: GlyphRecognizer) -> DetectionEngine {
        DetectionEngine::new(Arc::new(recognizer), EngineTuning::default())
    }

    fn blank(w: u32, h: u32) -> RgbaImage {
        RgbaImage::from_pixel(w, h, Rgba([0, 0, 0, 255]))
    }

    #[test]
    fn test_word_matching() {
        assert!(word_matches("Wendigo", "wendigo", Charset::Letters));
        assert!(word_matches("Wendigo's", "wendigo", Charset::Letters));
        assert!(word_matches("ATTACK:", "attack", Charset::Letters));
        assert!(!word_matches("Attic", "attack", Charset::Letters));
        assert!(!word_matches("anything", "  ", Charset::Letters));

        assert!(word_matches("1.", "1", Charset::Digits));
        assert!(!word_matches("12", "1", Charset::Digits));
        assert!(!word_matches("21", "1", Charset::Digits));
    }

    #[test]
    fn test_digit_slot_needs_exact_number() {
        let mut img = blank(200, 100);
        GlyphRecognizer::paint(&mut img, Rect::new(20, 20, 24, 24), WHITE);
        let frame = Frame::new(img, (0, 0), 0.0);
        let slots = vec!["1".to_string(), "2".to_string()];

        let twelve = engine(GlyphRecognizer::new().glyph(WHITE, "12"));
        let det = twelve.detect(&frame, MethodHint::Text, &TargetSpec::digits("weapon", &slots));
        assert!(!det.found());

        let two = engine(GlyphRecognizer::new().glyph(WHITE, "2"));
        let det = two.detect(&frame, MethodHint::Text, &TargetSpec::digits("weapon", &slots));
        assert_eq!(det.boxes.len(), 1);
        assert_eq!(det.boxes[0].rect(), Rect::new(20, 20, 24, 24));
    }

    #[test]
    fn test_text_pass_prefers_red_mask() {
        let mut img = blank(200, 100);
        GlyphRecognizer::paint(&mut img, Rect::new(20, 20, 50, 14), RED);
        GlyphRecognizer::paint(&mut img, Rect::new(120, 60, 50, 14), WHITE);
        let engine = engine(
            GlyphRecognizer::new()
                .glyph(RED, "Wendigo")
                .glyph(WHITE, "Wendigo"),
        );
        let frame = Frame::new(img, (0, 0), 0.0);

        let det = engine.detect(&frame, MethodHint::Auto, &TargetSpec::text("nameplate", "wendigo"));
        // the red pass found something, so the gray pass never ran
        assert_eq!(det.boxes.len(), 1);
        assert_eq!(det.boxes[0].rect(), Rect::new(20, 20, 50, 14));
        assert_eq!(det.method, Some(DetectedBy::Text));
        assert_eq!(det.boxes[0].method, Method::Text);
    }

    #[test]
    fn test_text_pass_falls_back_to_gray() {
        let mut img = blank(200, 100);
        GlyphRecognizer::paint(&mut img, Rect::new(120, 60, 50, 14), WHITE);
        let engine = engine(GlyphRecognizer::new().glyph(WHITE, "Attack"));
        let frame = Frame::new(img, (0, 0), 0.0);

        let det = engine.detect(&frame, MethodHint::Text, &TargetSpec::text("attack", "attack"));
        assert_eq!(det.boxes.len(), 1);
        assert_eq!(det.boxes[0].rect(), Rect::new(120, 60, 50, 14));
    }

    #[test]
    fn test_roi_restricts_and_offsets() {
        let mut img = blank(200, 100);
        GlyphRecognizer::paint(&mut img, Rect::new(120, 60, 50, 14), WHITE);
        let engine = engine(GlyphRecognizer::new().glyph(WHITE, "Attack"));
        let frame = Frame::new(img, (0, 0), 0.0);

        let inside = TargetSpec::text("attack", "attack").with_roi(Some(Rect::new(100, 50, 90, 40)));
        let det = engine.detect(&frame, MethodHint::Text, &inside);
        assert_eq!(det.boxes[0].rect(), Rect::new(120, 60, 50, 14));

        let outside = TargetSpec::text("attack", "attack").with_roi(Some(Rect::new(0, 0, 100, 50)));
        assert!(!engine.detect(&frame, MethodHint::Text, &outside).found());

        let off_frame = TargetSpec::text("attack", "attack").with_roi(Some(Rect::new(500, 500, 10, 10)));
        assert!(!engine.detect(&frame, MethodHint::Text, &off_frame).found());
    }

    #[test]
    fn test_noise_boxes_rejected() {
        let mut img = blank(300, 100);
        // too thin
        GlyphRecognizer::paint(&mut img, Rect::new(10, 10, 40, 6), WHITE);
        // too elongated
        GlyphRecognizer::paint(&mut img, Rect::new(10, 40, 120, 12), WHITE);
        let engine = engine(GlyphRecognizer::new().glyph(WHITE, "attack"));
        let frame = Frame::new(img, (0, 0), 0.0);
        assert!(!engine
            .detect(&frame, MethodHint::Text, &TargetSpec::text("attack", "attack"))
            .found());
    }

    #[test]
    fn test_auto_prefers_template_then_tags_fallback() {
        let patch = textured(24, 12);
        let template = Arc::new(Template::from_gray("nameplate", patch.clone()).unwrap());
        let spec = TargetSpec::text("nameplate", "wendigo").with_template(Some(template));

        let mut with_patch = blank(200, 100);
        for (x, y, p) in patch.enumerate_pixels() {
            let v = p[0];
            with_patch.put_pixel(60 + x, 30 + y, Rgba([v, v, v, 255]));
        }
        let engine = engine(GlyphRecognizer::new().glyph(RED, "Wendigo"));
        let det = engine.detect(&Frame::new(with_patch, (0, 0), 0.0), MethodHint::Auto, &spec);
        assert_eq!(det.method, Some(DetectedBy::Template));
        assert_eq!((det.boxes[0].x, det.boxes[0].y), (60, 30));
        assert!(det.best_score > 0.95);

        let mut text_only = blank(200, 100);
        GlyphRecognizer::paint(&mut text_only, Rect::new(20, 20, 50, 14), RED);
        let det = engine.detect(&Frame::new(text_only, (0, 0), 0.0), MethodHint::Auto, &spec);
        assert_eq!(det.method, Some(DetectedBy::TextFallback));
        assert_eq!(det.boxes.len(), 1);
    }

    #[test]
    fn test_template_roi_only_narrows_template_pass() {
        let patch = textured(24, 12);
        let template = Arc::new(Template::from_gray("nameplate", patch.clone()).unwrap());
        let mut img = blank(200, 100);
        for (x, y, p) in patch.enumerate_pixels() {
            let v = p[0];
            img.put_pixel(140 + x, 60 + y, Rgba([v, v, v, 255]));
        }
        GlyphRecognizer::paint(&mut img, Rect::new(20, 20, 50, 14), RED);
        let engine = engine(GlyphRecognizer::new().glyph(RED, "Wendigo"));
        let frame = Frame::new(img, (0, 0), 0.0);

        // a stale override misses the patch, the text pass still covers the frame
        let spec = TargetSpec::text("nameplate", "wendigo")
            .with_template(Some(template))
            .with_template_roi(Some(Rect::new(0, 0, 100, 50)));
        let det = engine.detect(&frame, MethodHint::Auto, &spec);
        assert_eq!(det.method, Some(DetectedBy::TextFallback));
        assert_eq!(det.boxes[0].rect(), Rect::new(20, 20, 50, 14));

        let spec = spec.with_template_roi(Some(Rect::new(120, 40, 80, 60)));
        let det = engine.detect(&frame, MethodHint::Auto, &spec);
        assert_eq!(det.method, Some(DetectedBy::Template));
        assert_eq!((det.boxes[0].x, det.boxes[0].y), (140, 60));
    }

    #[test]
    fn test_backend_failure_is_empty() {
        let mut img = blank(100, 60);
        GlyphRecognizer::paint(&mut img, Rect::new(20, 20, 50, 14), RED);
        let engine = engine(GlyphRecognizer::failing());
        let det = engine.detect(&Frame::new(img, (0, 0), 0.0), MethodHint::Auto, &TargetSpec::text("nameplate", "wendigo"));
        assert!(!det.found());
        assert_eq!(det.best_score, 0.0);
        assert!(det.method.is_none());
    }

    #[test]
    fn test_confirm_word_and_read_words() {
        let mut img = blank(200, 100);
        GlyphRecognizer::paint(&mut img, Rect::new(30, 10, 40, 14), WHITE);
        let engine = engine(GlyphRecognizer::new().glyph(WHITE, "Attack"));
        let frame = Frame::new(img, (0, 0), 0.0);

        assert!(engine.confirm_word(&frame, Rect::new(20, 0, 60, 30), "attack").is_some());
        assert!(engine.confirm_word(&frame, Rect::new(100, 0, 60, 30), "attack").is_none());

        let words = engine.read_words(&frame, Rect::new(20, 0, 60, 30), Charset::Letters);
        assert_eq!(words.len(), 1);
        assert_eq!(words[0].rect, Rect::new(30, 10, 40, 14));
    }

    #[test]
    fn test_region_helper() {
        let img = RgbaImage::new(10, 10);
        let (crop, offset) = region(&img, Some(Rect::new(-5, 2, 8, 4))).unwrap();
        assert_eq!(offset, (0, 2));
        assert_eq!(crop.width(), 3);
    }
}

use crate::DetectionBox;
use std::cmp::Ordering;

/// Greedy non-maximum suppression: highest score wins, any box overlapping a
/// kept box by more than `iou_threshold` is dropped. Output is sorted best first.
pub fn non_max_suppression(mut boxes: Vec<DetectionBox>, iou_threshold: f64) -> Vec<DetectionBox> {
    // stable: equal scores keep their input order
    boxes.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));

    let mut kept: Vec<DetectionBox> = Vec::with_capacity(boxes.len());
    for candidate in boxes {
        let rect = candidate.rect();
        if kept.iter().all(|k| k.rect().iou(&rect) <= iou_threshold) {
            kept.push(candidate);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Method;
    use bs_capture::Rect;

    fn boxed(x: i32, y: i32, w: i32, h: i32, score: f64) -> DetectionBox {
        DetectionBox::new(Rect::new(x, y, w, h), score, Method::Template, "t")
    }

    #[test]
    fn test_overlapping_boxes_keep_best() {
        let boxes = vec![
            boxed(0, 0, 20, 20, 0.80),
            boxed(2, 2, 20, 20, 0.95),
            boxed(100, 100, 20, 20, 0.70),
        ];
        let kept = non_max_suppression(boxes, 0.5);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].score, 0.95);
        assert_eq!(kept[1].x, 100);
    }

    #[test]
    fn test_touching_boxes_survive() {
        // IoU exactly at the threshold is kept
        let boxes = vec![boxed(0, 0, 10, 10, 0.9), boxed(5, 0, 10, 10, 0.8)];
        let kept = non_max_suppression(boxes, 1.0 / 3.0);
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn test_nms_is_idempotent() {
        let mut boxes = Vec::new();
        for i in 0..40 {
            let x = (i * 7 % 60) as i32;
            let y = (i * 13 % 45) as i32;
            let score = 0.5 + ((i * 17) % 50) as f64 / 100.0;
            boxes.push(boxed(x, y, 12 + (i % 5) as i32, 10 + (i % 3) as i32, score));
        }
        let once = non_max_suppression(boxes, 0.5);
        let twice = non_max_suppression(once.clone(), 0.5);
        assert!(!once.is_empty());
        assert_eq!(once, twice);
    }

    #[test]
    fn test_empty_input() {
        assert!(non_max_suppression(Vec::new(), 0.5).is_empty());
    }
}

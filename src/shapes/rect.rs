use serde::Serialize;

/// Face box in pixel coordinates, anchored at the top-left corner.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

impl From<Rect> for imageproc::rect::Rect {
    fn from(r: Rect) -> imageproc::rect::Rect {
        imageproc::rect::Rect::at(r.x as i32, r.y as i32).of_size(r.w.max(1), r.h.max(1))
    }
}

impl Rect {
    pub fn new(x: u32, y: u32, w: u32, h: u32) -> Rect {
        Rect { x, y, w, h }
    }

    /// Builds a box from signed detector output, cropping whatever falls
    /// outside a `max_w` x `max_h` frame. Returns `None` if nothing is left.
    pub fn clamped(x: i32, y: i32, w: u32, h: u32, max_w: u32, max_h: u32) -> Option<Rect> {
        let left = x.max(0) as i64;
        let top = y.max(0) as i64;
        let right = (x as i64 + w as i64).min(max_w as i64);
        let bottom = (y as i64 + h as i64).min(max_h as i64);

        if right <= left || bottom <= top {
            return None;
        }

        Some(Rect {
            x: left as u32,
            y: top as u32,
            w: (right - left) as u32,
            h: (bottom - top) as u32,
        })
    }

    pub fn left(&self) -> u32 {
        self.x
    }
    pub fn top(&self) -> u32 {
        self.y
    }

    pub fn is_empty(&self) -> bool {
        self.w == 0 || self.h == 0
    }

    /// Shrinks the box by `by` pixels on every side, used to stack outlines.
    pub fn inset(&self, by: u32) -> Option<Rect> {
        if self.w <= by * 2 || self.h <= by * 2 {
            return None;
        }

        Some(Rect {
            x: self.x + by,
            y: self.y + by,
            w: self.w - by * 2,
            h: self.h - by * 2,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamped_inside_frame() {
        let r = Rect::clamped(10, 20, 30, 40, 100, 100).unwrap();
        assert_eq!(r, Rect::new(10, 20, 30, 40));
        assert_eq!((r.left(), r.top()), (10, 20));
        assert!(!r.is_empty());
        assert!(Rect::new(10, 20, 0, 40).is_empty());
    }

    #[test]
    fn test_clamped_crops_negative_origin() {
        let r = Rect::clamped(-5, -10, 30, 40, 100, 100).unwrap();
        assert_eq!(r, Rect::new(0, 0, 25, 30));
    }

    #[test]
    fn test_clamped_crops_far_edge() {
        let r = Rect::clamped(90, 95, 30, 40, 100, 100).unwrap();
        assert_eq!(r, Rect::new(90, 95, 10, 5));
    }

    #[test]
    fn test_clamped_outside_frame() {
        assert!(Rect::clamped(120, 0, 30, 40, 100, 100).is_none());
        assert!(Rect::clamped(-50, 0, 30, 40, 100, 100).is_none());
        assert!(Rect::clamped(0, 0, 0, 40, 100, 100).is_none());
    }

    #[test]
    fn test_inset() {
        let r = Rect::new(10, 10, 20, 20);
        assert_eq!(r.inset(1), Some(Rect::new(11, 11, 18, 18)));
        assert_eq!(r.inset(10), None);
    }
}

//! Axis-aligned bounding rectangles used for alpha-batch overlap tests.

use lyon::math::Point;

use crate::transform::Mat4;

/// Coordinates further than this from the origin disable merging for the
/// element, since depth precision degrades long before f32 overflows.
pub(crate) const SAFE_COORDINATE_RANGE: f32 = 8_388_608.0; // 2^23

/// An axis-aligned rectangle, stored as top-left and bottom-right corners.
///
/// A freshly constructed rect is inverted (min > max) so that including the
/// first point snaps both corners to it.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Rect {
    pub tl: Point,
    pub br: Point,
}

impl Default for Rect {
    fn default() -> Self {
        Self {
            tl: Point::new(f32::MAX, f32::MAX),
            br: Point::new(-f32::MAX, -f32::MAX),
        }
    }
}

impl Rect {
    pub fn new(tl: Point, br: Point) -> Self {
        Self { tl, br }
    }

    pub fn from_coords(left: f32, top: f32, right: f32, bottom: f32) -> Self {
        Self::new(Point::new(left, top), Point::new(right, bottom))
    }

    pub fn include_point(&mut self, p: Point) {
        self.tl.x = self.tl.x.min(p.x);
        self.tl.y = self.tl.y.min(p.y);
        self.br.x = self.br.x.max(p.x);
        self.br.y = self.br.y.max(p.y);
    }

    pub fn include_rect(&mut self, other: &Rect) {
        self.include_point(other.tl);
        self.include_point(other.br);
    }

    /// Boundary-touching rectangles do not count as intersecting.
    pub fn intersects(&self, other: &Rect) -> bool {
        self.tl.x < other.br.x
            && self.br.x > other.tl.x
            && self.tl.y < other.br.y
            && self.br.y > other.tl.y
    }

    /// Maps the rect through a transform, taking a corner shortcut for
    /// matrices that keep rectangles axis-aligned.
    pub fn transformed(&self, m: &Mat4) -> Rect {
        if m.is_scale() {
            let a = m.map_point(self.tl);
            let b = m.map_point(self.br);
            let mut r = Rect::default();
            r.include_point(a);
            r.include_point(b);
            r
        } else {
            let mut r = Rect::default();
            r.include_point(m.map_point(self.tl));
            r.include_point(m.map_point(Point::new(self.br.x, self.tl.y)));
            r.include_point(m.map_point(self.br));
            r.include_point(m.map_point(Point::new(self.tl.x, self.br.y)));
            r
        }
    }

    pub(crate) fn is_outside_safe_range(&self) -> bool {
        let limit = SAFE_COORDINATE_RANGE;
        !(self.tl.x > -limit
            && self.tl.y > -limit
            && self.br.x < limit
            && self.br.y < limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_rect_snaps_to_first_point() {
        let mut r = Rect::default();
        r.include_point(Point::new(3.0, 4.0));
        assert_eq!(r.tl, Point::new(3.0, 4.0));
        assert_eq!(r.br, Point::new(3.0, 4.0));
    }

    #[test]
    fn touching_edges_do_not_intersect() {
        let a = Rect::from_coords(0.0, 0.0, 10.0, 10.0);
        let b = Rect::from_coords(10.0, 0.0, 20.0, 10.0);
        let c = Rect::from_coords(5.0, 5.0, 15.0, 15.0);
        assert!(!a.intersects(&b));
        assert!(a.intersects(&c));
        assert!(c.intersects(&a));
    }

    #[test]
    fn scale_transform_uses_two_corners() {
        let r = Rect::from_coords(1.0, 2.0, 3.0, 4.0);
        let m = Mat4::scale(2.0, -1.0);
        let mapped = r.transformed(&m);
        assert_eq!(mapped, Rect::from_coords(2.0, -4.0, 6.0, -2.0));
    }

    #[test]
    fn rotation_maps_all_four_corners() {
        // 90 degree rotation around the origin.
        let m = Mat4::from_rows([
            [0.0, -1.0, 0.0, 0.0],
            [1.0, 0.0, 0.0, 0.0],
            [0.0, 0.0, 1.0, 0.0],
            [0.0, 0.0, 0.0, 1.0],
        ]);
        let r = Rect::from_coords(0.0, 0.0, 2.0, 1.0);
        let mapped = r.transformed(&m);
        assert_eq!(mapped, Rect::from_coords(-1.0, 0.0, 0.0, 2.0));
    }

    #[test]
    fn safe_range_check() {
        assert!(!Rect::from_coords(0.0, 0.0, 100.0, 100.0).is_outside_safe_range());
        assert!(Rect::from_coords(0.0, 0.0, 1.0e9, 1.0).is_outside_safe_range());
        assert!(Rect::from_coords(f32::NAN, 0.0, 1.0, 1.0).is_outside_safe_range());
    }
}

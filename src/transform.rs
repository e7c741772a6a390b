//! 4x4 transform matrices with a cached classification.
//!
//! The batcher takes very different paths depending on how complicated a
//! transform is: translations can be folded into vertex data with two
//! additions, axis-aligned scales keep bounding rectangles axis-aligned, and
//! anything that mixes the z axis into x/y makes depth-buffered merging
//! unsafe. [`Mat4`] tracks a [`MatrixKind`] alongside the coefficients so
//! those checks are a single enum comparison instead of a coefficient scan.

use lyon::math::Point;

/// How complicated a matrix is, ordered from most to least restrictive.
///
/// Composition never produces a simpler kind than either operand, so the
/// kind of a product is the maximum of the operand kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum MatrixKind {
    /// The identity matrix.
    Identity,
    /// Pure translation.
    Translate,
    /// Axis-aligned scale, possibly combined with a translation.
    Scale,
    /// A general transform of the x/y plane that leaves z and w alone.
    General2d,
    /// Anything touching the z or w rows, including perspective.
    General3d,
}

/// A column-major 4x4 matrix.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Mat4 {
    cols: [[f32; 4]; 4],
    kind: MatrixKind,
}

impl Default for Mat4 {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Mat4 {
    pub const IDENTITY: Mat4 = Mat4 {
        cols: [
            [1.0, 0.0, 0.0, 0.0],
            [0.0, 1.0, 0.0, 0.0],
            [0.0, 0.0, 1.0, 0.0],
            [0.0, 0.0, 0.0, 1.0],
        ],
        kind: MatrixKind::Identity,
    };

    pub fn translation(x: f32, y: f32) -> Self {
        let mut m = Self::IDENTITY;
        m.cols[3][0] = x;
        m.cols[3][1] = y;
        m.kind = if x == 0.0 && y == 0.0 {
            MatrixKind::Identity
        } else {
            MatrixKind::Translate
        };
        m
    }

    pub fn scale(sx: f32, sy: f32) -> Self {
        let mut m = Self::IDENTITY;
        m.cols[0][0] = sx;
        m.cols[1][1] = sy;
        m.kind = if sx == 1.0 && sy == 1.0 {
            MatrixKind::Identity
        } else {
            MatrixKind::Scale
        };
        m
    }

    /// Builds a matrix from rows and classifies it by inspecting the
    /// coefficients.
    pub fn from_rows(rows: [[f32; 4]; 4]) -> Self {
        let mut cols = [[0.0f32; 4]; 4];
        for (r, row) in rows.iter().enumerate() {
            for (c, v) in row.iter().enumerate() {
                cols[c][r] = *v;
            }
        }
        let mut m = Mat4 {
            cols,
            kind: MatrixKind::General3d,
        };
        m.kind = m.classify();
        m
    }

    /// An orthographic projection mapping `(0, 0)..(width, height)` to
    /// normalized device coordinates with y pointing down.
    pub fn ortho(width: f32, height: f32) -> Self {
        Self::from_rows([
            [2.0 / width, 0.0, 0.0, -1.0],
            [0.0, -2.0 / height, 0.0, 1.0],
            [0.0, 0.0, 1.0, 0.0],
            [0.0, 0.0, 0.0, 1.0],
        ])
    }

    fn classify(&self) -> MatrixKind {
        let c = &self.cols;
        // Perspective row or x/y <-> z mixing rules out depth tricks.
        let w_trivial = c[0][3] == 0.0 && c[1][3] == 0.0 && c[2][3] == 0.0 && c[3][3] == 1.0;
        let z_isolated = c[0][2] == 0.0 && c[1][2] == 0.0 && c[2][0] == 0.0 && c[2][1] == 0.0;
        if !w_trivial || !z_isolated || c[2][2] != 1.0 || c[3][2] != 0.0 {
            return MatrixKind::General3d;
        }
        if c[0][1] != 0.0 || c[1][0] != 0.0 {
            return MatrixKind::General2d;
        }
        if c[0][0] != 1.0 || c[1][1] != 1.0 {
            return MatrixKind::Scale;
        }
        if c[3][0] != 0.0 || c[3][1] != 0.0 {
            return MatrixKind::Translate;
        }
        MatrixKind::Identity
    }

    #[inline]
    pub fn kind(&self) -> MatrixKind {
        self.kind
    }

    /// True for the identity and pure translations.
    #[inline]
    pub fn is_translate(&self) -> bool {
        self.kind <= MatrixKind::Translate
    }

    /// True when the matrix only scales and translates along the axes.
    #[inline]
    pub fn is_scale(&self) -> bool {
        self.kind <= MatrixKind::Scale
    }

    /// True when the matrix never moves geometry out of the x/y plane, so
    /// per-vertex depth values written by the batcher stay meaningful.
    #[inline]
    pub fn is_2d_safe(&self) -> bool {
        self.kind <= MatrixKind::General2d
    }

    #[inline]
    pub fn tx(&self) -> f32 {
        self.cols[3][0]
    }

    #[inline]
    pub fn ty(&self) -> f32 {
        self.cols[3][1]
    }

    #[inline]
    pub fn col(&self, c: usize) -> [f32; 4] {
        self.cols[c]
    }

    pub fn to_cols_array_2d(&self) -> [[f32; 4]; 4] {
        self.cols
    }

    /// `self * rhs`, applying `rhs` first.
    pub fn mul(&self, rhs: &Mat4) -> Mat4 {
        if self.kind == MatrixKind::Identity {
            return *rhs;
        }
        if rhs.kind == MatrixKind::Identity {
            return *self;
        }
        let mut cols = [[0.0f32; 4]; 4];
        for c in 0..4 {
            for r in 0..4 {
                let mut acc = 0.0;
                for k in 0..4 {
                    acc += self.cols[k][r] * rhs.cols[c][k];
                }
                cols[c][r] = acc;
            }
        }
        Mat4 {
            cols,
            kind: self.kind.max(rhs.kind),
        }
    }

    /// Maps a point in the x/y plane, dividing by w for perspective
    /// transforms.
    pub fn map_point(&self, p: Point) -> Point {
        let c = &self.cols;
        match self.kind {
            MatrixKind::Identity => p,
            MatrixKind::Translate => Point::new(p.x + c[3][0], p.y + c[3][1]),
            MatrixKind::Scale => Point::new(p.x * c[0][0] + c[3][0], p.y * c[1][1] + c[3][1]),
            _ => {
                let x = c[0][0] * p.x + c[1][0] * p.y + c[3][0];
                let y = c[0][1] * p.x + c[1][1] * p.y + c[3][1];
                let w = c[0][3] * p.x + c[1][3] * p.y + c[3][3];
                if w == 1.0 || w == 0.0 {
                    Point::new(x, y)
                } else {
                    Point::new(x / w, y / w)
                }
            }
        }
    }
}

impl std::ops::Mul for Mat4 {
    type Output = Mat4;

    fn mul(self, rhs: Mat4) -> Mat4 {
        Mat4::mul(&self, &rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_from_rows() {
        assert_eq!(Mat4::from_rows(Mat4::IDENTITY.to_cols_array_2d()).kind(), MatrixKind::Identity);
        assert_eq!(Mat4::translation(3.0, -2.0).kind(), MatrixKind::Translate);
        assert_eq!(Mat4::scale(2.0, 2.0).kind(), MatrixKind::Scale);

        let shear = Mat4::from_rows([
            [1.0, 0.5, 0.0, 0.0],
            [0.0, 1.0, 0.0, 0.0],
            [0.0, 0.0, 1.0, 0.0],
            [0.0, 0.0, 0.0, 1.0],
        ]);
        assert_eq!(shear.kind(), MatrixKind::General2d);
        assert!(shear.is_2d_safe());
        assert!(!shear.is_scale());

        let perspective = Mat4::from_rows([
            [1.0, 0.0, 0.0, 0.0],
            [0.0, 1.0, 0.0, 0.0],
            [0.0, 0.0, 1.0, 0.0],
            [0.0, 0.001, 0.0, 1.0],
        ]);
        assert_eq!(perspective.kind(), MatrixKind::General3d);
        assert!(!perspective.is_2d_safe());
    }

    #[test]
    fn composition_keeps_the_worst_kind() {
        let t = Mat4::translation(10.0, 0.0);
        let s = Mat4::scale(2.0, 3.0);
        let ts = t * s;
        assert_eq!(ts.kind(), MatrixKind::Scale);
        // Scale is applied first, then the translation.
        let p = ts.map_point(Point::new(1.0, 1.0));
        assert_eq!(p, Point::new(12.0, 3.0));
    }

    #[test]
    fn identity_multiplication_is_a_passthrough() {
        let t = Mat4::translation(5.0, 7.0);
        assert_eq!(Mat4::IDENTITY * t, t);
        assert_eq!(t * Mat4::IDENTITY, t);
    }

    #[test]
    fn map_point_general_path_matches_fast_paths() {
        let t = Mat4::translation(4.0, -1.0);
        let mut general = t;
        general.kind = MatrixKind::General2d;
        let p = Point::new(2.5, 3.5);
        assert_eq!(t.map_point(p), general.map_point(p));
    }
}

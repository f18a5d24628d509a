/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Axis-aligned pixel-space transforms. The projection code composes these
//! out of translations, scales, and quarter-turn rotations; nothing in the
//! display layer ever needs a general matrix, but the representation keeps
//! one so a degenerate composition is detectable rather than silently wrong.

use std::fmt;
use std::ops::Mul;

use display_traits::{DeviceIntBox, DevicePixel, TransformFlags};
use euclid::{Point2D, Transform2D};

type Matrix = Transform2D<f32, DevicePixel, DevicePixel>;

#[derive(Clone, Copy, PartialEq)]
pub struct Transform {
    matrix: Matrix,
}

impl Default for Transform {
    fn default() -> Self {
        Transform::identity()
    }
}

impl Transform {
    pub fn identity() -> Transform {
        Transform {
            matrix: Matrix::identity(),
        }
    }

    /// A rotation of the physical `width` x `height` display by the given
    /// orientation bits. The quarter turn maps logical (x, y) to physical
    /// (width - y, x); flips mirror about the physical extents, so the
    /// composite flags reproduce the half and three-quarter turns.
    pub fn rotation(flags: TransformFlags, width: f32, height: f32) -> Transform {
        let mut matrix = if flags.contains(TransformFlags::ROTATE_90) {
            Matrix::new(0.0, 1.0, -1.0, 0.0, width, 0.0)
        } else {
            Matrix::identity()
        };
        if flags.contains(TransformFlags::FLIP_HORIZONTAL) {
            matrix = matrix.then(&Matrix::new(-1.0, 0.0, 0.0, 1.0, width, 0.0));
        }
        if flags.contains(TransformFlags::FLIP_VERTICAL) {
            matrix = matrix.then(&Matrix::new(1.0, 0.0, 0.0, -1.0, 0.0, height));
        }
        Transform { matrix }
    }

    pub fn translation(x: f32, y: f32) -> Transform {
        Transform {
            matrix: Matrix::translation(x, y),
        }
    }

    pub fn scale(sx: f32, sy: f32) -> Transform {
        Transform {
            matrix: Matrix::scale(sx, sy),
        }
    }

    /// Recover the orientation bits from the matrix. Returns
    /// `NOT_AXIS_ALIGNED` for anything a flip/quarter-turn combination
    /// cannot produce.
    pub fn flags(&self) -> TransformFlags {
        let m = &self.matrix;
        if m.m12 == 0.0 && m.m21 == 0.0 {
            let mut flags = TransformFlags::empty();
            if m.m11 < 0.0 {
                flags |= TransformFlags::FLIP_HORIZONTAL;
            }
            if m.m22 < 0.0 {
                flags |= TransformFlags::FLIP_VERTICAL;
            }
            flags
        } else if m.m11 == 0.0 && m.m22 == 0.0 {
            let mut flags = TransformFlags::ROTATE_90;
            if m.m21 > 0.0 {
                flags |= TransformFlags::FLIP_HORIZONTAL;
            }
            if m.m12 < 0.0 {
                flags |= TransformFlags::FLIP_VERTICAL;
            }
            flags
        } else {
            TransformFlags::NOT_AXIS_ALIGNED
        }
    }

    /// Whether mapping an axis-aligned rectangle through this transform
    /// yields an axis-aligned rectangle with no information loss.
    pub fn preserves_rects(&self) -> bool {
        !self.flags().contains(TransformFlags::NOT_AXIS_ALIGNED)
    }

    /// Whether the transform scales, i.e. sampling it needs filtering even
    /// though rectangles survive.
    pub fn has_scale(&self) -> bool {
        let m = &self.matrix;
        let (sx, sy) = if m.m11 == 0.0 && m.m22 == 0.0 {
            (m.m21.abs(), m.m12.abs())
        } else {
            (m.m11.abs(), m.m22.abs())
        };
        sx != 1.0 || sy != 1.0
    }

    /// The bounding box of the transformed rectangle. Empty in, empty out.
    pub fn transform_box(&self, rect: DeviceIntBox) -> DeviceIntBox {
        if rect.is_empty() {
            return DeviceIntBox::zero();
        }
        let corners = [
            Point2D::new(rect.min.x as f32, rect.min.y as f32),
            Point2D::new(rect.max.x as f32, rect.min.y as f32),
            Point2D::new(rect.min.x as f32, rect.max.y as f32),
            Point2D::new(rect.max.x as f32, rect.max.y as f32),
        ];
        let mut min = Point2D::new(f32::MAX, f32::MAX);
        let mut max = Point2D::new(f32::MIN, f32::MIN);
        for corner in corners {
            let mapped = self.matrix.transform_point(corner);
            min = min.min(mapped);
            max = max.max(mapped);
        }
        DeviceIntBox::new(
            Point2D::new(min.x.round() as i32, min.y.round() as i32),
            Point2D::new(max.x.round() as i32, max.y.round() as i32),
        )
    }

    pub fn matrix(&self) -> &Matrix {
        &self.matrix
    }
}

impl Mul for Transform {
    type Output = Transform;

    /// `a * b` applies `b` first, matching the usual matrix convention the
    /// projection composition is written in.
    fn mul(self, rhs: Transform) -> Transform {
        Transform {
            matrix: rhs.matrix.then(&self.matrix),
        }
    }
}

impl fmt::Debug for Transform {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let m = &self.matrix;
        write!(
            f,
            "Transform[[{:.3}, {:.3}, {:.3}][{:.3}, {:.3}, {:.3}]]",
            m.m11, m.m21, m.m31, m.m12, m.m22, m.m32
        )
    }
}

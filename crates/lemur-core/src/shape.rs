use std::fmt;

use crate::error::{Error, Result};
use crate::RANK;

// Shape: fixed rank-5 shape representation
//
// Every tensor in Lemur has exactly five axes. Lower-rank data is
// left-padded with extents of 1, so a vector of 7 elements is
// [1, 1, 1, 1, 7] and a 3x4 matrix is [1, 1, 1, 3, 4]. Keeping the rank
// fixed turns shapes and strides into plain `[usize; 5]` arrays and makes
// the rank ceiling a property of the type rather than of the data.
//
// The shape is fundamental because it determines:
//   1. How many elements are in the tensor (product of all extents)
//   2. The default (contiguous/row-major) strides for memory layout
//   3. Whether two tensors are compatible for operations (broadcasting rules)

/// Rank-5 shape of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Shape([usize; RANK]);

impl Shape {
    /// Create a shape from exactly five extents.
    pub const fn new(dims: [usize; RANK]) -> Self {
        Shape(dims)
    }

    /// The shape of a single-element tensor, [1, 1, 1, 1, 1].
    pub const fn scalar() -> Self {
        Shape([1; RANK])
    }

    /// Create a shape from up to five extents, left-padding with 1.
    pub fn from_dims(dims: &[usize]) -> Result<Self> {
        if dims.len() > RANK {
            return Err(Error::RankTooLarge {
                got: dims.len(),
                max: RANK,
            });
        }
        let mut out = [1usize; RANK];
        out[RANK - dims.len()..].copy_from_slice(dims);
        Ok(Shape(out))
    }

    /// The extents as a fixed-size array.
    pub fn dims(&self) -> &[usize; RANK] {
        &self.0
    }

    /// Total number of elements (product of all extents). May be zero.
    ///
    /// Saturates at `usize::MAX` for shapes whose product does not fit;
    /// use [`Shape::checked_elem_count`] where the shape comes from a caller.
    pub fn elem_count(&self) -> usize {
        self.checked_elem_count().unwrap_or(usize::MAX)
    }

    /// Product of all extents, `None` if it overflows `usize`.
    ///
    /// Any zero extent makes the count zero regardless of the others.
    pub fn checked_elem_count(&self) -> Option<usize> {
        if self.0.contains(&0) {
            return Some(0);
        }
        self.0.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d))
    }

    /// The element count, or `ShapeOverflow` if it does not fit in `usize`.
    pub fn try_elem_count(&self) -> Result<usize> {
        self.checked_elem_count()
            .ok_or(Error::ShapeOverflow { shape: *self })
    }

    /// Whether this shape holds exactly one element.
    pub fn is_scalar(&self) -> bool {
        self.0.iter().all(|&d| d == 1)
    }

    /// Row-major strides for this shape.
    ///
    /// For [1, 1, 2, 3, 4] the strides are [24, 24, 12, 4, 1]. Strides of a
    /// shape whose element count overflows saturate instead of wrapping.
    pub fn stride_contiguous(&self) -> [usize; RANK] {
        let mut strides = [0usize; RANK];
        strides[RANK - 1] = 1;
        for i in (0..RANK - 1).rev() {
            strides[i] = strides[i + 1].saturating_mul(self.0[i + 1]);
        }
        strides
    }

    // Broadcasting

    /// Compute the broadcast output shape from two input shapes.
    ///
    /// Axis by axis the extents must be equal or one of them must be 1; the
    /// result takes the larger extent.
    ///
    ///   [1,1,1,3,1] and [1,1,1,1,4] → [1,1,1,3,4]
    ///   [1,1,1,1,3] and [1,1,1,1,4] → Error (3 ≠ 4 and neither is 1)
    pub fn broadcast_shape(lhs: &Shape, rhs: &Shape) -> Result<Shape> {
        let mut result = [1usize; RANK];
        for axis in 0..RANK {
            let (l, r) = (lhs.0[axis], rhs.0[axis]);
            result[axis] = if l == r || r == 1 {
                l
            } else if l == 1 {
                r
            } else {
                return Err(Error::BroadcastMismatch {
                    lhs: *lhs,
                    rhs: *rhs,
                    axis,
                    l,
                    r,
                });
            };
        }
        let result = Shape(result);
        result.try_elem_count()?;
        Ok(result)
    }

    /// Axes that were broadcast when going from `self` to `broadcast`:
    /// extent 1 here, anything else there (including 0). Summing a gradient
    /// of shape `broadcast` over these axes brings it back to `self`.
    pub fn reduction_axes_from(&self, broadcast: &Shape) -> AxisSet {
        let mut axes = AxisSet::none();
        for axis in 0..RANK {
            if self.0[axis] == 1 && broadcast.0[axis] != 1 {
                axes.insert(axis);
            }
        }
        axes
    }

    /// The shape with every axis in `axes` collapsed to extent 1.
    pub fn reduced(&self, axes: &AxisSet) -> Shape {
        let mut dims = self.0;
        for axis in axes.iter() {
            dims[axis] = 1;
        }
        Shape(dims)
    }

    /// Reorder extents: `result[i] = self[order[i]]`.
    pub fn permuted(&self, order: &[usize; RANK]) -> Shape {
        let mut dims = [0usize; RANK];
        for (i, &src) in order.iter().enumerate() {
            dims[i] = self.0[src];
        }
        Shape(dims)
    }
}

impl Default for Shape {
    fn default() -> Self {
        Shape::scalar()
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", d)?;
        }
        write!(f, "]")
    }
}

// Convenient From implementations
// These let you write: Shape::from((3, 4)) for [1, 1, 1, 3, 4]

impl From<[usize; RANK]> for Shape {
    fn from(dims: [usize; RANK]) -> Self {
        Shape(dims)
    }
}

impl From<()> for Shape {
    fn from(_: ()) -> Self {
        Shape::scalar()
    }
}

impl From<usize> for Shape {
    fn from(d: usize) -> Self {
        Shape([1, 1, 1, 1, d])
    }
}

impl From<(usize, usize)> for Shape {
    fn from((d0, d1): (usize, usize)) -> Self {
        Shape([1, 1, 1, d0, d1])
    }
}

impl From<(usize, usize, usize)> for Shape {
    fn from((d0, d1, d2): (usize, usize, usize)) -> Self {
        Shape([1, 1, d0, d1, d2])
    }
}

impl From<(usize, usize, usize, usize)> for Shape {
    fn from((d0, d1, d2, d3): (usize, usize, usize, usize)) -> Self {
        Shape([1, d0, d1, d2, d3])
    }
}

impl From<(usize, usize, usize, usize, usize)> for Shape {
    fn from((d0, d1, d2, d3, d4): (usize, usize, usize, usize, usize)) -> Self {
        Shape([d0, d1, d2, d3, d4])
    }
}

// AxisSet: which of the five axes an operation touches

/// A set of axes, used for reductions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct AxisSet([bool; RANK]);

impl AxisSet {
    pub const fn none() -> Self {
        AxisSet([false; RANK])
    }

    pub const fn all() -> Self {
        AxisSet([true; RANK])
    }

    /// Build a set from axis indices. Duplicates are ignored.
    pub fn from_axes(axes: &[usize]) -> Result<Self> {
        let mut set = AxisSet::none();
        for &axis in axes {
            if axis >= RANK {
                return Err(Error::AxisOutOfRange { axis, rank: RANK });
            }
            set.insert(axis);
        }
        Ok(set)
    }

    pub fn insert(&mut self, axis: usize) {
        self.0[axis] = true;
    }

    pub fn is_empty(&self) -> bool {
        !self.0.iter().any(|&a| a)
    }

    /// Axis indices in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..RANK).filter(move |&a| self.0[a])
    }
}

impl fmt::Display for AxisSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let axes: Vec<usize> = self.iter().collect();
        write!(f, "{:?}", axes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_scalar_shape() {
        let s = Shape::from(());
        assert_eq!(s.dims(), &[1, 1, 1, 1, 1]);
        assert_eq!(s.elem_count(), 1);
        assert!(s.is_scalar());
        assert_eq!(s.stride_contiguous(), [1, 1, 1, 1, 1]);
    }

    #[test]
    fn test_left_padding() {
        let s = Shape::from_dims(&[3, 4]).unwrap();
        assert_eq!(s, Shape::from((3, 4)));
        assert_eq!(s.dims(), &[1, 1, 1, 3, 4]);
        assert_eq!(s.elem_count(), 12);
    }

    #[test]
    fn test_rank_too_large() {
        let err = Shape::from_dims(&[1, 2, 3, 4, 5, 6]).unwrap_err();
        assert!(matches!(err, Error::RankTooLarge { got: 6, max: 5 }));
    }

    #[test]
    fn test_strides() {
        let s = Shape::from((2, 3, 4));
        assert_eq!(s.stride_contiguous(), [24, 24, 12, 4, 1]);
    }

    #[test]
    fn test_broadcast_expand_ones() {
        let a = Shape::from((1, 4));
        let b = Shape::from((3, 1));
        assert_eq!(Shape::broadcast_shape(&a, &b).unwrap(), Shape::from((3, 4)));
    }

    #[test]
    fn test_broadcast_incompatible() {
        let a = Shape::from((2, 3));
        let b = Shape::from((2, 4));
        let err = Shape::broadcast_shape(&a, &b).unwrap_err();
        assert!(matches!(err, Error::BroadcastMismatch { axis: 4, l: 3, r: 4, .. }));
    }

    #[test]
    fn test_reduction_axes() {
        let original = Shape::from((1, 4));
        let broadcast = Shape::from((2, 3, 4));
        let axes: Vec<usize> = original.reduction_axes_from(&broadcast).iter().collect();
        assert_eq!(axes, vec![2, 3]);
    }

    #[test]
    fn test_reduction_axes_against_zero_extent() {
        let original = Shape::from(1);
        let broadcast = Shape::from(0);
        let axes: Vec<usize> = original.reduction_axes_from(&broadcast).iter().collect();
        assert_eq!(axes, vec![4]);
    }

    #[test]
    fn test_elem_count_overflow() {
        let huge = Shape::from((1 << 32, 1 << 32, 1 << 32));
        assert_eq!(huge.checked_elem_count(), None);
        assert_eq!(huge.elem_count(), usize::MAX);
        assert!(matches!(huge.try_elem_count(), Err(Error::ShapeOverflow { .. })));
        // strides saturate rather than wrap
        assert_eq!(huge.stride_contiguous()[0], usize::MAX);
        // a zero extent wins over the overflow
        let empty = Shape::new([usize::MAX, usize::MAX, 0, 1, 1]);
        assert_eq!(empty.checked_elem_count(), Some(0));
    }

    #[test]
    fn test_broadcast_overflow() {
        let a = Shape::new([1 << 32, 1, 1 << 32, 1, 1]);
        let b = Shape::new([1, 1 << 32, 1, 1, 1]);
        assert!(matches!(
            Shape::broadcast_shape(&a, &b),
            Err(Error::ShapeOverflow { .. })
        ));
    }

    #[test]
    fn test_axis_set() {
        let set = AxisSet::from_axes(&[4, 1, 4]).unwrap();
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![1, 4]);
        assert!(AxisSet::from_axes(&[5]).is_err());
        assert!(AxisSet::none().is_empty());
        assert_eq!(Shape::from((2, 3)).reduced(&AxisSet::all()), Shape::scalar());
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", Shape::from((3, 4))), "[1, 1, 1, 3, 4]");
    }

    proptest! {
        #[test]
        fn prop_broadcast_is_symmetric(
            a in prop::array::uniform5(1usize..=3),
            b in prop::array::uniform5(1usize..=3),
        ) {
            let (sa, sb) = (Shape::new(a), Shape::new(b));
            let ab = Shape::broadcast_shape(&sa, &sb).ok();
            let ba = Shape::broadcast_shape(&sb, &sa).ok();
            prop_assert_eq!(ab, ba);
        }

        #[test]
        fn prop_broadcast_with_self_is_identity(a in prop::array::uniform5(0usize..=4)) {
            let s = Shape::new(a);
            prop_assert_eq!(Shape::broadcast_shape(&s, &s).unwrap(), s);
        }
    }
}

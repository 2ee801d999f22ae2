use crate::error::{Error, Result};
use crate::shape::Shape;
use crate::RANK;

// Layout: shape + strides of a strided buffer
//
// The Layout decouples the *logical* shape of a tensor from how its
// elements are arranged in the flat storage. This is what makes view,
// expand and permute free: they only produce a new Layout over the same
// storage.
//
// KEY CONCEPTS:
//
// 1. **Strides**: how many elements to skip in the flat storage to move one
//    step along each axis. A contiguous [1,1,1,2,3] tensor has strides
//    [6,6,6,3,1].
//
// 2. **Broadcast axes**: a stride of 0 means every index along that axis
//    reads the same elements. Expand uses this to repeat data without
//    copying.
//
// 3. **Permute**: reorder shape and strides together. No data movement.
//
// 4. **Contiguous check**: strides match the row-major strides of the
//    shape. Axes of extent 1 are never stepped along, so their stride is
//    ignored by the check.

/// Layout describes how a tensor's logical shape maps to flat storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    shape: Shape,
    strides: [usize; RANK],
}

impl Layout {
    /// Row-major (C-order) layout for the given shape.
    pub fn contiguous(shape: Shape) -> Self {
        Layout {
            strides: shape.stride_contiguous(),
            shape,
        }
    }

    /// Create a layout with explicit strides (for views).
    pub fn new(shape: Shape, strides: [usize; RANK]) -> Self {
        Layout { shape, strides }
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn strides(&self) -> &[usize; RANK] {
        &self.strides
    }

    pub fn dims(&self) -> &[usize; RANK] {
        self.shape.dims()
    }

    pub fn elem_count(&self) -> usize {
        self.shape.elem_count()
    }

    /// Check if this layout is contiguous (row-major, no gaps, no broadcast).
    pub fn is_contiguous(&self) -> bool {
        let expected = self.shape.stride_contiguous();
        self.dims()
            .iter()
            .zip(self.strides.iter().zip(expected.iter()))
            .all(|(&d, (&s, &e))| d == 1 || s == e)
    }

    /// Largest storage offset this layout can reach, `None` for an empty shape.
    pub fn max_offset(&self) -> Option<usize> {
        if self.elem_count() == 0 {
            return None;
        }
        // Saturates, so an unreachable offset still fails the bounds check.
        Some(
            self.dims()
                .iter()
                .zip(self.strides.iter())
                .fold(0usize, |acc, (&d, &s)| {
                    acc.saturating_add((d - 1).saturating_mul(s))
                }),
        )
    }

    /// Whether any axis repeats elements through a zero stride.
    pub fn is_broadcast(&self) -> bool {
        self.dims()
            .iter()
            .zip(self.strides.iter())
            .any(|(&d, &s)| d > 1 && s == 0)
    }

    /// Reinterpret a contiguous layout with a new shape of the same element count.
    pub fn view(&self, new_shape: Shape) -> Result<Layout> {
        let (src, dst) = (self.elem_count(), new_shape.try_elem_count()?);
        if src != dst {
            return Err(Error::ReshapeElementMismatch {
                src,
                dst,
                dst_shape: new_shape,
            });
        }
        if !self.is_contiguous() {
            crate::bail!(
                "view: layout {} with strides {:?} is not contiguous",
                self.shape,
                self.strides
            );
        }
        Ok(Layout::contiguous(new_shape))
    }

    /// Broadcast to `target`: axes of extent 1 that grow get stride 0.
    ///
    /// Example: [1,1,1,1,3] strides [3,3,3,3,1] expand to [1,1,1,4,3]
    ///          → strides [3,3,3,0,1]
    pub fn expand(&self, target: Shape) -> Result<Layout> {
        let mut strides = self.strides;
        for axis in 0..RANK {
            let (src, dst) = (self.dims()[axis], target.dims()[axis]);
            if src == dst {
                continue;
            }
            if src != 1 {
                return Err(Error::ExpandMismatch { axis, src, dst });
            }
            strides[axis] = 0;
        }
        target.try_elem_count()?;
        Ok(Layout::new(target, strides))
    }

    /// Reorder axes: axis `i` of the result is axis `order[i]` of `self`.
    pub fn permute(&self, order: &[usize]) -> Result<Layout> {
        let order = validate_permutation(order)?;
        let mut strides = [0usize; RANK];
        for (i, &src) in order.iter().enumerate() {
            strides[i] = self.strides[src];
        }
        Ok(Layout::new(self.shape.permuted(&order), strides))
    }

    /// flat_index = sum(index[i] * stride[i])
    pub fn flat_index(&self, index: &[usize; RANK]) -> usize {
        index
            .iter()
            .zip(self.strides.iter())
            .map(|(&i, &s)| i * s)
            .sum()
    }

    /// Iterator over the storage offsets of every element, in logical order.
    pub fn strided_indices(&self) -> StridedIter {
        StridedIter::new(self)
    }
}

/// Check that `order` names each of the five axes exactly once.
pub fn validate_permutation(order: &[usize]) -> Result<[usize; RANK]> {
    let invalid = || Error::InvalidPermutation {
        order: order.to_vec(),
    };
    if order.len() != RANK {
        return Err(invalid());
    }
    let mut seen = [false; RANK];
    let mut out = [0usize; RANK];
    for (i, &axis) in order.iter().enumerate() {
        if axis >= RANK || seen[axis] {
            return Err(invalid());
        }
        seen[axis] = true;
        out[i] = axis;
    }
    Ok(out)
}

/// The permutation that undoes `order`.
pub fn inverse_permutation(order: &[usize; RANK]) -> [usize; RANK] {
    let mut inverse = [0usize; RANK];
    for (i, &axis) in order.iter().enumerate() {
        inverse[axis] = i;
    }
    inverse
}

// StridedIter: storage offsets in logical (row-major) order
//
// For a contiguous layout this counts 0, 1, 2, ... For a permuted or
// expanded layout it jumps around (or stands still on stride-0 axes).

/// Iterator that yields flat storage indices for each element of a Layout.
pub struct StridedIter {
    current: [usize; RANK],
    dims: [usize; RANK],
    strides: [usize; RANK],
    offset: usize,
    remaining: usize,
}

impl StridedIter {
    fn new(layout: &Layout) -> Self {
        StridedIter {
            current: [0; RANK],
            dims: *layout.dims(),
            strides: *layout.strides(),
            offset: 0,
            remaining: layout.elem_count(),
        }
    }

    /// Advance the index by one (rightmost axis first), keeping `offset` in step.
    fn advance(&mut self) {
        for i in (0..RANK).rev() {
            self.current[i] += 1;
            self.offset += self.strides[i];
            if self.current[i] < self.dims[i] {
                return;
            }
            self.offset -= self.current[i] * self.strides[i];
            self.current[i] = 0;
        }
    }
}

impl Iterator for StridedIter {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.remaining == 0 {
            return None;
        }
        let idx = self.offset;
        self.remaining -= 1;
        if self.remaining > 0 {
            self.advance();
        }
        Some(idx)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for StridedIter {}

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::layout::Layout;
use crate::shape::{AxisSet, Shape};
use crate::RANK;

// Buffer: flat element storage plus a rank-5 layout
//
// A Buffer is the forward value (or gradient) of a tensor. The elements
// live in an `Arc<Vec<f32>>` so that view, expand and permute can hand out
// new Buffers over the same storage; the storage is freed when the last
// Buffer referencing it is dropped.
//
// Elements are never mutated once other buffers can see them. Kernels
// (`map`, `zip_map`, `sum_axes`, ...) always produce fresh contiguous
// storage. The single exception is initialising a leaf's own storage,
// which `elements_mut` only allows while the storage is not shared.

/// Strided element buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct Buffer {
    elements: Arc<Vec<f32>>,
    layout: Layout,
    computed: bool,
}

impl Buffer {
    /// Allocate `product(shape)` zeroed elements with contiguous strides.
    ///
    /// The buffer is marked as not computed until an initialiser fills it.
    pub fn allocate(shape: Shape) -> Result<Self> {
        let elements = try_alloc(&shape, 0.0)?;
        Ok(Buffer {
            elements: Arc::new(elements),
            layout: Layout::contiguous(shape),
            computed: false,
        })
    }

    /// Allocate a computed buffer with every element set to `value`.
    pub fn full(shape: Shape, value: f32) -> Result<Self> {
        let elements = try_alloc(&shape, value)?;
        Ok(Self::from_contiguous(elements, shape))
    }

    /// Wrap existing data in a contiguous, computed buffer.
    pub fn from_vec(data: Vec<f32>, shape: Shape) -> Result<Self> {
        let expected = shape.try_elem_count()?;
        if data.len() != expected {
            return Err(Error::ElementCountMismatch {
                shape,
                expected,
                got: data.len(),
            });
        }
        Ok(Self::from_contiguous(data, shape))
    }

    fn from_contiguous(data: Vec<f32>, shape: Shape) -> Self {
        Buffer {
            elements: Arc::new(data),
            layout: Layout::contiguous(shape),
            computed: true,
        }
    }

    /// A new buffer over the same storage with a different layout.
    ///
    /// Fails if the layout can reach past the end of the storage.
    pub fn with_layout(&self, layout: Layout) -> Result<Self> {
        if let Some(max_offset) = layout.max_offset() {
            if max_offset >= self.elements.len() {
                return Err(Error::LayoutOutOfBounds {
                    shape: *layout.shape(),
                    strides: *layout.strides(),
                    max_offset,
                    len: self.elements.len(),
                });
            }
        }
        Ok(Buffer {
            elements: Arc::clone(&self.elements),
            layout,
            computed: self.computed,
        })
    }

    // Accessors

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn shape(&self) -> &Shape {
        self.layout.shape()
    }

    pub fn strides(&self) -> &[usize; RANK] {
        self.layout.strides()
    }

    /// Number of addressable elements in the underlying storage.
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Logical element count (product of the shape).
    pub fn elem_count(&self) -> usize {
        self.layout.elem_count()
    }

    pub fn is_computed(&self) -> bool {
        self.computed
    }

    pub fn is_contiguous(&self) -> bool {
        self.layout.is_contiguous()
    }

    /// Whether two buffers read from the same storage.
    pub fn shares_storage(&self, other: &Buffer) -> bool {
        Arc::ptr_eq(&self.elements, &other.elements)
    }

    /// How many buffers currently share this storage.
    pub fn storage_refs(&self) -> usize {
        Arc::strong_count(&self.elements)
    }

    /// Element at a five-axis index.
    pub fn get(&self, index: &[usize; RANK]) -> Result<f32> {
        for (axis, (&i, &d)) in index.iter().zip(self.shape().dims().iter()).enumerate() {
            if i >= d {
                crate::bail!("index {} out of range for axis {} of extent {}", i, axis, d);
            }
        }
        Ok(self.elements[self.layout.flat_index(index)])
    }

    /// Elements in logical (row-major) order.
    pub fn to_vec(&self) -> Vec<f32> {
        if self.is_contiguous() {
            return self.elements[..self.elem_count()].to_vec();
        }
        self.layout
            .strided_indices()
            .map(|i| self.elements[i])
            .collect()
    }

    /// Exclusive access to the storage of a buffer nobody else shares.
    ///
    /// Marks the buffer as computed; the caller is expected to fill it.
    pub(crate) fn elements_mut(&mut self) -> Result<&mut [f32]> {
        let refs = Arc::strong_count(&self.elements);
        match Arc::get_mut(&mut self.elements) {
            Some(elements) => {
                self.computed = true;
                Ok(elements.as_mut_slice())
            }
            None => Err(Error::SharedStorage { refs }),
        }
    }

    // Shape-only transforms (alias the storage)

    pub fn view(&self, new_shape: Shape) -> Result<Self> {
        let layout = self.layout.view(new_shape)?;
        self.with_layout(layout)
    }

    pub fn expand(&self, target: Shape) -> Result<Self> {
        let layout = self.layout.expand(target)?;
        self.with_layout(layout)
    }

    pub fn permute(&self, order: &[usize]) -> Result<Self> {
        let layout = self.layout.permute(order)?;
        self.with_layout(layout)
    }

    // Kernels (produce new contiguous storage)

    /// Copy into fresh contiguous storage. Always copies, even if already
    /// contiguous, so the result never aliases `self`.
    pub fn to_contiguous(&self) -> Result<Self> {
        self.map(|x| x)
    }

    /// Element-wise unary kernel.
    pub fn map(&self, f: impl Fn(f32) -> f32) -> Result<Self> {
        let shape = *self.shape();
        let values = self.layout.strided_indices().map(|i| f(self.elements[i]));
        Ok(Self::from_contiguous(try_collect(&shape, values)?, shape))
    }

    /// Element-wise binary kernel with broadcasting.
    pub fn zip_map(&self, rhs: &Buffer, f: impl Fn(f32, f32) -> f32) -> Result<Self> {
        let shape = Shape::broadcast_shape(self.shape(), rhs.shape())?;
        let lhs_layout = self.layout.expand(shape)?;
        let rhs_layout = rhs.layout.expand(shape)?;
        let values = lhs_layout
            .strided_indices()
            .zip(rhs_layout.strided_indices())
            .map(|(l, r)| f(self.elements[l], rhs.elements[r]));
        Ok(Self::from_contiguous(try_collect(&shape, values)?, shape))
    }

    /// Element-wise ternary kernel; all three buffers broadcast together.
    pub fn zip3_map(
        &self,
        b: &Buffer,
        c: &Buffer,
        f: impl Fn(f32, f32, f32) -> f32,
    ) -> Result<Self> {
        let shape = Shape::broadcast_shape(self.shape(), b.shape())?;
        let shape = Shape::broadcast_shape(&shape, c.shape())?;
        let la = self.layout.expand(shape)?;
        let lb = b.layout.expand(shape)?;
        let lc = c.layout.expand(shape)?;
        let values = la
            .strided_indices()
            .zip(lb.strided_indices())
            .zip(lc.strided_indices())
            .map(|((ia, ib), ic)| f(self.elements[ia], b.elements[ib], c.elements[ic]));
        Ok(Self::from_contiguous(try_collect(&shape, values)?, shape))
    }

    /// Sum over `axes`, keeping each reduced axis at extent 1.
    ///
    /// Reducing over an axis of extent 1 leaves that axis unchanged; an
    /// empty axis set returns a contiguous copy.
    pub fn sum_axes(&self, axes: &AxisSet) -> Result<Self> {
        let out_shape = self.shape().reduced(axes);
        let mut out = try_alloc(&out_shape, 0.0)?;
        // Accumulate through an output layout whose reduced axes have stride 0,
        // walked in lockstep with the input.
        let mut out_strides = out_shape.stride_contiguous();
        for axis in axes.iter() {
            out_strides[axis] = 0;
        }
        let scatter = Layout::new(*self.shape(), out_strides);
        for (src, dst) in self.layout.strided_indices().zip(scatter.strided_indices()) {
            out[dst] += self.elements[src];
        }
        Ok(Self::from_contiguous(out, out_shape))
    }

    /// Sum a broadcast gradient back down to `target`.
    ///
    /// `target` must broadcast to this buffer's shape; axes where `target`
    /// has extent 1 are summed. An extent-1 axis broadcast against 0 sums
    /// nothing and yields zeros.
    pub fn reduce_to(&self, target: &Shape) -> Result<Self> {
        let grown = (0..RANK).find(|&a| {
            let (t, s) = (target.dims()[a], self.shape().dims()[a]);
            t != s && t != 1
        });
        if let Some(axis) = grown {
            return Err(Error::BroadcastMismatch {
                lhs: *target,
                rhs: *self.shape(),
                axis,
                l: target.dims()[axis],
                r: self.shape().dims()[axis],
            });
        }
        Shape::broadcast_shape(target, self.shape())?;
        let axes = target.reduction_axes_from(self.shape());
        self.sum_axes(&axes)
    }
}

/// Reserve `product(shape)` elements without aborting on failure.
fn try_alloc(shape: &Shape, value: f32) -> Result<Vec<f32>> {
    let len = shape
        .checked_elem_count()
        .ok_or(Error::Allocation { elements: usize::MAX })?;
    let mut elements: Vec<f32> = Vec::new();
    elements
        .try_reserve_exact(len)
        .map_err(|_| Error::Allocation { elements: len })?;
    elements.resize(len, value);
    Ok(elements)
}

/// Collect a kernel's output, reserving the whole result up front.
fn try_collect(shape: &Shape, values: impl Iterator<Item = f32>) -> Result<Vec<f32>> {
    let mut out = try_alloc(shape, 0.0)?;
    for (slot, v) in out.iter_mut().zip(values) {
        *slot = v;
    }
    Ok(out)
}

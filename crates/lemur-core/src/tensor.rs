use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use crate::error::{Error, Result};
use crate::layout::{validate_permutation, Layout};
use crate::op::{BinaryOp, Op, TensorId, UnaryOp};
use crate::shape::{AxisSet, Shape};
use crate::storage::Buffer;
use crate::RANK;

// Tensor: a node in the computational graph
//
// A Tensor wraps:
//
//   1. A Buffer holding its forward value (computed eagerly)
//   2. The Op that created it (Op::None for leaves)
//   3. Whether it takes part in gradient computation
//   4. Its accumulated gradient, once a backward pass has reached it
//
// MEMORY MODEL:
//
//   The node lives behind an Arc, so cloning a Tensor is cheap and the
//   provenance of every descendant keeps its inputs alive. Shape-only
//   operations (view, expand, permute) produce nodes whose Buffer shares the
//   parent's element storage.
//
// GRADIENTS:
//
//   The gradient buffer is allocated lazily, the first time backward()
//   accumulates into this node. It sits behind a RwLock because the engine
//   writes it through shared handles. Non-leaf tensors drop their gradient
//   at the end of a backward pass unless `retain_grad()` was called.

/// Inner data of a tensor, shared via Arc.
struct TensorInner {
    id: TensorId,
    buffer: Buffer,
    op: Op,
    requires_grad: bool,
    retain_grad: AtomicBool,
    grad: RwLock<Option<Buffer>>,
}

// Dropping the last handle to a long chain would otherwise recurse once per
// node through the provenance Arcs. Unlink inputs onto a worklist instead.
impl Drop for TensorInner {
    fn drop(&mut self) {
        let mut stack = std::mem::replace(&mut self.op, Op::None).into_inputs();
        while let Some(t) = stack.pop() {
            if let Ok(mut inner) = Arc::try_unwrap(t.inner) {
                stack.extend(std::mem::replace(&mut inner.op, Op::None).into_inputs());
            }
        }
    }
}

/// A rank-5 strided tensor that records how it was computed.
///
/// # Example
/// ```
/// use lemur_core::Tensor;
///
/// let x = Tensor::from_slice(&[1.0, 2.0, 3.0], 3, true)?;
/// let y = x.mul(&x)?.add(&x)?;
/// y.backward()?;
/// assert_eq!(x.grad_vec(), Some(vec![3.0, 5.0, 7.0]));
/// # Ok::<(), lemur_core::Error>(())
/// ```
pub struct Tensor {
    inner: Arc<TensorInner>,
}

// Manual Clone: Arc::clone is cheap (just increment refcount).
impl Clone for Tensor {
    fn clone(&self) -> Self {
        Tensor {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl std::fmt::Debug for Tensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Tensor(id={:?}, shape={}, op={}, requires_grad={})",
            self.inner.id,
            self.shape(),
            self.inner.op.name(),
            self.inner.requires_grad,
        )
    }
}

impl Tensor {
    // Internal constructors

    fn new_node(buffer: Buffer, op: Op, requires_grad: bool) -> Self {
        Tensor {
            inner: Arc::new(TensorInner {
                id: TensorId::new(),
                buffer,
                op,
                requires_grad,
                retain_grad: AtomicBool::new(false),
                grad: RwLock::new(None),
            }),
        }
    }

    /// Wrap the result of an operation. It requires a gradient if any input does.
    fn from_op(buffer: Buffer, op: Op) -> Self {
        let requires_grad = op.inputs().iter().any(|t| t.requires_grad());
        Self::new_node(buffer, op, requires_grad)
    }

    // Leaf constructors

    /// A leaf node over an existing buffer. This is the only way to create
    /// a tensor with no ancestry.
    pub fn leaf(buffer: Buffer, requires_grad: bool) -> Self {
        Self::new_node(buffer, Op::None, requires_grad)
    }

    /// An uninitialised leaf (zeroed, marked as not computed).
    pub fn empty(shape: impl Into<Shape>, requires_grad: bool) -> Result<Self> {
        Ok(Self::leaf(Buffer::allocate(shape.into())?, requires_grad))
    }

    pub fn zeros(shape: impl Into<Shape>, requires_grad: bool) -> Result<Self> {
        Self::full(shape, 0.0, requires_grad)
    }

    pub fn ones(shape: impl Into<Shape>, requires_grad: bool) -> Result<Self> {
        Self::full(shape, 1.0, requires_grad)
    }

    pub fn full(shape: impl Into<Shape>, value: f32, requires_grad: bool) -> Result<Self> {
        Ok(Self::leaf(Buffer::full(shape.into(), value)?, requires_grad))
    }

    /// A leaf holding `data` in row-major order.
    pub fn from_slice(data: &[f32], shape: impl Into<Shape>, requires_grad: bool) -> Result<Self> {
        Ok(Self::leaf(
            Buffer::from_vec(data.to_vec(), shape.into())?,
            requires_grad,
        ))
    }

    pub fn scalar(value: f32, requires_grad: bool) -> Result<Self> {
        Self::full(Shape::scalar(), value, requires_grad)
    }

    /// Write into a leaf's elements in place.
    ///
    /// Only allowed while this handle is the sole owner of both the node and
    /// its storage, so no other tensor can observe the change.
    pub fn write_leaf(&mut self, f: impl FnOnce(&mut [f32])) -> Result<()> {
        if !self.is_leaf() {
            crate::bail!("write_leaf: tensor is not a leaf");
        }
        let refs = Arc::strong_count(&self.inner);
        let inner = Arc::get_mut(&mut self.inner).ok_or(Error::SharedStorage { refs })?;
        f(inner.buffer.elements_mut()?);
        Ok(())
    }

    // Accessors

    /// Unique tensor ID.
    pub fn id(&self) -> TensorId {
        self.inner.id
    }

    pub fn shape(&self) -> &Shape {
        self.inner.buffer.shape()
    }

    pub fn dims(&self) -> &[usize; RANK] {
        self.shape().dims()
    }

    pub fn strides(&self) -> &[usize; RANK] {
        self.inner.buffer.strides()
    }

    pub fn layout(&self) -> &Layout {
        self.inner.buffer.layout()
    }

    pub fn elem_count(&self) -> usize {
        self.shape().elem_count()
    }

    /// The forward value.
    pub fn buffer(&self) -> &Buffer {
        &self.inner.buffer
    }

    /// The op that created this tensor.
    pub fn op(&self) -> &Op {
        &self.inner.op
    }

    pub fn is_leaf(&self) -> bool {
        self.inner.op.is_leaf()
    }

    pub fn is_contiguous(&self) -> bool {
        self.inner.buffer.is_contiguous()
    }

    pub fn requires_grad(&self) -> bool {
        self.inner.requires_grad
    }

    /// Whether this tensor keeps its gradient after backward().
    /// Always true for leaves that require a gradient.
    pub fn retains_grad(&self) -> bool {
        self.inner.requires_grad
            && (self.is_leaf() || self.inner.retain_grad.load(Ordering::Relaxed))
    }

    /// Keep this intermediate tensor's gradient after backward().
    pub fn retain_grad(&self) -> &Self {
        self.inner.retain_grad.store(true, Ordering::Relaxed);
        self
    }

    /// Whether both tensors read from the same element storage.
    pub fn shares_storage(&self, other: &Tensor) -> bool {
        self.inner.buffer.shares_storage(&other.inner.buffer)
    }

    // Gradient access

    /// The accumulated gradient, if backward() has reached this tensor.
    pub fn grad(&self) -> Option<Buffer> {
        self.inner
            .grad
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// The accumulated gradient as a flat vector in row-major order.
    pub fn grad_vec(&self) -> Option<Vec<f32>> {
        self.grad().map(|g| g.to_vec())
    }

    /// Add `contribution` into this tensor's gradient buffer.
    pub(crate) fn accumulate_grad(&self, contribution: Buffer) -> Result<()> {
        if contribution.shape() != self.shape() {
            crate::bail!(
                "gradient of shape {} does not match tensor of shape {}",
                contribution.shape(),
                self.shape()
            );
        }
        let mut slot = self.inner.grad.write().unwrap_or_else(|e| e.into_inner());
        let updated = match slot.as_ref() {
            Some(existing) => existing.zip_map(&contribution, |a, b| a + b)?,
            None if contribution.is_contiguous() && contribution.storage_refs() == 1 => {
                contribution
            }
            None => contribution.to_contiguous()?,
        };
        *slot = Some(updated);
        Ok(())
    }

    /// Clear this tensor's gradient.
    pub fn zero_grad(&self) {
        *self.inner.grad.write().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Clear the gradient of this tensor and of every ancestor.
    pub fn zero_grad_graph(&self) {
        for t in crate::backprop::ancestors(self) {
            t.zero_grad();
        }
    }

    // Data extraction

    /// All elements as a flat vector in row-major order.
    pub fn to_vec(&self) -> Vec<f32> {
        self.inner.buffer.to_vec()
    }

    /// The single value of a one-element tensor.
    pub fn to_scalar(&self) -> Result<f32> {
        if self.elem_count() != 1 {
            return Err(Error::NotAScalar {
                shape: *self.shape(),
            });
        }
        self.inner.buffer.get(&[0; RANK])
    }

    /// Element at a five-axis index.
    pub fn get(&self, index: &[usize; RANK]) -> Result<f32> {
        self.inner.buffer.get(index)
    }

    /// Same buffer, no provenance, no gradient tracking.
    pub fn detach(&self) -> Self {
        Self::leaf(self.inner.buffer.clone(), false)
    }

    // Arithmetic operations (broadcasting)

    /// Element-wise addition: self + rhs.
    pub fn add(&self, rhs: &Self) -> Result<Self> {
        self.binary_op(rhs, BinaryOp::Add)
    }

    /// Element-wise subtraction: self - rhs.
    pub fn sub(&self, rhs: &Self) -> Result<Self> {
        self.binary_op(rhs, BinaryOp::Sub)
    }

    /// Element-wise multiplication: self * rhs.
    pub fn mul(&self, rhs: &Self) -> Result<Self> {
        self.binary_op(rhs, BinaryOp::Mul)
    }

    /// Element-wise division: self / rhs.
    pub fn div(&self, rhs: &Self) -> Result<Self> {
        self.binary_op(rhs, BinaryOp::Div)
    }

    /// Element-wise power: self ^ rhs.
    pub fn pow(&self, rhs: &Self) -> Result<Self> {
        self.binary_op(rhs, BinaryOp::Pow)
    }

    fn binary_op(&self, rhs: &Self, op: BinaryOp) -> Result<Self> {
        let result = self
            .inner
            .buffer
            .zip_map(&rhs.inner.buffer, |a, b| op.apply(a, b))?;
        Ok(Self::from_op(
            result,
            Op::Binary {
                lhs: self.clone(),
                rhs: rhs.clone(),
                op,
            },
        ))
    }

    // Unary operations

    /// max(x, 0)
    pub fn relu(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Relu)
    }

    pub fn neg(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Neg)
    }

    pub fn exp(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Exp)
    }

    /// Natural logarithm.
    pub fn log(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Log)
    }

    pub fn sigmoid(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Sigmoid)
    }

    pub fn sqrt(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Sqrt)
    }

    pub fn abs(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Abs)
    }

    /// -1, 0 or 1. Its gradient is zero everywhere.
    pub fn sign(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Sign)
    }

    /// 1 / x
    pub fn reciprocal(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Reciprocal)
    }

    fn unary_op(&self, op: UnaryOp) -> Result<Self> {
        let result = self.inner.buffer.map(|x| op.apply(x))?;
        Ok(Self::from_op(
            result,
            Op::Unary {
                input: self.clone(),
                op,
            },
        ))
    }

    // Reductions

    /// Sum over the given axes. Reduced axes stay in the shape with extent 1.
    ///
    /// An empty axis list copies the values but still records the op, so
    /// gradients route through it.
    pub fn sum(&self, axes: &[usize]) -> Result<Self> {
        self.sum_axes(AxisSet::from_axes(axes)?)
    }

    /// Sum every element into a [1, 1, 1, 1, 1] tensor.
    pub fn sum_all(&self) -> Result<Self> {
        self.sum_axes(AxisSet::all())
    }

    pub fn sum_axes(&self, axes: AxisSet) -> Result<Self> {
        let result = self.inner.buffer.sum_axes(&axes)?;
        Ok(Self::from_op(
            result,
            Op::Sum {
                input: self.clone(),
                axes,
            },
        ))
    }

    // Shape operations (these share storage where possible)

    /// Reinterpret the elements with a new shape of the same element count.
    ///
    /// Aliases this tensor's storage when it is contiguous. A non-contiguous
    /// tensor (e.g. the result of a permute) is copied first.
    pub fn view(&self, new_shape: impl Into<Shape>) -> Result<Self> {
        let new_shape = new_shape.into();
        let src_shape = *self.shape();
        let dst = new_shape.try_elem_count()?;
        if src_shape.elem_count() != dst {
            return Err(Error::ReshapeElementMismatch {
                src: src_shape.elem_count(),
                dst,
                dst_shape: new_shape,
            });
        }
        let buffer = if self.is_contiguous() {
            self.inner.buffer.view(new_shape)?
        } else {
            self.inner.buffer.to_contiguous()?.view(new_shape)?
        };
        Ok(Self::from_op(
            buffer,
            Op::View {
                input: self.clone(),
                src_shape,
            },
        ))
    }

    /// Broadcast size-1 axes to `target` without copying (stride 0).
    pub fn expand(&self, target: impl Into<Shape>) -> Result<Self> {
        let buffer = self.inner.buffer.expand(target.into())?;
        Ok(Self::from_op(
            buffer,
            Op::Expand {
                input: self.clone(),
                src_shape: *self.shape(),
            },
        ))
    }

    /// Reorder axes: axis `i` of the result is axis `order[i]` of self.
    ///
    /// permute(&[0, 1, 2, 4, 3]) on [1, 1, 1, A, B] → [1, 1, 1, B, A]
    pub fn permute(&self, order: &[usize]) -> Result<Self> {
        let order = validate_permutation(order)?;
        let buffer = self.inner.buffer.permute(&order)?;
        Ok(Self::from_op(
            buffer,
            Op::Permute {
                input: self.clone(),
                order,
            },
        ))
    }

    // Autograd

    /// Run reverse-mode differentiation from this tensor.
    ///
    /// Gradients are accumulated into every reachable tensor that requires
    /// one. A non-scalar tensor is seeded with ones everywhere, which is the
    /// same as calling backward on `self.sum_all()`. Repeated calls keep
    /// accumulating; use [`Tensor::zero_grad_graph`] to reset.
    pub fn backward(&self) -> Result<()> {
        crate::backprop::backward(self)
    }

    /// Backward with an explicit seed gradient of this tensor's shape.
    pub fn backward_with(&self, seed: Buffer) -> Result<()> {
        crate::backprop::backward_with(self, seed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leaf_constructors() {
        let t = Tensor::empty((2, 3), true).unwrap();
        assert!(t.is_leaf());
        assert!(t.requires_grad());
        assert!(!t.buffer().is_computed());
        assert_eq!(t.grad(), None);

        let s = Tensor::scalar(2.5, false).unwrap();
        assert_eq!(s.to_scalar().unwrap(), 2.5);
        assert!(Tensor::ones(3, false).unwrap().to_scalar().is_err());
    }

    #[test]
    fn test_requires_grad_propagates() {
        let a = Tensor::ones(3, true).unwrap();
        let b = Tensor::ones(3, false).unwrap();
        assert!(a.add(&b).unwrap().requires_grad());
        assert!(!b.mul(&b).unwrap().requires_grad());
    }

    #[test]
    fn test_broadcast_add() {
        let a = Tensor::from_slice(&[1.0, 2.0, 3.0], 3, false).unwrap();
        let b = Tensor::from_slice(&[10.0, 20.0], (2, 1), false).unwrap();
        let c = a.add(&b).unwrap();
        assert_eq!(c.dims(), &[1, 1, 1, 2, 3]);
        assert_eq!(c.to_vec(), vec![11.0, 12.0, 13.0, 21.0, 22.0, 23.0]);
    }

    #[test]
    fn test_view_aliases_contiguous() {
        let a = Tensor::from_slice(&[1.0, 2.0, 3.0, 4.0], 4, false).unwrap();
        let v = a.view((2, 2)).unwrap();
        assert!(v.shares_storage(&a));
        assert!(a.view((3, 1)).unwrap_err().is_shape_error());
    }

    #[test]
    fn test_view_of_permuted_copies() {
        let a = Tensor::from_slice(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], (2, 3), false).unwrap();
        let t = a.permute(&[0, 1, 2, 4, 3]).unwrap();
        assert!(t.shares_storage(&a));
        let v = t.view(6).unwrap();
        assert!(!v.shares_storage(&a));
        assert_eq!(v.to_vec(), vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }

    #[test]
    fn test_expand_aliases() {
        let a = Tensor::from_slice(&[1.0, 2.0], 2, false).unwrap();
        let e = a.expand((3, 2)).unwrap();
        assert!(e.shares_storage(&a));
        assert_eq!(e.strides()[3], 0);
        assert_eq!(e.to_vec(), vec![1.0, 2.0, 1.0, 2.0, 1.0, 2.0]);
        assert!(a.expand((3, 3)).unwrap_err().is_shape_error());
    }

    #[test]
    fn test_sum_keeps_reduced_axes() {
        let a = Tensor::from_slice(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], (2, 3), false).unwrap();
        let s = a.sum(&[3]).unwrap();
        assert_eq!(s.dims(), &[1, 1, 1, 1, 3]);
        assert_eq!(s.to_vec(), vec![5.0, 7.0, 9.0]);
        let none = a.sum(&[]).unwrap();
        assert_eq!(none.to_vec(), a.to_vec());
        assert!(matches!(none.op(), Op::Sum { .. }));
        assert!(a.sum(&[7]).is_err());
    }

    #[test]
    fn test_write_leaf() {
        let mut t = Tensor::empty(3, false).unwrap();
        t.write_leaf(|e| e.copy_from_slice(&[1.0, 2.0, 3.0])).unwrap();
        assert!(t.buffer().is_computed());
        assert_eq!(t.to_vec(), vec![1.0, 2.0, 3.0]);

        let view = t.view((3, 1)).unwrap();
        assert!(matches!(
            t.write_leaf(|e| e[0] = 9.0),
            Err(Error::SharedStorage { .. })
        ));
        drop(view);
        t.write_leaf(|e| e[0] = 9.0).unwrap();
        assert_eq!(t.to_vec(), vec![9.0, 2.0, 3.0]);
    }

    #[test]
    fn test_detach() {
        let a = Tensor::ones(2, true).unwrap();
        let d = a.mul(&a).unwrap().detach();
        assert!(d.is_leaf());
        assert!(!d.requires_grad());
    }
}

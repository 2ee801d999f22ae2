// Engine: handle-based interface
//
// A registry of live tensors addressed by opaque handles, for callers that
// cannot hold Rust values directly (an FFI layer, a scripting front end).
// Every entry point takes and returns handles; an unknown or freed handle is
// Error::TypeMismatch.
//
// Shape-like arguments (view/expand shapes, sum dims, permute orders) are
// themselves handles to small tensors whose values are non-negative
// integers. Shapes with fewer than five values are left-padded with 1.
//
// Freeing a handle only drops the registry's reference. Tensors created from
// it keep it alive through their provenance, so freeing an input before its
// outputs is always safe.

use std::collections::HashMap;

use tracing::debug;

use crate::backprop;
use crate::display;
use crate::error::{Error, Result};
use crate::init;
use crate::layout::validate_permutation;
use crate::op::{BinaryOp, UnaryOp};
use crate::shape::{AxisSet, Shape};
use crate::storage::Buffer;
use crate::tensor::Tensor;
use crate::RANK;

/// Opaque reference to a tensor registered in an [`Engine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorHandle(u64);

impl TensorHandle {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl From<u64> for TensorHandle {
    fn from(raw: u64) -> Self {
        TensorHandle(raw)
    }
}

/// Registry of live tensors.
#[derive(Debug, Default)]
pub struct Engine {
    tensors: HashMap<TensorHandle, Tensor>,
    next: u64,
}

impl Engine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an existing tensor and return its handle.
    pub fn insert(&mut self, t: Tensor) -> TensorHandle {
        self.next += 1;
        let handle = TensorHandle(self.next);
        debug!(handle = handle.0, id = t.id().as_u64(), op = t.op().name(), "register");
        self.tensors.insert(handle, t);
        handle
    }

    /// The tensor behind `handle`.
    pub fn get(&self, handle: TensorHandle) -> Result<&Tensor> {
        self.tensors
            .get(&handle)
            .ok_or(Error::TypeMismatch { handle: handle.0 })
    }

    fn get_mut(&mut self, handle: TensorHandle) -> Result<&mut Tensor> {
        self.tensors
            .get_mut(&handle)
            .ok_or(Error::TypeMismatch { handle: handle.0 })
    }

    /// Number of handles currently registered.
    pub fn live_handles(&self) -> usize {
        self.tensors.len()
    }

    // Creation and release

    /// A zero-filled, not yet computed leaf.
    pub fn empty_tensor(
        &mut self,
        shape: [usize; RANK],
        requires_grad: bool,
    ) -> Result<TensorHandle> {
        let t = Tensor::empty(shape, requires_grad)?;
        Ok(self.insert(t))
    }

    /// A leaf holding `data`. Without a shape it is (1, 1, 1, 1, data.len()).
    pub fn tensor(
        &mut self,
        data: &[f32],
        shape: Option<&[usize]>,
        requires_grad: bool,
    ) -> Result<TensorHandle> {
        let shape = match shape {
            Some(dims) => Shape::from_dims(dims)?,
            None => Shape::from(data.len()),
        };
        let buffer = Buffer::from_vec(data.to_vec(), shape)?;
        Ok(self.insert(Tensor::leaf(buffer, requires_grad)))
    }

    /// Release a handle. Releasing it twice is an error.
    pub fn free_tensor(&mut self, handle: TensorHandle) -> Result<()> {
        match self.tensors.remove(&handle) {
            Some(t) => {
                debug!(handle = handle.0, id = t.id().as_u64(), "free");
                Ok(())
            }
            None => Err(Error::TypeMismatch { handle: handle.0 }),
        }
    }

    // Initialisers

    /// Set every element of a leaf to `value`.
    pub fn fill(&mut self, handle: TensorHandle, value: f32) -> Result<()> {
        init::fill(self.get_mut(handle)?, value)
    }

    pub fn init_uniform(&mut self, handle: TensorHandle, low: f32, high: f32) -> Result<()> {
        init::uniform_(self.get_mut(handle)?, low, high)
    }

    pub fn init_normal(&mut self, handle: TensorHandle, mean: f32, std: f32) -> Result<()> {
        init::normal_(self.get_mut(handle)?, mean, std)
    }

    pub fn init_seed(&self, seed: u64) {
        init::seed(seed);
    }

    // Autograd

    pub fn backwards(&self, handle: TensorHandle) -> Result<()> {
        backprop::backward(self.get(handle)?)
    }

    pub fn grad(&self, handle: TensorHandle) -> Result<Option<Vec<f32>>> {
        Ok(self.get(handle)?.grad_vec())
    }

    pub fn zero_grad(&self, handle: TensorHandle) -> Result<()> {
        self.get(handle)?.zero_grad();
        Ok(())
    }

    // Operations

    pub fn add(
        &mut self,
        a: TensorHandle,
        b: TensorHandle,
        retain_grad: bool,
    ) -> Result<TensorHandle> {
        self.binary(a, b, BinaryOp::Add, retain_grad)
    }

    pub fn mul(
        &mut self,
        a: TensorHandle,
        b: TensorHandle,
        retain_grad: bool,
    ) -> Result<TensorHandle> {
        self.binary(a, b, BinaryOp::Mul, retain_grad)
    }

    pub fn relu(&mut self, a: TensorHandle, retain_grad: bool) -> Result<TensorHandle> {
        self.unary(a, UnaryOp::Relu, retain_grad)
    }

    /// Any element-wise binary op (add, sub, mul, div, pow).
    pub fn binary(
        &mut self,
        a: TensorHandle,
        b: TensorHandle,
        op: BinaryOp,
        retain_grad: bool,
    ) -> Result<TensorHandle> {
        let (lhs, rhs) = (self.get(a)?, self.get(b)?);
        let out = match op {
            BinaryOp::Add => lhs.add(rhs)?,
            BinaryOp::Sub => lhs.sub(rhs)?,
            BinaryOp::Mul => lhs.mul(rhs)?,
            BinaryOp::Div => lhs.div(rhs)?,
            BinaryOp::Pow => lhs.pow(rhs)?,
        };
        Ok(self.insert_result(out, retain_grad))
    }

    /// Any element-wise unary op.
    pub fn unary(
        &mut self,
        a: TensorHandle,
        op: UnaryOp,
        retain_grad: bool,
    ) -> Result<TensorHandle> {
        let input = self.get(a)?;
        let out = match op {
            UnaryOp::Relu => input.relu()?,
            UnaryOp::Neg => input.neg()?,
            UnaryOp::Exp => input.exp()?,
            UnaryOp::Log => input.log()?,
            UnaryOp::Sigmoid => input.sigmoid()?,
            UnaryOp::Sqrt => input.sqrt()?,
            UnaryOp::Abs => input.abs()?,
            UnaryOp::Sign => input.sign()?,
            UnaryOp::Reciprocal => input.reciprocal()?,
        };
        Ok(self.insert_result(out, retain_grad))
    }

    /// Sum over the axes listed in the `dims` tensor.
    pub fn sum(
        &mut self,
        a: TensorHandle,
        dims: TensorHandle,
        retain_grad: bool,
    ) -> Result<TensorHandle> {
        let axes = AxisSet::from_axes(&self.metadata(dims)?)?;
        let out = self.get(a)?.sum_axes(axes)?;
        Ok(self.insert_result(out, retain_grad))
    }

    pub fn view(&mut self, a: TensorHandle, shape: TensorHandle) -> Result<TensorHandle> {
        let shape = Shape::from_dims(&self.metadata(shape)?)?;
        let out = self.get(a)?.view(shape)?;
        Ok(self.insert(out))
    }

    pub fn expand(&mut self, a: TensorHandle, shape: TensorHandle) -> Result<TensorHandle> {
        let shape = Shape::from_dims(&self.metadata(shape)?)?;
        let out = self.get(a)?.expand(shape)?;
        Ok(self.insert(out))
    }

    /// Permute by the five axis indices in the `order` tensor.
    pub fn permute(&mut self, a: TensorHandle, order: TensorHandle) -> Result<TensorHandle> {
        let order = validate_permutation(&self.metadata(order)?)?;
        let out = self.get(a)?.permute(&order)?;
        Ok(self.insert(out))
    }

    fn insert_result(&mut self, t: Tensor, retain_grad: bool) -> TensorHandle {
        if retain_grad {
            t.retain_grad();
        }
        self.insert(t)
    }

    /// Decode a tensor of non-negative integer values.
    fn metadata(&self, handle: TensorHandle) -> Result<Vec<usize>> {
        self.get(handle)?
            .to_vec()
            .into_iter()
            .map(|v| {
                if v.is_finite() && v >= 0.0 && v.fract() == 0.0 {
                    Ok(v as usize)
                } else {
                    Err(Error::InvalidMetadata { value: v })
                }
            })
            .collect()
    }

    // Inspection

    /// Values in row-major order.
    pub fn values(&self, handle: TensorHandle) -> Result<Vec<f32>> {
        Ok(self.get(handle)?.to_vec())
    }

    pub fn shape(&self, handle: TensorHandle) -> Result<[usize; RANK]> {
        Ok(*self.get(handle)?.dims())
    }

    pub fn dump(&self, handle: TensorHandle) -> Result<String> {
        Ok(display::dump(self.get(handle)?))
    }

    pub fn graph(&self, handle: TensorHandle) -> Result<String> {
        Ok(display::graph(self.get(handle)?))
    }
}

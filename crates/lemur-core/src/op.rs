// Op: provenance record for automatic differentiation
//
// Every tensor that results from a computation records HOW it was created
// via the Op enum. This forms a directed acyclic graph (DAG) that backward()
// traverses to compute gradients.
//
// Example: c = a * b
//   a.op = Op::None (leaf)
//   b.op = Op::None (leaf)
//   c.op = Op::Binary { lhs: a, rhs: b, op: Mul }
//
// Each variant holds the actual input Tensors. Tensor is an Arc handle, so
// cloning is a refcount increment, and the graph itself keeps every input
// alive for as long as a descendant exists. There is no separate registry
// to keep in sync; dropping the last handle to the output releases the
// whole chain of intermediates that nothing else references.

use crate::shape::{AxisSet, Shape};
use crate::tensor::Tensor;
use crate::RANK;

/// Unique identifier for a tensor node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorId(pub(crate) u64);

impl Default for TensorId {
    fn default() -> Self {
        Self::new()
    }
}

impl TensorId {
    /// Generate a new unique tensor ID (uses a global atomic counter).
    pub fn new() -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        TensorId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// Element-wise binary operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

impl BinaryOp {
    pub fn apply(self, a: f32, b: f32) -> f32 {
        match self {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::Div => a / b,
            BinaryOp::Pow => a.powf(b),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
            BinaryOp::Div => "div",
            BinaryOp::Pow => "pow",
        }
    }
}

/// Element-wise unary operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Relu,
    Neg,
    Exp,
    Log,
    Sigmoid,
    Sqrt,
    Abs,
    Sign,
    Reciprocal,
}

impl UnaryOp {
    pub fn apply(self, x: f32) -> f32 {
        match self {
            UnaryOp::Relu => {
                if x > 0.0 {
                    x
                } else {
                    0.0
                }
            }
            UnaryOp::Neg => -x,
            UnaryOp::Exp => x.exp(),
            UnaryOp::Log => x.ln(),
            UnaryOp::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            UnaryOp::Sqrt => x.sqrt(),
            UnaryOp::Abs => x.abs(),
            UnaryOp::Sign => sign(x),
            UnaryOp::Reciprocal => 1.0 / x,
        }
    }

    /// d(op(x))/dx given the input `x` and the forward output `y`.
    pub fn derivative(self, x: f32, y: f32) -> f32 {
        match self {
            UnaryOp::Relu => {
                if x > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            UnaryOp::Neg => -1.0,
            UnaryOp::Exp => y,
            UnaryOp::Log => 1.0 / x,
            UnaryOp::Sigmoid => y * (1.0 - y),
            UnaryOp::Sqrt => 0.5 / y,
            UnaryOp::Abs => sign(x),
            UnaryOp::Sign => 0.0,
            UnaryOp::Reciprocal => -y * y,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            UnaryOp::Relu => "relu",
            UnaryOp::Neg => "neg",
            UnaryOp::Exp => "exp",
            UnaryOp::Log => "log",
            UnaryOp::Sigmoid => "sigmoid",
            UnaryOp::Sqrt => "sqrt",
            UnaryOp::Abs => "abs",
            UnaryOp::Sign => "sign",
            UnaryOp::Reciprocal => "reciprocal",
        }
    }
}

fn sign(x: f32) -> f32 {
    if x > 0.0 {
        1.0
    } else if x < 0.0 {
        -1.0
    } else {
        0.0
    }
}

/// Records the operation that produced a tensor, storing references to inputs.
///
/// Each variant carries exactly what its backward rule needs.
#[derive(Clone)]
pub enum Op {
    /// No operation: this is a leaf tensor (input data or parameter).
    None,

    /// Element-wise binary with broadcasting: result = op(lhs, rhs)
    Binary {
        lhs: Tensor,
        rhs: Tensor,
        op: BinaryOp,
    },

    /// Element-wise unary: result = op(input)
    Unary { input: Tensor, op: UnaryOp },

    /// Sum over `axes`, reduced axes kept at extent 1.
    Sum { input: Tensor, axes: AxisSet },

    /// Same elements, different shape. `src_shape` lets backward reshape
    /// the gradient back.
    View { input: Tensor, src_shape: Shape },

    /// Broadcast through zero strides.
    Expand { input: Tensor, src_shape: Shape },

    /// Axis `i` of the result is axis `order[i]` of the input.
    Permute {
        input: Tensor,
        order: [usize; RANK],
    },
}

impl Op {
    /// The input tensors of this op.
    pub fn inputs(&self) -> Vec<&Tensor> {
        match self {
            Op::None => vec![],
            Op::Binary { lhs, rhs, .. } => vec![lhs, rhs],
            Op::Unary { input, .. }
            | Op::Sum { input, .. }
            | Op::View { input, .. }
            | Op::Expand { input, .. }
            | Op::Permute { input, .. } => vec![input],
        }
    }

    /// Consume the op, handing back ownership of its inputs.
    pub(crate) fn into_inputs(self) -> Vec<Tensor> {
        match self {
            Op::None => vec![],
            Op::Binary { lhs, rhs, .. } => vec![lhs, rhs],
            Op::Unary { input, .. }
            | Op::Sum { input, .. }
            | Op::View { input, .. }
            | Op::Expand { input, .. }
            | Op::Permute { input, .. } => vec![input],
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, Op::None)
    }

    /// Operation name, as shown in graph dumps.
    pub fn name(&self) -> &'static str {
        match self {
            Op::None => "leaf",
            Op::Binary { op, .. } => op.name(),
            Op::Unary { op, .. } => op.name(),
            Op::Sum { .. } => "sum",
            Op::View { .. } => "view",
            Op::Expand { .. } => "expand",
            Op::Permute { .. } => "permute",
        }
    }
}

impl std::fmt::Debug for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ids: Vec<TensorId> = self.inputs().iter().map(|t| t.id()).collect();
        match self {
            Op::Sum { axes, .. } => write!(f, "Sum(axes={}, inputs={:?})", axes, ids),
            Op::Permute { order, .. } => write!(f, "Permute(order={:?}, inputs={:?})", order, ids),
            _ => write!(f, "{}({:?})", self.name(), ids),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique() {
        let a = TensorId::new();
        let b = TensorId::new();
        assert_ne!(a, b);
        assert!(b > a);
    }

    #[test]
    fn test_binary_apply() {
        assert_eq!(BinaryOp::Add.apply(2.0, 3.0), 5.0);
        assert_eq!(BinaryOp::Mul.apply(2.0, 3.0), 6.0);
        assert_eq!(BinaryOp::Pow.apply(2.0, 3.0), 8.0);
    }

    #[test]
    fn test_relu_derivative_is_zero_at_origin() {
        assert_eq!(UnaryOp::Relu.apply(-1.0), 0.0);
        assert_eq!(UnaryOp::Relu.derivative(0.0, 0.0), 0.0);
        assert_eq!(UnaryOp::Relu.derivative(0.5, 0.5), 1.0);
    }

    #[test]
    fn test_unary_derivatives() {
        let x = 0.3f32;
        let y = UnaryOp::Sigmoid.apply(x);
        assert!((UnaryOp::Sigmoid.derivative(x, y) - y * (1.0 - y)).abs() < 1e-7);
        let y = UnaryOp::Sqrt.apply(4.0);
        assert_eq!(UnaryOp::Sqrt.derivative(4.0, y), 0.25);
        let y = UnaryOp::Reciprocal.apply(2.0);
        assert_eq!(UnaryOp::Reciprocal.derivative(2.0, y), -0.25);
        assert_eq!(UnaryOp::Sign.apply(0.0), 0.0);
    }
}

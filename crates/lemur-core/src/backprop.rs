// Backpropagation: Reverse-mode automatic differentiation
//
// This module implements the backward pass, computing gradients of a root
// tensor with respect to every tensor in its computation graph that
// requires one.
//
// HOW IT WORKS:
//
//   1. Forward pass: tensor operations build a DAG where each tensor stores
//      its Op (the operation that created it) and its inputs.
//
//   2. backward() topologically sorts the DAG from the root to the leaves,
//      never descending into tensors that do not require a gradient.
//
//   3. The root is seeded with ones in its own shape. Walking the order in
//      reverse, each tensor adds its pending contribution into its gradient
//      buffer, then applies its Op's chain rule to produce contributions for
//      its inputs.
//
//   4. Intermediate tensors that were not asked to retain their gradient
//      release it once the pass is over.
//
// GRADIENT RULES (g = incoming gradient):
//
//   Add:        grad_a += g, grad_b += g
//   Sub:        grad_a += g, grad_b += -g
//   Mul:        grad_a += g * b, grad_b += g * a
//   Div:        grad_a += g / b, grad_b += -g * a / b²
//   Pow:        grad_a += g * b * a^(b-1)   (0 where b = 0)
//               grad_b += g * a^b * ln(a)   (0 where a <= 0)
//   Unary:      grad_in += g * f'(x)
//   Sum:        grad_in += g expanded back over the reduced axes
//   View:       grad_in += g reshaped to the source shape
//   Expand:     grad_in += g summed over the broadcast axes
//   Permute:    grad_in += g permuted by the inverse order
//
// Binary gradients are computed in the broadcast shape and then summed back
// down to each input's own shape.
//
// ACCUMULATION: a tensor used by several operations receives the SUM of all
// contributions (multivariate chain rule). For c = a * a,
// grad_a = g * a + g * a = 2 * a * g. Contributions are summed before the
// tensor is visited, and the topological order guarantees every consumer is
// visited first.

use std::collections::{HashMap, HashSet};

use tracing::{debug, instrument, trace};

use crate::error::{Error, Result};
use crate::layout::inverse_permutation;
use crate::op::{BinaryOp, Op, TensorId, UnaryOp};
use crate::shape::Shape;
use crate::storage::Buffer;
use crate::tensor::Tensor;

/// Topological order of the tensors that take part in backward.
///
/// Depth-first from the root, inputs before outputs. Tensors that do not
/// require a gradient are neither listed nor descended into.
fn build_topo(root: &Tensor) -> Vec<Tensor> {
    let mut visited = HashSet::new();
    let mut order = Vec::new();
    // (node, inputs already pushed)
    let mut stack = vec![(root.clone(), false)];
    while let Some((t, expanded)) = stack.pop() {
        if expanded {
            order.push(t);
            continue;
        }
        if !t.requires_grad() || !visited.insert(t.id()) {
            continue;
        }
        let inputs: Vec<Tensor> = t.op().inputs().into_iter().cloned().collect();
        stack.push((t, true));
        for input in inputs.into_iter().rev() {
            if !visited.contains(&input.id()) {
                stack.push((input, false));
            }
        }
    }
    order
}

/// Every tensor reachable from `root` through provenance, root included.
pub(crate) fn ancestors(root: &Tensor) -> Vec<Tensor> {
    let mut visited = HashSet::new();
    let mut stack = vec![root.clone()];
    let mut out = Vec::new();
    while let Some(t) = stack.pop() {
        if !visited.insert(t.id()) {
            continue;
        }
        stack.extend(t.op().inputs().into_iter().cloned());
        out.push(t);
    }
    out
}

/// Backward from `root`, seeded with ones in the root's shape.
///
/// For a scalar root this is dL/dL = 1. For any other root it is the same
/// as back-propagating `root.sum_all()`.
pub fn backward(root: &Tensor) -> Result<()> {
    let seed = Buffer::full(*root.shape(), 1.0)?;
    backward_with(root, seed)
}

/// Backward from `root` with an explicit seed gradient of the root's shape.
#[instrument(skip(root, seed), fields(root_id = root.id().as_u64(), shape = %root.shape()))]
pub fn backward_with(root: &Tensor, seed: Buffer) -> Result<()> {
    if !root.requires_grad() {
        return Err(Error::NoGradient);
    }
    if seed.shape() != root.shape() {
        crate::bail!(
            "seed gradient of shape {} does not match root of shape {}",
            seed.shape(),
            root.shape()
        );
    }

    let topo = build_topo(root);
    debug!(nodes = topo.len(), "starting backward pass");

    let mut pending: HashMap<TensorId, Buffer> = HashMap::new();
    pending.insert(root.id(), seed);

    for tensor in topo.iter().rev() {
        let grad_output = match pending.remove(&tensor.id()) {
            Some(g) => g,
            None => continue,
        };
        debug!(id = tensor.id().as_u64(), op = tensor.op().name(), "visit");

        match tensor.op() {
            Op::None => {}

            Op::Binary { lhs, rhs, op } => {
                binary_grad(*op, &grad_output, lhs, rhs, &mut pending)?;
            }

            Op::Unary { input, op } => {
                unary_grad(*op, &grad_output, input, tensor, &mut pending)?;
            }

            Op::Sum { input, .. } => {
                // Reduced axes kept extent 1, so the gradient expands straight back.
                let grad = grad_output.expand(*input.shape())?;
                push(&mut pending, input, grad)?;
            }

            Op::View { input, src_shape } => {
                push(&mut pending, input, reshape(&grad_output, *src_shape)?)?;
            }

            Op::Expand { input, src_shape } => {
                push(&mut pending, input, grad_output.reduce_to(src_shape)?)?;
            }

            Op::Permute { input, order } => {
                let grad = grad_output.permute(&inverse_permutation(order))?;
                push(&mut pending, input, grad)?;
            }
        }

        trace!(id = tensor.id().as_u64(), "accumulate gradient");
        tensor.accumulate_grad(grad_output)?;
    }

    for tensor in &topo {
        if !tensor.retains_grad() {
            debug!(id = tensor.id().as_u64(), op = tensor.op().name(), "release gradient");
            tensor.zero_grad();
        }
    }
    Ok(())
}

/// Add a contribution to `input`'s pending gradient.
fn push(pending: &mut HashMap<TensorId, Buffer>, input: &Tensor, grad: Buffer) -> Result<()> {
    if !input.requires_grad() {
        return Ok(());
    }
    let summed = match pending.remove(&input.id()) {
        Some(existing) => existing.zip_map(&grad, |a, b| a + b)?,
        None => grad,
    };
    pending.insert(input.id(), summed);
    Ok(())
}

/// Reshape a gradient, copying first if its layout is not contiguous.
fn reshape(grad: &Buffer, shape: Shape) -> Result<Buffer> {
    if grad.is_contiguous() {
        grad.view(shape)
    } else {
        grad.to_contiguous()?.view(shape)
    }
}

fn binary_grad(
    op: BinaryOp,
    g: &Buffer,
    lhs: &Tensor,
    rhs: &Tensor,
    pending: &mut HashMap<TensorId, Buffer>,
) -> Result<()> {
    let (a, b) = (lhs.buffer(), rhs.buffer());

    if lhs.requires_grad() {
        let grad_a = match op {
            BinaryOp::Add | BinaryOp::Sub => g.clone(),
            BinaryOp::Mul => g.zip_map(b, |g, b| g * b)?,
            BinaryOp::Div => g.zip_map(b, |g, b| g / b)?,
            // a^0 is constant, so its slope is 0 even at a = 0
            BinaryOp::Pow => g.zip3_map(a, b, |g, a, b| {
                if b == 0.0 {
                    0.0
                } else {
                    g * b * a.powf(b - 1.0)
                }
            })?,
        };
        push(pending, lhs, grad_a.reduce_to(lhs.shape())?)?;
    }

    if rhs.requires_grad() {
        let grad_b = match op {
            BinaryOp::Add => g.clone(),
            BinaryOp::Sub => g.map(|g| -g)?,
            BinaryOp::Mul => g.zip_map(a, |g, a| g * a)?,
            BinaryOp::Div => g.zip3_map(a, b, |g, a, b| -g * a / (b * b))?,
            BinaryOp::Pow => g.zip3_map(a, b, |g, a, b| {
                if a > 0.0 {
                    g * a.powf(b) * a.ln()
                } else {
                    0.0
                }
            })?,
        };
        push(pending, rhs, grad_b.reduce_to(rhs.shape())?)?;
    }
    Ok(())
}

fn unary_grad(
    op: UnaryOp,
    g: &Buffer,
    input: &Tensor,
    output: &Tensor,
    pending: &mut HashMap<TensorId, Buffer>,
) -> Result<()> {
    let grad = g.zip3_map(input.buffer(), output.buffer(), |g, x, y| {
        g * op.derivative(x, y)
    })?;
    push(pending, input, grad)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(data: &[f32], shape: impl Into<Shape>) -> Tensor {
        Tensor::from_slice(data, shape, true).unwrap()
    }

    #[test]
    fn test_topo_skips_constants() {
        let x = leaf(&[1.0, 2.0], 2);
        let c = Tensor::ones(2, false).unwrap();
        let y = x.mul(&c).unwrap().add(&c).unwrap();
        let order = build_topo(&y);
        let ids: Vec<_> = order.iter().map(|t| t.id()).collect();
        assert_eq!(ids.len(), 3);
        assert!(!ids.contains(&c.id()));
        assert_eq!(ids[0], x.id());
        assert_eq!(*ids.last().unwrap(), y.id());
    }

    #[test]
    fn test_no_gradient_root() {
        let c = Tensor::ones(2, false).unwrap();
        assert!(matches!(backward(&c), Err(Error::NoGradient)));
    }

    #[test]
    fn test_mul_grad() {
        let a = leaf(&[2.0, 3.0], 2);
        let b = leaf(&[4.0, 5.0], 2);
        a.mul(&b).unwrap().sum_all().unwrap().backward().unwrap();
        assert_eq!(a.grad_vec(), Some(vec![4.0, 5.0]));
        assert_eq!(b.grad_vec(), Some(vec![2.0, 3.0]));
    }

    #[test]
    fn test_div_grad() {
        let a = leaf(&[6.0], 1);
        let b = leaf(&[2.0], 1);
        a.div(&b).unwrap().backward().unwrap();
        assert_eq!(a.grad_vec(), Some(vec![0.5]));
        assert_eq!(b.grad_vec(), Some(vec![-1.5]));
    }

    #[test]
    fn test_pow_grad_guards_log() {
        let a = leaf(&[2.0, 0.0], 2);
        let b = leaf(&[3.0, 2.0], 2);
        a.pow(&b).unwrap().backward().unwrap();
        assert_eq!(a.grad_vec(), Some(vec![12.0, 0.0]));
        let gb = b.grad_vec().unwrap();
        assert!((gb[0] - 8.0 * 2f32.ln()).abs() < 1e-5);
        assert_eq!(gb[1], 0.0);
    }

    #[test]
    fn test_pow_grad_zero_exponent() {
        let a = leaf(&[0.0, 3.0], 2);
        let b = leaf(&[0.0, 0.0], 2);
        a.pow(&b).unwrap().backward().unwrap();
        assert_eq!(a.grad_vec(), Some(vec![0.0, 0.0]));
    }

    #[test]
    fn test_broadcast_against_empty_axis() {
        let a = leaf(&[2.0], 1);
        let b = Tensor::ones(0, true).unwrap();
        let c = a.add(&b).unwrap();
        assert_eq!(c.shape(), &Shape::from(0));
        c.backward().unwrap();
        assert_eq!(a.grad_vec(), Some(vec![0.0]));
        assert_eq!(b.grad_vec(), Some(vec![]));
    }

    #[test]
    fn test_deep_chain() {
        let x = leaf(&[1.0], 1);
        let mut y = x.clone();
        for _ in 0..100_000 {
            y = y.neg().unwrap();
        }
        assert_eq!(build_topo(&y).len(), 100_001);
        y.backward().unwrap();
        assert_eq!(x.grad_vec(), Some(vec![1.0]));
        drop(y);
    }

    #[test]
    fn test_sub_broadcast_grad() {
        let a = leaf(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], (2, 3));
        let b = leaf(&[1.0, 1.0, 1.0], 3);
        a.sub(&b).unwrap().backward().unwrap();
        assert_eq!(a.grad_vec(), Some(vec![1.0; 6]));
        assert_eq!(b.grad_vec(), Some(vec![-2.0, -2.0, -2.0]));
        assert_eq!(b.grad().unwrap().shape(), b.shape());
    }

    #[test]
    fn test_intermediate_released_unless_retained() {
        let x = leaf(&[1.0, 2.0], 2);
        let h = x.exp().unwrap();
        let k = h.neg().unwrap();
        k.retain_grad();
        let y = k.sum_all().unwrap();
        y.backward().unwrap();
        assert_eq!(h.grad(), None);
        assert_eq!(k.grad_vec(), Some(vec![1.0, 1.0]));
        assert_eq!(y.grad(), None);
        assert!(x.grad().is_some());
        // provenance survives the release
        assert!(matches!(h.op(), Op::Unary { .. }));
    }

    #[test]
    fn test_explicit_seed() {
        let x = leaf(&[1.0, 2.0], 2);
        let y = x.mul(&x).unwrap();
        let seed = Buffer::from_vec(vec![1.0, 10.0], Shape::from(2)).unwrap();
        backward_with(&y, seed).unwrap();
        assert_eq!(x.grad_vec(), Some(vec![2.0, 40.0]));

        let bad = Buffer::from_vec(vec![1.0], Shape::from(1)).unwrap();
        assert!(backward_with(&y, bad).is_err());
    }

    #[test]
    fn test_ancestors_include_constants() {
        let x = leaf(&[1.0], 1);
        let c = Tensor::ones(1, false).unwrap();
        let y = x.add(&c).unwrap();
        let ids: HashSet<_> = ancestors(&y).iter().map(|t| t.id()).collect();
        assert_eq!(ids.len(), 3);
        assert!(ids.contains(&c.id()));
    }
}

//! # lemur-core
//!
//! A small reverse-mode automatic differentiation engine over strided
//! tensors of fixed rank 5.
//!
//! This crate provides:
//! - [`Tensor`]: graph node holding a forward value, its provenance and its gradient
//! - [`Shape`] / [`Layout`] / [`Buffer`]: shapes, strides and shared element storage
//! - [`Op`]: the provenance record backward dispatches on
//! - [`init`]: seeded random and deterministic leaf initialisers
//! - [`Engine`]: a handle registry for callers that cannot hold Rust values
//! - [`display`]: value and graph dumps
//!
//! ```
//! use lemur_core::init;
//!
//! let leaf = init::arange(32, true)?;
//! let x = leaf.view((2, 4, 4))?;
//! let y = x.sum_all()?;
//! y.backward()?;
//! assert_eq!(y.to_scalar()?, 496.0);
//! assert_eq!(leaf.grad_vec(), Some(vec![1.0; 32]));
//! # Ok::<(), lemur_core::Error>(())
//! ```

// - Shape / AxisSet: rank-5 shapes, broadcasting, reduction axes
// - Layout: shape + strides, strided index iteration
// - Buffer: Arc-shared elements + layout, element kernels
// - Op / Tensor: provenance and graph nodes
// - backprop: topological sort and gradient rules
// - Engine: handle-based interface

pub mod backprop;
pub mod display;
pub mod error;
pub mod init;
pub mod interface;
pub mod layout;
pub mod op;
pub mod shape;
pub mod storage;
pub mod tensor;

/// Every shape and stride has exactly this many axes.
pub const RANK: usize = 5;

pub use display::{dump, graph, set_print_options, PrintOptions};
pub use error::{Error, ErrorKind, Result};
pub use interface::{Engine, TensorHandle};
pub use layout::Layout;
pub use op::{BinaryOp, Op, TensorId, UnaryOp};
pub use shape::{AxisSet, Shape};
pub use storage::Buffer;
pub use tensor::Tensor;

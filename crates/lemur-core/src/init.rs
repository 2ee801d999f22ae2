// Leaf initialisers
//
// Random and deterministic ways to fill leaf tensors. The in-place variants
// (`fill`, `uniform_`, `normal_`) write through `Tensor::write_leaf`, so they
// only succeed on a leaf whose storage nobody else can observe.
//
// Randomness comes from a per-thread StdRng. It starts from OS entropy;
// `seed` makes subsequent draws on the current thread reproducible.

use std::cell::RefCell;

use rand::distributions::{Distribution, Uniform};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::Normal;

use crate::error::{Error, Result};
use crate::shape::Shape;
use crate::tensor::Tensor;

thread_local! {
    static RNG: RefCell<StdRng> = RefCell::new(StdRng::from_entropy());
}

/// Reseed the current thread's generator.
pub fn seed(seed: u64) {
    RNG.with(|rng| *rng.borrow_mut() = StdRng::seed_from_u64(seed));
}

fn sample_into(out: &mut [f32], dist: &impl Distribution<f32>) {
    RNG.with(|rng| {
        let mut rng = rng.borrow_mut();
        for x in out.iter_mut() {
            *x = dist.sample(&mut *rng);
        }
    });
}

fn uniform_dist(low: f32, high: f32) -> Result<Uniform<f32>> {
    if low.is_nan() || high.is_nan() || low >= high {
        crate::bail!("uniform: empty range [{low}, {high})");
    }
    Ok(Uniform::new(low, high))
}

fn normal_dist(mean: f32, std: f32) -> Result<Normal<f32>> {
    Normal::new(mean, std).map_err(|e| Error::msg(format!("normal: {e}")))
}

// In-place

/// Set every element of a leaf to `value`.
pub fn fill(t: &mut Tensor, value: f32) -> Result<()> {
    t.write_leaf(|out| out.fill(value))
}

/// Overwrite a leaf with samples from U[low, high).
pub fn uniform_(t: &mut Tensor, low: f32, high: f32) -> Result<()> {
    let dist = uniform_dist(low, high)?;
    t.write_leaf(|out| sample_into(out, &dist))
}

/// Overwrite a leaf with samples from N(mean, std²).
pub fn normal_(t: &mut Tensor, mean: f32, std: f32) -> Result<()> {
    let dist = normal_dist(mean, std)?;
    t.write_leaf(|out| sample_into(out, &dist))
}

// Constructors

pub fn uniform(
    shape: impl Into<Shape>,
    low: f32,
    high: f32,
    requires_grad: bool,
) -> Result<Tensor> {
    let mut t = Tensor::empty(shape, requires_grad)?;
    uniform_(&mut t, low, high)?;
    Ok(t)
}

pub fn normal(
    shape: impl Into<Shape>,
    mean: f32,
    std: f32,
    requires_grad: bool,
) -> Result<Tensor> {
    let mut t = Tensor::empty(shape, requires_grad)?;
    normal_(&mut t, mean, std)?;
    Ok(t)
}

/// 0, 1, ..., n-1 as a (1, 1, 1, 1, n) leaf.
pub fn arange(n: usize, requires_grad: bool) -> Result<Tensor> {
    let mut t = Tensor::empty(n, requires_grad)?;
    t.write_leaf(|out| {
        for (i, x) in out.iter_mut().enumerate() {
            *x = i as f32;
        }
    })?;
    Ok(t)
}

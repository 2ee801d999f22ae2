// Display: human-readable dumps of tensors and their provenance
//
//   dump(&t)   nested values, shape and requires_grad (plus strides, op and
//              gradient in verbose mode)
//   graph(&t)  the provenance tree rooted at `t`, one line per node
//
// Both follow the current thread's PrintOptions.

use std::cell::RefCell;
use std::collections::HashSet;
use std::fmt::{self, Write};

use crate::op::TensorId;
use crate::storage::Buffer;
use crate::tensor::Tensor;
use crate::RANK;

/// Formatting switches for [`dump`] and [`graph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrintOptions {
    /// Include strides, storage sharing, the op and the gradient.
    pub verbose: bool,
    /// Scientific notation for element values.
    pub sci: bool,
    /// Digits after the decimal point.
    pub precision: usize,
}

impl Default for PrintOptions {
    fn default() -> Self {
        PrintOptions {
            verbose: false,
            sci: false,
            precision: 4,
        }
    }
}

impl PrintOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn sci(mut self, sci: bool) -> Self {
        self.sci = sci;
        self
    }

    pub fn precision(mut self, precision: usize) -> Self {
        self.precision = precision;
        self
    }

    fn format_value(&self, v: f32) -> String {
        if self.sci {
            format!("{:.*e}", self.precision, v)
        } else {
            format!("{:.*}", self.precision, v)
        }
    }
}

thread_local! {
    static PRINT_OPTIONS: RefCell<PrintOptions> = RefCell::new(PrintOptions::default());
}

/// The current thread's print options.
pub fn print_options() -> PrintOptions {
    PRINT_OPTIONS.with(|o| *o.borrow())
}

pub fn set_print_options(options: PrintOptions) {
    PRINT_OPTIONS.with(|o| *o.borrow_mut() = options);
}

/// Shorthand for toggling verbose output.
pub fn set_verbose_print(verbose: bool) {
    set_print_options(print_options().verbose(verbose));
}

/// Shorthand for toggling scientific notation.
pub fn set_sci_print(sci: bool) {
    set_print_options(print_options().sci(sci));
}

/// Run `f` with `options` installed, restoring the previous options after.
pub fn with_print_options<F, T>(options: PrintOptions, f: F) -> T
where
    F: FnOnce() -> T,
{
    let previous = print_options();
    set_print_options(options);
    let result = f();
    set_print_options(previous);
    result
}

// Value dump

/// Render a tensor's values and metadata.
pub fn dump(t: &Tensor) -> String {
    let opts = print_options();
    let mut out = String::new();
    // Writing into a String cannot fail.
    let _ = write_dump(&mut out, t, &opts);
    out
}

fn write_dump(out: &mut String, t: &Tensor, opts: &PrintOptions) -> fmt::Result {
    write!(out, "tensor(")?;
    write_values(out, t.buffer(), opts, "       ")?;
    write!(out, ", shape={}", t.shape())?;
    if t.requires_grad() {
        write!(out, ", requires_grad=true")?;
    }
    write!(out, ")")?;

    if opts.verbose {
        write!(
            out,
            "\n  id={} op={} strides={:?} contiguous={} computed={} storage_refs={}",
            t.id().as_u64(),
            t.op().name(),
            t.strides(),
            t.is_contiguous(),
            t.buffer().is_computed(),
            t.buffer().storage_refs(),
        )?;
        match t.grad() {
            Some(g) => {
                write!(out, "\n  grad=")?;
                write_values(out, &g, opts, "       ")?;
            }
            None => write!(out, "\n  grad=None")?,
        }
    }
    Ok(())
}

/// Nested brackets over all five axes, one innermost row per line.
fn write_values(
    out: &mut String,
    buf: &Buffer,
    opts: &PrintOptions,
    indent: &str,
) -> fmt::Result {
    if buf.elem_count() == 0 {
        return write!(out, "[]");
    }
    let values = buf.to_vec();
    let dims = *buf.shape().dims();
    write_axis(out, &values, &dims, 0, 0, opts, indent)
}

fn write_axis(
    out: &mut String,
    values: &[f32],
    dims: &[usize; RANK],
    axis: usize,
    start: usize,
    opts: &PrintOptions,
    indent: &str,
) -> fmt::Result {
    write!(out, "[")?;
    if axis == RANK - 1 {
        for i in 0..dims[axis] {
            if i > 0 {
                write!(out, ", ")?;
            }
            write!(out, "{}", opts.format_value(values[start + i]))?;
        }
        return write!(out, "]");
    }
    let block: usize = dims[axis + 1..].iter().product();
    for i in 0..dims[axis] {
        if i > 0 {
            // Blank lines between blocks grow with the depth of the boundary.
            write!(out, ",")?;
            for _ in 0..(RANK - 1 - axis) {
                writeln!(out)?;
            }
            write!(out, "{indent}{}", " ".repeat(axis + 1))?;
        }
        write_axis(out, values, dims, axis + 1, start + i * block, opts, indent)?;
    }
    write!(out, "]")
}

// Graph dump

/// Render the provenance tree rooted at `t`.
///
/// A node reached a second time (a diamond) is printed once more as a
/// reference line without its inputs.
pub fn graph(t: &Tensor) -> String {
    let opts = print_options();
    let mut out = String::new();
    let mut seen = HashSet::new();
    let _ = write_node(&mut out, t, "", "", &mut seen, &opts);
    out
}

fn write_node(
    out: &mut String,
    t: &Tensor,
    head: &str,
    tail: &str,
    seen: &mut HashSet<TensorId>,
    opts: &PrintOptions,
) -> fmt::Result {
    write!(out, "{head}{} #{} {}", t.op().name(), t.id().as_u64(), t.shape())?;
    if t.requires_grad() {
        write!(out, " requires_grad")?;
    }
    if opts.verbose {
        write!(out, " strides={:?}", t.strides())?;
        if t.grad().is_some() {
            write!(out, " has_grad")?;
        }
    }
    if !seen.insert(t.id()) {
        return writeln!(out, " (see above)");
    }
    writeln!(out)?;

    let inputs = t.op().inputs();
    let last = inputs.len().saturating_sub(1);
    for (i, input) in inputs.into_iter().enumerate() {
        let (branch, cont) = if i == last {
            ("└── ", "    ")
        } else {
            ("├── ", "│   ")
        };
        write_node(
            out,
            input,
            &format!("{tail}{branch}"),
            &format!("{tail}{cont}"),
            seen,
            opts,
        )?;
    }
    Ok(())
}

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&dump(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dump_values() {
        let t = Tensor::from_slice(&[1.0, 2.0, 3.0, 4.0], (2, 2), true).unwrap();
        let s = with_print_options(PrintOptions::new().precision(1), || dump(&t));
        assert!(s.starts_with("tensor([[[[[1.0, 2.0],\n"));
        assert!(s.contains("[3.0, 4.0]]]]]"));
        assert!(s.ends_with("shape=[1, 1, 1, 2, 2], requires_grad=true)"));
    }

    #[test]
    fn test_dump_sci_and_verbose() {
        let t = Tensor::scalar(1500.0, false).unwrap();
        let opts = PrintOptions::new().sci(true).precision(2).verbose(true);
        let s = with_print_options(opts, || dump(&t));
        assert!(s.contains("1.50e3"));
        assert!(s.contains("op=leaf"));
        assert!(s.contains("grad=None"));
        // options are restored afterwards
        assert_eq!(print_options(), PrintOptions::default());
    }

    #[test]
    fn test_dump_empty() {
        let t = Tensor::zeros(0, false).unwrap();
        assert!(dump(&t).starts_with("tensor([]"));
    }

    #[test]
    fn test_graph_tree() {
        let x = Tensor::ones(3, true).unwrap();
        let y = x.mul(&x).unwrap().sum_all().unwrap();
        let g = graph(&y);
        let lines: Vec<&str> = g.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("sum #"));
        assert!(lines[1].starts_with("└── mul #"));
        assert!(lines[2].starts_with("    ├── leaf #"));
        assert!(lines[3].starts_with("    └── leaf #"));
        assert!(lines[3].ends_with("(see above)"));
    }

    #[test]
    fn test_set_flags() {
        set_verbose_print(true);
        set_sci_print(true);
        let o = print_options();
        assert!(o.verbose && o.sci);
        set_print_options(PrintOptions::default());
    }
}

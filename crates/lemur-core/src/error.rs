use crate::shape::Shape;

/// All errors that can occur within Lemur.
///
/// Every operation is atomic: it either returns a new tensor or fails with
/// one of these and leaves the graph untouched. [`Error::kind`] groups the
/// variants into the coarse categories callers usually branch on.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The element buffer could not be reserved.
    #[error("allocation failed: could not reserve {elements} elements")]
    Allocation { elements: usize },

    /// Two shapes are not broadcast-compatible (e.g. [2,3] vs [2,4]).
    #[error("shapes {lhs} and {rhs} are not broadcast-compatible (axis {axis}: {l} vs {r})")]
    BroadcastMismatch {
        lhs: Shape,
        rhs: Shape,
        axis: usize,
        l: usize,
        r: usize,
    },

    /// Cannot view because element counts differ.
    #[error("cannot view: source has {src} elements, target shape {dst_shape} has {dst} elements")]
    ReshapeElementMismatch {
        src: usize,
        dst: usize,
        dst_shape: Shape,
    },

    /// Expand asked to grow an axis whose extent is not 1.
    #[error("cannot expand axis {axis} from {src} to {dst}: only size-1 axes can be expanded")]
    ExpandMismatch { axis: usize, src: usize, dst: usize },

    /// Permute order is not a permutation of all five axes.
    #[error("invalid permutation {order:?}: expected each of 0..5 exactly once")]
    InvalidPermutation { order: Vec<usize> },

    /// Axis index outside 0..RANK.
    #[error("axis {axis} out of range for rank {rank}")]
    AxisOutOfRange { axis: usize, rank: usize },

    /// Element count mismatch when creating from a slice.
    #[error("element count mismatch: shape {shape} requires {expected} elements, got {got}")]
    ElementCountMismatch {
        shape: Shape,
        expected: usize,
        got: usize,
    },

    /// More extents than the fixed maximum rank.
    #[error("rank {got} exceeds the maximum rank {max}")]
    RankTooLarge { got: usize, max: usize },

    /// A shape whose element count does not fit in `usize`.
    #[error("shape {shape} has more elements than can be addressed")]
    ShapeOverflow { shape: Shape },

    /// A layout whose strides reach past the end of its storage.
    #[error("layout {shape} with strides {strides:?} addresses offset {max_offset} beyond storage of {len} elements")]
    LayoutOutOfBounds {
        shape: Shape,
        strides: [usize; crate::RANK],
        max_offset: usize,
        len: usize,
    },

    /// A shape/axis/order tensor holds a value that is not a non-negative integer.
    #[error("invalid metadata value {value}: expected a non-negative integer")]
    InvalidMetadata { value: f32 },

    /// A handle that does not refer to a live tensor.
    #[error("handle {handle} does not refer to a live tensor")]
    TypeMismatch { handle: u64 },

    /// backward() called on a tensor that does not require gradients.
    #[error("backward called on a tensor that does not require gradients")]
    NoGradient,

    /// In-place initialisation of storage that is shared with other buffers.
    #[error("cannot write into shared storage ({refs} references)")]
    SharedStorage { refs: usize },

    /// Tried to read a scalar from a non-scalar tensor.
    #[error("not a scalar: tensor has shape {shape}")]
    NotAScalar { shape: Shape },

    /// Generic message for cases not covered above.
    #[error("{0}")]
    Msg(String),
}

/// Coarse error categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Allocation,
    Shape,
    TypeMismatch,
    Other,
}

impl Error {
    /// Create an error from any string message.
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Allocation { .. } => ErrorKind::Allocation,
            Error::BroadcastMismatch { .. }
            | Error::ReshapeElementMismatch { .. }
            | Error::ExpandMismatch { .. }
            | Error::InvalidPermutation { .. }
            | Error::AxisOutOfRange { .. }
            | Error::ElementCountMismatch { .. }
            | Error::RankTooLarge { .. }
            | Error::ShapeOverflow { .. }
            | Error::LayoutOutOfBounds { .. }
            | Error::InvalidMetadata { .. } => ErrorKind::Shape,
            Error::TypeMismatch { .. } => ErrorKind::TypeMismatch,
            Error::NoGradient
            | Error::SharedStorage { .. }
            | Error::NotAScalar { .. }
            | Error::Msg(_) => ErrorKind::Other,
        }
    }

    pub fn is_shape_error(&self) -> bool {
        self.kind() == ErrorKind::Shape
    }
}

/// Convenience Result type used throughout Lemur.
pub type Result<T> = std::result::Result<T, Error>;

/// Macro for early return with a formatted error message.
/// Usage: `bail!("something went wrong: {}", detail)`
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($($arg)*)))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        let e = Error::ExpandMismatch {
            axis: 2,
            src: 3,
            dst: 4,
        };
        assert!(e.is_shape_error());
        assert_eq!(Error::TypeMismatch { handle: 7 }.kind(), ErrorKind::TypeMismatch);
        assert_eq!(Error::Allocation { elements: 1 }.kind(), ErrorKind::Allocation);
        assert_eq!(Error::NoGradient.kind(), ErrorKind::Other);
    }

    #[test]
    fn test_bail() {
        fn check(n: usize) -> Result<usize> {
            if n > 3 {
                crate::bail!("{} is too large", n);
            }
            Ok(n)
        }
        assert_eq!(check(2).unwrap(), 2);
        let err = check(7).unwrap_err();
        assert!(matches!(&err, Error::Msg(m) if m == "7 is too large"));
        assert_eq!(err.kind(), ErrorKind::Other);
        assert!(Error::ShapeOverflow { shape: Shape::scalar() }.is_shape_error());
    }

    #[test]
    fn test_display() {
        let e = Error::ReshapeElementMismatch {
            src: 6,
            dst: 8,
            dst_shape: Shape::from((2, 4)),
        };
        assert_eq!(
            e.to_string(),
            "cannot view: source has 6 elements, target shape [1, 1, 1, 2, 4] has 8 elements"
        );
    }
}

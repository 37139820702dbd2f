use std::fmt;

/// The result type used across the whole crate.
pub type Result<T> = std::result::Result<T, RnnError>;

/// Errors surfaced by cells, arenas and sequence processors.
///
/// None of these are recovered internally; every variant is a contract
/// violation by the caller and is returned immediately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RnnError {
    /// A lazily-filled slot (`values`, `errors`, `relevance`, saved
    /// contributions) was read before anything assigned it.
    UninitializedAccess {
        /// Which slot was read (e.g. "values", "errors").
        what: &'static str,
    },

    /// An assigned array does not match the shape fixed at construction.
    ShapeMismatch {
        /// Human-readable context for the mismatch (e.g. "input values").
        what: &'static str,
        /// Observed length.
        got: usize,
        /// Expected length.
        expected: usize,
    },

    /// A cell or processor was built with unusable settings (unknown
    /// connection type, zero-sized layer, dropout outside `[0, 1)`).
    InvalidConfig(String),

    /// The invoked path is not available for the chosen configuration,
    /// e.g. the activated-input derivative of an activation that does not
    /// define one.
    UnsupportedOperation(&'static str),

    /// Relevance was asked to reach a neighbor state that does not exist
    /// in the current sequence.
    StructuralMisuse(&'static str),

    /// A caller-supplied sequence-level argument is invalid (empty input
    /// sequence, state index out of range, bad distribution).
    InvalidInput(String),
}

impl fmt::Display for RnnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RnnError::UninitializedAccess { what } => {
                write!(f, "{what} read before assignment")
            }
            RnnError::ShapeMismatch {
                what,
                got,
                expected,
            } => {
                write!(f, "shape mismatch for {what}: got {got}, expected {expected}")
            }
            RnnError::InvalidConfig(msg) => write!(f, "invalid configuration: {msg}"),
            RnnError::UnsupportedOperation(msg) => write!(f, "unsupported operation: {msg}"),
            RnnError::StructuralMisuse(msg) => write!(f, "structural misuse: {msg}"),
            RnnError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
        }
    }
}

impl std::error::Error for RnnError {}

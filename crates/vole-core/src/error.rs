use crate::shape::Shape;

/// All errors that can occur within vole.
///
/// A single enum is shared by every crate of the workspace: tensor shape
/// problems, graph-structure violations, execution-mode violations and
/// archive/IO failures all surface through it.
///
/// Contract violations of the concurrent-inference machinery (enabling
/// learning while references are alive, misusing the thread pool) are not
/// represented here; those are caller bugs and panic instead.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Shape mismatch between two tensors (e.g. adding [2,3] to [4,5]).
    #[error("shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: Shape, got: Shape },

    /// Element count mismatch when creating a tensor from a vec.
    #[error("element count mismatch: shape {shape} requires {expected} elements, got {got}")]
    ElementCountMismatch {
        shape: Shape,
        expected: usize,
        got: usize,
    },

    /// Matrix multiplication dimension mismatch.
    #[error("matmul shape mismatch: [{m}x{k1}] @ [{k2}x{n}], inner dims must match")]
    MatmulShapeMismatch {
        m: usize,
        k1: usize,
        k2: usize,
        n: usize,
    },

    /// Attempt to mutate a tensor through a borrowed (shared) handle.
    #[error("cannot write through a borrowed tensor handle: storage is owned by another network")]
    BorrowedStorage,

    /// No layer with this name exists in the graph.
    #[error("layer '{name}' not found")]
    LayerNotFound { name: String },

    /// A layer with this name is already part of the graph.
    #[error("layer '{name}' already exists")]
    DuplicateLayer { name: String },

    /// A layer was found but is not of the requested concrete type.
    #[error("layer '{name}' is not a {expected}")]
    LayerTypeMismatch { name: String, expected: &'static str },

    /// A connection refers to a producer that is not in the graph.
    #[error("layer '{consumer}' is connected to unknown layer '{producer}'")]
    DanglingConnection { consumer: String, producer: String },

    /// A connection refers to an output slot the producer does not have.
    #[error("layer '{producer}' has {count} outputs, output #{output} requested")]
    OutputOutOfRange {
        producer: String,
        output: usize,
        count: usize,
    },

    /// A layer received a wrong number of inputs.
    #[error("layer '{layer}' expects {expected} inputs, got {got}")]
    InputCountMismatch {
        layer: String,
        expected: usize,
        got: usize,
    },

    /// Removing a layer would leave another layer dangling.
    #[error("layer '{name}' still feeds layer '{consumer}'")]
    LayerInUse { name: String, consumer: String },

    /// A connection would introduce a cycle.
    #[error("connecting '{producer}' to '{consumer}' would create a cycle")]
    Cycle { producer: String, consumer: String },

    /// A source was run without data, or a result was read before any run.
    #[error("layer '{name}' has no blob")]
    MissingBlob { name: String },

    /// Training step requested while learning is disabled.
    #[error("learning is disabled on this network")]
    LearningDisabled,

    /// Training or topology change requested on a reference network.
    #[error("reference networks cannot be trained or modified")]
    ReferenceNetwork,

    /// Malformed or incompatible archive.
    #[error("archive error: {0}")]
    Archive(String),

    /// Underlying IO failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Generic message for cases not covered above.
    #[error("{0}")]
    Msg(String),
}

impl Error {
    /// Create an error from any string message.
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }

    /// Create an archive error from any string message.
    pub fn archive(s: impl Into<String>) -> Self {
        Error::Archive(s.into())
    }
}

/// Convenience Result type used throughout vole.
pub type Result<T> = std::result::Result<T, Error>;

/// Early return with a formatted error message.
/// Usage: `bail!("something went wrong: {}", detail)`
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($($arg)*)))
    };
}

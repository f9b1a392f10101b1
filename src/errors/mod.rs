//! # Error Handling
//!
//! Error types for the meshplane resource compiler and extension framework,
//! defined with `thiserror`. Patch application deliberately accumulates
//! errors instead of stopping at the first failure; `ErrorAccumulator`
//! collects per-resource errors into a single `Error::Multiple`.

/// Custom result type for meshplane operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the meshplane core
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Configuration decode or validation errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Resource build errors; fail one resource, not the whole compile
    #[error("Build error for {resource}: {message}")]
    Build { resource: String, message: String },

    /// Struct patcher path lookup failures
    #[error("{0}")]
    PathResolution(String),

    /// Struct patcher value/field type conflicts
    #[error("patch value type '{value_type}' could not be applied to target field type '{field_type}'")]
    TypeMismatch { value_type: String, field_type: String },

    /// Terminal fields the struct patcher cannot write
    #[error("unsupported target field type '{0}'")]
    UnsupportedField(String),

    /// Per-resource extension callback failures
    #[error("{0}")]
    Patch(String),

    /// Extender authorization failures; these abort the whole pass
    #[error("Privilege error: {0}")]
    Privilege(String),

    /// Several independent errors from one extender pass
    #[error("{}", join_errors(.0))]
    Multiple(Vec<Error>),

    /// Internal invariant violations
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config(message.into())
    }

    /// Create a new build error scoped to one named resource
    pub fn build<R: Into<String>, S: Into<String>>(resource: R, message: S) -> Self {
        Self::Build { resource: resource.into(), message: message.into() }
    }

    /// Create a new patch application error
    pub fn patch<S: Into<String>>(message: S) -> Self {
        Self::Patch(message.into())
    }

    /// Create a new privilege error
    pub fn privilege<S: Into<String>>(message: S) -> Self {
        Self::Privilege(message.into())
    }

    /// Create a new internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal(message.into())
    }
}

pub(crate) fn join_errors(errors: &[Error]) -> String {
    let joined = errors.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; ");
    format!("{} errors occurred: {}", errors.len(), joined)
}

/// Collects independent errors from one pass over the resource graph.
///
/// Extenders keep patching remaining resources after one of them fails, so
/// the per-resource errors are gathered here and surfaced together.
#[derive(Debug, Default)]
pub struct ErrorAccumulator {
    errors: Vec<Error>,
}

impl ErrorAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, err: Error) {
        match err {
            Error::Multiple(errs) => self.errors.extend(errs),
            other => self.errors.push(other),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// Ok if nothing was collected, the lone error if one, `Error::Multiple`
    /// otherwise.
    pub fn into_result(mut self) -> Result<()> {
        match self.errors.len() {
            0 => Ok(()),
            1 => Err(self.errors.remove(0)),
            _ => Err(Error::Multiple(self.errors)),
        }
    }
}

//! Ferry error types.

use std::sync::Arc;

/// A clonable trait-object inner error.
#[derive(Clone, Default)]
pub struct DynInnerError(
    pub Option<Arc<dyn std::error::Error + 'static + Send + Sync>>,
);

impl std::fmt::Debug for DynInnerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::fmt::Display for DynInnerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0.as_ref() {
            None => f.write_str("None"),
            Some(s) => s.fmt(f),
        }
    }
}

impl std::error::Error for DynInnerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.as_ref().map(|s| {
            let out: &(dyn std::error::Error + 'static) = &**s;
            out
        })
    }
}

impl DynInnerError {
    /// Construct a new DynInnerError from a source error.
    pub fn new<E: std::error::Error + 'static + Send + Sync>(e: E) -> Self {
        Self(Some(Arc::new(e)))
    }
}

/// The core ferry error type. This type is used in all external
/// ferry apis as well as internally in the transfer modules.
///
/// This type is required to implement `Clone` so that a terminal failure
/// cause captured by an aggregate transfer can be rethrown to every waiter.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FerryError {
    /// No usable provider or candidate existed at construction time.
    /// The transfer never started.
    #[error("transfer setup: {ctx} (src: {src})")]
    Setup {
        /// Any context associated with this error.
        ctx: Arc<str>,

        /// The inner error (if any).
        #[source]
        src: DynInnerError,
    },

    /// No byte progress within the stall timeout, or all known sources
    /// for one transfer were exhausted without success. Recoverable at
    /// the aggregate level until every candidate has been tried.
    #[error("transfer stalled: {ctx}")]
    Stalled {
        /// Any context associated with this error.
        ctx: Arc<str>,
    },

    /// The transfer was cancelled by the caller. Terminal, and
    /// distinguished from `Failed` so callers can skip retry logic.
    #[error("transfer cancelled")]
    Cancelled,

    /// A provider declined to handle a content reference.
    #[error("unsupported: {ctx}")]
    Unsupported {
        /// Any context associated with this error.
        ctx: Arc<str>,
    },

    /// Generic ferry internal error.
    #[error("{ctx} (src: {src})")]
    Other {
        /// Any context associated with this error.
        ctx: Arc<str>,

        /// The inner error (if any).
        #[source]
        src: DynInnerError,
    },
}

impl FerryError {
    /// Construct a setup error.
    pub fn setup<C: std::fmt::Display>(ctx: C) -> Self {
        Self::Setup {
            ctx: ctx.to_string().into_boxed_str().into(),
            src: DynInnerError::default(),
        }
    }

    /// Construct a setup error with an inner source error.
    pub fn setup_src<
        C: std::fmt::Display,
        S: std::error::Error + 'static + Send + Sync,
    >(
        ctx: C,
        src: S,
    ) -> Self {
        Self::Setup {
            ctx: ctx.to_string().into_boxed_str().into(),
            src: DynInnerError::new(src),
        }
    }

    /// Construct a stalled error.
    pub fn stalled<C: std::fmt::Display>(ctx: C) -> Self {
        Self::Stalled {
            ctx: ctx.to_string().into_boxed_str().into(),
        }
    }

    /// Construct an unsupported error.
    pub fn unsupported<C: std::fmt::Display>(ctx: C) -> Self {
        Self::Unsupported {
            ctx: ctx.to_string().into_boxed_str().into(),
        }
    }

    /// Construct an "other" error with an inner source error.
    pub fn other_src<
        C: std::fmt::Display,
        S: std::error::Error + 'static + Send + Sync,
    >(
        ctx: C,
        src: S,
    ) -> Self {
        Self::Other {
            ctx: ctx.to_string().into_boxed_str().into(),
            src: DynInnerError::new(src),
        }
    }

    /// Construct an "other" error.
    pub fn other<C: std::fmt::Display>(ctx: C) -> Self {
        Self::Other {
            ctx: ctx.to_string().into_boxed_str().into(),
            src: DynInnerError::default(),
        }
    }

    /// True if this error represents a caller-initiated cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// True if this error is the recoverable stalled variety.
    pub fn is_stalled(&self) -> bool {
        matches!(self, Self::Stalled { .. })
    }

    /// True if this error is a provider decline.
    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::Unsupported { .. })
    }
}

/// The core ferry result type.
pub type FerryResult<T> = Result<T, FerryError>;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn error_display() {
        assert_eq!(
            "bla (src: None)",
            FerryError::other("bla").to_string().as_str(),
        );
        assert_eq!(
            "foo (src: bar)",
            FerryError::other_src("foo", std::io::Error::other("bar"))
                .to_string()
                .as_str(),
        );
        assert_eq!(
            "transfer stalled: no progress",
            FerryError::stalled("no progress").to_string().as_str(),
        );
        assert_eq!(
            "transfer cancelled",
            FerryError::Cancelled.to_string().as_str(),
        );
        assert_eq!(
            "transfer setup: no candidates (src: None)",
            FerryError::setup("no candidates").to_string().as_str(),
        );
    }

    #[test]
    fn error_predicates() {
        assert!(FerryError::Cancelled.is_cancelled());
        assert!(!FerryError::other("x").is_cancelled());
        assert!(FerryError::stalled("x").is_stalled());
        assert!(FerryError::unsupported("x").is_unsupported());
    }

    #[test]
    fn ensure_error_type_is_send_and_sync() {
        fn ensure<T: std::fmt::Display + Send + Sync>(_t: T) {}
        ensure(FerryError::other("bla"));
    }
}

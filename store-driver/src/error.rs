use std::backtrace::Backtrace;
use std::error::Error as StdError;
use std::fmt;

use tracing_error::SpanTrace;

/// Categorizes storage errors by their meaning, independent of the backend
/// that produced them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorKind {
    /// A record or file was not found, without a more specific kind.
    NotFound,

    /// No image matches the ID, name or ID prefix.
    ImageUnknown,

    /// No container matches the ID or name.
    ContainerUnknown,

    /// No layer matches the ID or name.
    LayerUnknown,

    /// An ID or name is already taken.
    Duplicate,

    /// A layer is still used by an image, container or child layer.
    LayerInUse,

    /// An ID prefix matched more than one record.
    Ambiguous,

    /// The request was malformed.
    InvalidRequest,

    /// Disk I/O failed.
    Io,

    /// Records could not be encoded or decoded.
    Serialization,

    /// Anything else.
    Other,
}

impl StoreErrorKind {
    /// True for every flavour of "no such record".
    ///
    /// Destructive operations treat these as success, read operations as a
    /// hard error.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StoreErrorKind::NotFound
                | StoreErrorKind::ImageUnknown
                | StoreErrorKind::ContainerUnknown
                | StoreErrorKind::LayerUnknown
        )
    }

    /// True when the caller's input is at fault rather than the store.
    pub fn is_client_fault(&self) -> bool {
        matches!(
            self,
            StoreErrorKind::Duplicate | StoreErrorKind::Ambiguous | StoreErrorKind::InvalidRequest
        )
    }
}

impl fmt::Display for StoreErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreErrorKind::NotFound => write!(f, "not found"),
            StoreErrorKind::ImageUnknown => write!(f, "image not known"),
            StoreErrorKind::ContainerUnknown => write!(f, "container not known"),
            StoreErrorKind::LayerUnknown => write!(f, "layer not known"),
            StoreErrorKind::Duplicate => write!(f, "already in use"),
            StoreErrorKind::LayerInUse => write!(f, "layer is in use"),
            StoreErrorKind::Ambiguous => write!(f, "ambiguous prefix"),
            StoreErrorKind::InvalidRequest => write!(f, "invalid request"),
            StoreErrorKind::Io => write!(f, "I/O error"),
            StoreErrorKind::Serialization => write!(f, "serialization error"),
            StoreErrorKind::Other => write!(f, "other error"),
        }
    }
}

#[derive(Debug)]
struct ErrorTrace {
    /// Controlled by RUST_BACKTRACE.
    backtrace: Backtrace,

    /// The span context where the error was created.
    span_trace: SpanTrace,
}

impl ErrorTrace {
    #[track_caller]
    fn capture() -> Self {
        ErrorTrace {
            backtrace: Backtrace::capture(),
            span_trace: SpanTrace::capture(),
        }
    }
}

/// Error returned by every [`crate::Store`] operation.
///
/// Carries a [`StoreErrorKind`] for branching, the engine that produced it,
/// the record ID involved where there is one, and the backtrace and span
/// trace at the point of creation.
///
/// ```rust
/// use store_driver::{StoreError, StoreErrorKind};
///
/// let error = StoreError::builder(
///     "memory",
///     StoreErrorKind::ContainerUnknown,
///     "no container with that name",
/// )
/// .id("c1")
/// .context("delete container")
/// .build();
/// assert!(error.is_not_found());
/// ```
#[derive(Debug)]
pub struct StoreError {
    kind: StoreErrorKind,
    engine: &'static str,
    id: Option<String>,
    context: Option<String>,
    source: Box<dyn StdError + Send + Sync + 'static>,
    traces: Box<ErrorTrace>,
}

impl StdError for StoreError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(self.source.as_ref())
    }
}

impl StoreError {
    /// Create an error with the minimum required information.
    pub fn new<E>(engine: &'static str, kind: StoreErrorKind, error: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        Self {
            kind,
            engine,
            id: None,
            context: None,
            source: error.into(),
            traces: Box::new(ErrorTrace::capture()),
        }
    }

    /// Start building an error with optional context.
    pub fn builder<E>(engine: &'static str, kind: StoreErrorKind, error: E) -> StoreErrorBuilder
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        StoreErrorBuilder {
            engine,
            kind,
            source: error.into(),
            id: None,
            context: None,
        }
    }

    /// A closure for `.map_err()` that wraps any error.
    ///
    /// ```rust
    /// use store_driver::{StoreError, StoreErrorKind};
    ///
    /// fn read() -> Result<String, StoreError> {
    ///     std::fs::read_to_string("/nonexistent/records.json")
    ///         .map_err(StoreError::with("local", StoreErrorKind::Io))
    /// }
    /// assert!(read().is_err());
    /// ```
    pub fn with<E>(
        engine: &'static str,
        kind: StoreErrorKind,
    ) -> Box<dyn FnOnce(E) -> StoreError + Send + Sync>
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        Box::new(move |error: E| StoreError::new(engine, kind, error))
    }

    /// Shorthand for an unknown-record error about `id`.
    pub fn unknown(engine: &'static str, kind: StoreErrorKind, id: &str) -> Self {
        StoreError::builder(engine, kind, format!("{kind}: {id}"))
            .id(id)
            .build()
    }

    /// The error kind.
    pub fn kind(&self) -> StoreErrorKind {
        self.kind
    }

    /// The storage engine that produced this error.
    pub fn engine(&self) -> &'static str {
        self.engine
    }

    /// The record ID involved, if any.
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// Additional context, if any.
    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    /// See [`StoreErrorKind::is_not_found`].
    pub fn is_not_found(&self) -> bool {
        self.kind.is_not_found()
    }

    /// The captured backtrace.
    pub fn backtrace(&self) -> &Backtrace {
        &self.traces.backtrace
    }

    /// The tracing span context at the point the error was created.
    pub fn span_trace(&self) -> &SpanTrace {
        &self.traces.span_trace
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Store error [{}] from {}", self.kind, self.engine)?;

        if let Some(id) = &self.id {
            write!(f, " (id: {id})")?;
        }

        if let Some(context) = &self.context {
            write!(f, " ({context})")?;
        }

        write!(f, ": {}", self.source)
    }
}

/// Builder for [`StoreError`] with optional context fields.
#[derive(Debug)]
pub struct StoreErrorBuilder {
    kind: StoreErrorKind,
    engine: &'static str,
    source: Box<dyn StdError + Send + Sync + 'static>,
    id: Option<String>,
    context: Option<String>,
}

impl StoreErrorBuilder {
    /// Set the record ID.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set additional context.
    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Build the error.
    #[track_caller]
    pub fn build(self) -> StoreError {
        StoreError {
            kind: self.kind,
            engine: self.engine,
            id: self.id,
            context: self.context,
            source: self.source,
            traces: Box::new(ErrorTrace::capture()),
        }
    }
}

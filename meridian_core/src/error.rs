use std::error::Error as StdError;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for `meridian_core`.
///
/// Backend implementations (catalog HTTP client, disk queue, etc.) should
/// preserve the underlying error chain where possible via `Error::backend`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Another worker got there first (e.g. a run was already acknowledged).
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("queue is shut down")]
    QueueClosed,

    #[error("processing timed out after {0}ms")]
    Timeout(u64),

    /// A selector expression evaluated to something other than a boolean.
    #[error("selector for kind '{kind}' returned a non-boolean value: {value}")]
    SelectorNotBoolean { kind: String, value: String },

    #[error("failed to parse expression '{expression}': {reason}")]
    InvalidExpression { expression: String, reason: String },

    /// Relations between the mutated entities form a cycle, so no safe apply
    /// order exists.
    #[error(
        "cyclic relations detected between entities ({hint}); ordering requires the explicit \
         'merge on create' or 'delete dependents' configuration flags rather than guessing"
    )]
    CyclicRelations { hint: String },

    /// Per-record failures collected at a batch boundary.
    #[error("{} recoverable failure(s) during batch: {}", .0.len(), .0.join("; "))]
    Aggregate(Vec<String>),

    #[error("catalog returned non-success status: {status}")]
    CatalogNonSuccess { status: u16 },

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),

    #[error("backend error: {context}")]
    Backend {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync + 'static>,
    },

    #[error("{message}")]
    Message { message: String },
}

impl Error {
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message {
            message: message.into(),
        }
    }

    pub fn backend(
        context: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::Backend {
            context: context.into(),
            source: Box::new(source),
        }
    }

    /// Whether this error reflects a failing collaborator rather than bad
    /// input. A sync cycle that saw infrastructure errors has an incomplete
    /// view of current state and must skip its destructive delete phase.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            Self::Sqlx(_)
                | Self::Reqwest(_)
                | Self::Backend { .. }
                | Self::CatalogNonSuccess { .. }
        )
    }
}

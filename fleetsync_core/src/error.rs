use std::error::Error as StdError;

/// Common error type for `fleetsync_core`.
///
/// Store drivers (Redis, Mongo, Postgres, SQL Server) preserve the underlying error
/// chain via `Error::backend`.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("backend error: {context}")]
    Backend {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync + 'static>,
    },

    #[error("backend error: {0}")]
    BackendMessage(String),

    /// Too many watermark write-backs failed; the agent must stop.
    #[error("watermark write failures exceeded threshold ({failures} > {threshold})")]
    WatermarkBreakerOpen { failures: u32, threshold: u32 },
}

impl Error {
    pub fn backend(
        context: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::Backend {
            context: context.into(),
            source: Box::new(source),
        }
    }

    /// True for errors that must terminate the process rather than be logged.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::WatermarkBreakerOpen { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

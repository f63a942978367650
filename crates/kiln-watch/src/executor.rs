/// Result of a successful build, as far as the coordinator cares: it never
/// inspects the artifact, only reports its size and moves on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildOutput {
    /// Byte length of the produced output.
    pub output_bytes: u64,
}

/// A failed build, carrying a human-readable message for the log line.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct BuildError {
    message: String,
}

impl BuildError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// The build boundary.
///
/// The coordinator treats a build as opaque: one call, one success-or-failure
/// outcome. Implementations are free to parallelize internally (bundlers
/// usually do); the coordinator guarantees at most one call is in flight at
/// a time and never imposes a timeout: a hung build hangs the watch session,
/// and callers needing a hard limit must enforce it inside the executor.
pub trait BuildExecutor: Send + Sync {
    fn build(&self) -> Result<BuildOutput, BuildError>;
}

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PsgateError {
    // Policy rejections
    #[error("Command blocked by security policy: {category}: {reason}")]
    Blocked { category: String, reason: String },

    #[error("Confirmation required for {level} command: {reason}")]
    ConfirmationRequired { level: String, reason: String },

    #[error("Rate limit exceeded, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    // Working directory policy
    #[error("Working directory not found: {0}")]
    WorkingDirNotFound(String),

    #[error("Working directory outside allowed roots: {0}")]
    WorkingDirOutOfRoot(String),

    // Dispatch errors
    #[error("Invalid arguments: {0}")]
    InvalidArgs(String),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    // Execution errors
    #[error("Process spawn failed: {0}")]
    SpawnFailed(String),

    // Learning store errors
    #[error("Learning store persistence failed: {0}")]
    Persist(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Pattern '{id}' failed to compile: {message}")]
    PatternCompile { id: String, message: String },

    // Catch-all for unexpected conditions; details go to audit, not the caller
    #[error("Internal error: {0}")]
    Internal(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PsgateError {
    /// Stable wire code for this error, surfaced in outcome `reason` fields
    /// and mapped to JSON-RPC codes by the transport.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Blocked { .. } => "BLOCKED",
            Self::ConfirmationRequired { .. } => "CONFIRMATION_REQUIRED",
            Self::RateLimited { .. } => "RATE_LIMITED",
            Self::WorkingDirNotFound(_) => "WORKING_DIR_NOT_FOUND",
            Self::WorkingDirOutOfRoot(_) => "WORKING_DIR_OUT_OF_ROOT",
            Self::InvalidArgs(_) => "INVALID_ARGS",
            Self::ToolNotFound(_) => "INVALID_ARGS",
            Self::SpawnFailed(_) => "SPAWN_FAILED",
            Self::Persist(_) | Self::Config(_) | Self::PatternCompile { .. } => "INTERNAL",
            Self::Internal(_) | Self::Io(_) | Self::Json(_) => "INTERNAL",
        }
    }

    /// Whether this error is a policy decision rather than a fault.
    /// Policy rejections surface as outcome-shaped payloads, not errors.
    pub fn is_policy(&self) -> bool {
        matches!(
            self,
            Self::Blocked { .. }
                | Self::ConfirmationRequired { .. }
                | Self::RateLimited { .. }
                | Self::WorkingDirNotFound(_)
                | Self::WorkingDirOutOfRoot(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, PsgateError>;

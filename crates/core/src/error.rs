use std::time::Duration;

/// Result alias that carries the custom [`BridgeError`] type.
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Common error type for the bridge crate.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// Index access beyond the end of a color buffer or spectrum.
    #[error("index {index} is out of range for length {len}")]
    OutOfRange { index: i64, len: usize },
    /// Attempted write through a read-only spectrum proxy.
    #[error("spectrum snapshot is read-only: cannot assign `{0}`")]
    ImmutableAccess(&'static str),
    /// Uncaught failure raised by the script body.
    #[error("script fault: {0}")]
    ScriptFault(String),
    /// The script ran past its per-frame time budget.
    #[error("script exceeded its frame budget ({elapsed:?} > {budget:?})")]
    BudgetExceeded { elapsed: Duration, budget: Duration },
    /// A proxy was used outside of the invocation it was created for.
    #[error("view unavailable: {0}")]
    ViewUnavailable(&'static str),
    /// The script source could not be loaded or compiled.
    #[error("failed to compile script: {0}")]
    Compile(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("{0}")]
    Message(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Fft(#[from] realfft::FftError),
}

impl BridgeError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    /// Short, stable label used in diagnostics and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::OutOfRange { .. } => "out_of_range",
            Self::ImmutableAccess(_) => "immutable_access",
            Self::ScriptFault(_) => "script_fault",
            Self::BudgetExceeded { .. } => "budget_exceeded",
            Self::ViewUnavailable(_) => "view_unavailable",
            Self::Compile(_) => "compile",
            Self::InvalidConfig(_) => "invalid_config",
            Self::Message(_) => "message",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
            Self::Fft(_) => "fft",
        }
    }
}

impl From<&str> for BridgeError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for BridgeError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}

//! Error types shared across the crate.

use std::fmt::{Display, Formatter};

/// Shared crate result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// The fixed ACP error code set a runtime backend or the session manager
/// raises. Mirrors the taxonomy in the session-manager contract: exactly
/// one of these codes accompanies every `AppError::Acp*` variant, and is
/// what callers match on (tests, the inbound dispatcher's deterministic
/// reply text, `errorsByCode` observability counters).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AcpErrorCode {
    /// Ensure or metadata write failed, admission limit reached, or the
    /// session is not ACP-enabled.
    SessionInitFailed,
    /// Runtime event stream errored, or cancel/close failed unexpectedly;
    /// the default for unrecognized backend errors.
    TurnFailed,
    /// No backend registered for the configured id.
    BackendMissing,
    /// Backend known but currently unreachable.
    BackendUnavailable,
    /// Requested `setMode`/`setConfigOption` (or a non-advertised key) is
    /// unsupported by the backend's capabilities.
    UnsupportedControl,
    /// Validator rejected `cwd`, `timeoutSeconds`, or mode input before any
    /// backend call was made.
    InvalidRuntimeOption,
    /// Policy blocks ACP dispatch despite an ACP-shaped session key.
    DispatchDisabled,
}

impl AcpErrorCode {
    /// The stable wire/log code string, e.g. `ACP_SESSION_INIT_FAILED`.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SessionInitFailed => "ACP_SESSION_INIT_FAILED",
            Self::TurnFailed => "ACP_TURN_FAILED",
            Self::BackendMissing => "ACP_BACKEND_MISSING",
            Self::BackendUnavailable => "ACP_BACKEND_UNAVAILABLE",
            Self::UnsupportedControl => "ACP_BACKEND_UNSUPPORTED_CONTROL",
            Self::InvalidRuntimeOption => "ACP_INVALID_RUNTIME_OPTION",
            Self::DispatchDisabled => "ACP_DISPATCH_DISABLED",
        }
    }
}

impl Display for AcpErrorCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Crate-wide error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// A typed ACP failure from §7's error taxonomy.
    Acp {
        /// The fixed code.
        code: AcpErrorCode,
        /// Human-readable detail, surfaced verbatim in deterministic replies.
        message: String,
    },
    /// Configuration parsing or validation failure.
    Config(String),
    /// Persistence failure when interacting with `SQLite`.
    Db(String),
    /// Access-control policy rejected the message.
    AccessControlBlocked(String),
    /// SSRF guard rejected a fetch target.
    SsrfBlocked(String),
    /// File-system or I/O operation failure.
    Io(String),
    /// Requested entity does not exist.
    NotFound(String),
}

impl AppError {
    /// Construct an `Acp` error from a code and message.
    #[must_use]
    pub fn acp(code: AcpErrorCode, message: impl Into<String>) -> Self {
        Self::Acp {
            code,
            message: message.into(),
        }
    }

    /// The ACP error code, if this is an `Acp` variant.
    #[must_use]
    pub const fn acp_code(&self) -> Option<AcpErrorCode> {
        match self {
            Self::Acp { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Acp { code, message } => write!(f, "ACP error ({code}): {message}"),
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Db(msg) => write!(f, "db: {msg}"),
            Self::AccessControlBlocked(msg) => write!(f, "access control: {msg}"),
            Self::SsrfBlocked(msg) => write!(f, "ssrf guard: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        Self::Db(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Db(format!("json: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

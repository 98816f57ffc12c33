//! Error type shared by the OS-facing backends

/// A native call that failed or was refused by the OS.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{call} failed: {message}")]
pub struct OsError {
    pub call: &'static str,
    pub message: String,
}

impl OsError {
    pub fn new(call: &'static str, message: impl Into<String>) -> Self {
        Self {
            call,
            message: message.into(),
        }
    }
}

#[cfg(windows)]
impl From<(&'static str, windows::core::Error)> for OsError {
    fn from((call, err): (&'static str, windows::core::Error)) -> Self {
        Self::new(call, err.to_string())
    }
}

use std::fmt;

/// Errors surfaced at the Session API boundary.
///
/// Internal plumbing uses `anyhow::Result` throughout this crate, the same
/// as the rest of this codebase; this enum exists only where callers need
/// to `match` on a specific outcome rather than read an error string, the
/// way `storage.rs`'s `StorageCapacityError` gives disk-space failures a
/// concrete shape.
#[derive(Debug, Clone)]
pub enum StitchError {
    InvalidRect(String),
    AlreadyRunning,
    NotRunning,
    CaptureFailed(String),
    LostAlignment,
    OutOfMemory(String),
    InternalError(String),
}

impl fmt::Display for StitchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StitchError::InvalidRect(detail) => write!(f, "invalid capture rectangle: {detail}"),
            StitchError::AlreadyRunning => write!(f, "session is already running"),
            StitchError::NotRunning => write!(f, "session is not running"),
            StitchError::CaptureFailed(detail) => write!(f, "capture failed: {detail}"),
            StitchError::LostAlignment => write!(
                f,
                "lost alignment: repeated unrelated frames with jump-append disabled"
            ),
            StitchError::OutOfMemory(detail) => write!(f, "out of memory: {detail}"),
            StitchError::InternalError(detail) => write!(f, "internal error: {detail}"),
        }
    }
}

impl std::error::Error for StitchError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages_are_human_readable() {
        assert_eq!(
            StitchError::InvalidRect("zero height".to_string()).to_string(),
            "invalid capture rectangle: zero height"
        );
        assert_eq!(
            StitchError::LostAlignment.to_string(),
            "lost alignment: repeated unrelated frames with jump-append disabled"
        );
    }
}

use thiserror::Error;

/// Error taxonomy for the pre-transcoding pipeline.
///
/// The worker classifies a job outcome by the variant it receives: fatal
/// variants mark the job `failed` permanently, everything else is eligible
/// for the retry policy.
#[derive(Error, Debug)]
pub enum TranscodeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The probe could not parse the source container. Never retried.
    #[error("corrupted source: {0}")]
    CorruptedSource(String),

    /// The GPU decode path rejected the stream. Recovered locally by
    /// re-running the pass with software decode.
    #[error("hardware decode failed: {0}")]
    HardwareDecode(String),

    /// Post-encode validation rejected the output directory.
    #[error("output validation failed: {0}")]
    Validation(String),

    /// FFmpeg exited non-zero for a reason not covered by a more specific
    /// variant.
    #[error("transcode failed: {0}")]
    TranscoderCrash(String),

    #[error("job cancelled")]
    Cancelled,

    #[error("state persistence failed: {0}")]
    Persistence(String),

    #[error("metadata sync failed: {0}")]
    MetadataSync(String),

    #[error("not found: {0}")]
    NotFound(String),
}

/// Substrings in an error message that forbid a retry regardless of the
/// remaining retry budget.
pub const FATAL_ERROR_MARKERS: &[&str] = &["SIGKILL", "SIGTERM", "corrupted", "Invalid data"];

impl TranscodeError {
    /// Whether this error must never be retried.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::CorruptedSource(_) | Self::Cancelled => true,
            other => message_is_fatal(&other.to_string()),
        }
    }
}

/// Message-level fatality check, applied by the worker to error strings that
/// have already lost their type (e.g. recorded on a restored job).
pub fn message_is_fatal(message: &str) -> bool {
    FATAL_ERROR_MARKERS.iter().any(|m| message.contains(m))
}

pub type Result<T> = std::result::Result<T, TranscodeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corrupted_source_is_fatal() {
        assert!(TranscodeError::CorruptedSource("bad EBML header".into()).is_fatal());
        assert!(TranscodeError::Cancelled.is_fatal());
    }

    #[test]
    fn crash_fatality_follows_message_markers() {
        assert!(TranscodeError::TranscoderCrash("child got SIGKILL".into()).is_fatal());
        assert!(TranscodeError::TranscoderCrash("Invalid data found".into()).is_fatal());
        assert!(!TranscodeError::TranscoderCrash("exit status 1".into()).is_fatal());
    }

    #[test]
    fn validation_failure_is_retryable() {
        assert!(!TranscodeError::Validation("missing segment".into()).is_fatal());
    }
}

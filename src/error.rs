use crate::model::RecordKind;
use crate::store::StoreError;
use thiserror::Error;

/// Errors that can be produced while decoding and importing workspace data.
#[derive(Debug, Error)]
pub enum ImportError {
    #[error("failed to read import data: {0}")]
    Read(#[from] std::io::Error),
    #[error("import line exceeds the maximum allowed size of {max} bytes")]
    LineTooLong { max: usize },
    #[error("malformed import line: {0}")]
    Decode(String),
    #[error("import data must begin with a version record")]
    MissingVersion,
    #[error("unsupported import version {0}")]
    UnsupportedVersion(u64),
    #[error("unexpected version record after the first line")]
    UnexpectedVersion,
    #[error("{kind} line is missing its {kind} payload")]
    MissingPayload { kind: RecordKind },
    #[error("invalid {kind} record: {reason}")]
    Validation { kind: RecordKind, reason: String },
    #[error("direct channel must have between 2 and 8 members, got {0}")]
    DirectChannelMemberCount(usize),
    #[error("profile image {path} is {size} bytes, above the {max} byte limit")]
    ProfileImageTooLarge { path: String, size: u64, max: u64 },
    #[error("user \"{0}\" not found")]
    UserNotFound(String),
    #[error("team \"{0}\" not found")]
    TeamNotFound(String),
    #[error("channel \"{0}\" not found")]
    ChannelNotFound(String),
    #[error("scheme \"{0}\" not found")]
    SchemeNotFound(String),
    #[error("attachment {path} could not be read: {reason}")]
    Attachment { path: String, reason: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ImportError {
    /// Stop-on-error classifier. A recoverable error is logged as a warning
    /// and the offending line is skipped; every other error aborts the run.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ImportError::ProfileImageTooLarge { .. } | ImportError::DirectChannelMemberCount(_)
        )
    }

    pub(crate) fn validation(kind: RecordKind, reason: impl Into<String>) -> Self {
        ImportError::Validation {
            kind,
            reason: reason.into(),
        }
    }
}

/// An import failure bound to the 1-based input line that caused it.
///
/// Line 0 means the error could not be attributed to a single line, which
/// happens for batch-wide reference failures and some bulk-save errors.
#[derive(Debug, Error)]
#[error("line {line}: {source}")]
pub struct LineError {
    pub line: u64,
    #[source]
    pub source: ImportError,
}

impl LineError {
    pub fn new(line: u64, source: ImportError) -> Self {
        Self { line, source }
    }

    /// An error with no attributable line number.
    pub fn unattributed(source: ImportError) -> Self {
        Self { line: 0, source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverable_errors_are_exactly_the_two_documented_cases() {
        assert!(ImportError::DirectChannelMemberCount(1).is_recoverable());
        assert!(
            ImportError::ProfileImageTooLarge {
                path: "x.png".into(),
                size: 10,
                max: 5,
            }
            .is_recoverable()
        );
        assert!(!ImportError::MissingVersion.is_recoverable());
        assert!(!ImportError::UserNotFound("ghost".into()).is_recoverable());
        assert!(!ImportError::LineTooLong { max: 16 }.is_recoverable());
    }

    #[test]
    fn line_error_display_includes_line_number() {
        let err = LineError::new(42, ImportError::MissingVersion);
        assert_eq!(
            err.to_string(),
            "line 42: import data must begin with a version record"
        );
    }
}

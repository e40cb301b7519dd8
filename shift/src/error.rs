use std::error;
use std::fmt;

/// Convenient result type for engine operations using [`ShiftError`] as the error type.
pub type ShiftResult<T> = Result<T, ShiftError>;

/// Main error type of the migration engine.
///
/// A [`ShiftError`] is either a single error, carrying an [`ErrorKind`], a static description and
/// optionally a dynamic detail, or an aggregate of many errors.
#[derive(Debug, Clone)]
pub struct ShiftError {
    repr: ErrorRepr,
}

#[derive(Debug, Clone)]
enum ErrorRepr {
    WithDescription(ErrorKind, &'static str),
    WithDescriptionAndDetail(ErrorKind, &'static str, String),
    Many(Vec<ShiftError>),
}

/// Categories of errors raised while accepting and executing migrations.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
#[non_exhaustive]
pub enum ErrorKind {
    // Intake errors, never entering the state machine.
    ValidationError,
    TableNotFound,
    TableAlreadyExists,
    ShardNotFound,

    // Copy & sync errors.
    SchemaTranslationError,
    FeedTransientError,
    FeedUnavailable,
    ConvergenceTimeout,

    // Cutover errors.
    LockTimeout,
    CutoverFailed,

    // State & workflow errors.
    InvalidState,
    InvalidTransition,
    MigrationNotFound,
    MigrationNotCancellable,
    WorkerPanic,

    // Store, IO & serialization errors.
    StateStoreError,
    SerializationError,
    DeserializationError,
    IoError,
    ConfigError,

    Unknown,

    // Raised by fault injection in tests.
    #[cfg(feature = "failpoints")]
    FailpointTriggered,
}

impl ShiftError {
    /// Creates a [`ShiftError`] aggregating multiple errors.
    pub fn many(errors: Vec<ShiftError>) -> ShiftError {
        ShiftError {
            repr: ErrorRepr::Many(errors),
        }
    }

    /// Returns the [`ErrorKind`] of this error.
    ///
    /// For aggregated errors, returns the kind of the first error or [`ErrorKind::Unknown`]
    /// if there is none.
    pub fn kind(&self) -> ErrorKind {
        match self.repr {
            ErrorRepr::WithDescription(kind, _)
            | ErrorRepr::WithDescriptionAndDetail(kind, _, _) => kind,
            ErrorRepr::Many(ref errors) => errors
                .first()
                .map(|err| err.kind())
                .unwrap_or(ErrorKind::Unknown),
        }
    }

    /// Returns every [`ErrorKind`] contained in this error, flattening aggregates.
    pub fn kinds(&self) -> Vec<ErrorKind> {
        match self.repr {
            ErrorRepr::WithDescription(kind, _)
            | ErrorRepr::WithDescriptionAndDetail(kind, _, _) => vec![kind],
            ErrorRepr::Many(ref errors) => errors.iter().flat_map(|err| err.kinds()).collect(),
        }
    }

    /// Returns the dynamic detail of the error, or of the first aggregated error having one.
    pub fn detail(&self) -> Option<&str> {
        match self.repr {
            ErrorRepr::WithDescriptionAndDetail(_, _, ref detail) => Some(detail.as_str()),
            ErrorRepr::Many(ref errors) => errors.iter().find_map(|e| e.detail()),
            _ => None,
        }
    }

    /// Returns `true` when retrying the failed operation may succeed.
    ///
    /// Only change feed read failures are retried in place. A lock timeout is also recoverable
    /// but is handled by returning the migration to syncing instead.
    pub fn is_transient(&self) -> bool {
        matches!(self.kind(), ErrorKind::FeedTransientError)
    }
}

impl PartialEq for ShiftError {
    fn eq(&self, other: &ShiftError) -> bool {
        match (&self.repr, &other.repr) {
            (ErrorRepr::WithDescription(kind_a, _), ErrorRepr::WithDescription(kind_b, _)) => {
                kind_a == kind_b
            }
            (
                ErrorRepr::WithDescriptionAndDetail(kind_a, _, _),
                ErrorRepr::WithDescriptionAndDetail(kind_b, _, _),
            ) => kind_a == kind_b,
            (ErrorRepr::Many(errors_a), ErrorRepr::Many(errors_b)) => {
                errors_a.len() == errors_b.len()
                    && errors_a.iter().zip(errors_b.iter()).all(|(a, b)| a == b)
            }
            _ => false,
        }
    }
}

impl fmt::Display for ShiftError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        match self.repr {
            ErrorRepr::WithDescription(kind, desc) => {
                fmt::Debug::fmt(&kind, f)?;
                f.write_str(": ")?;
                desc.fmt(f)
            }
            ErrorRepr::WithDescriptionAndDetail(kind, desc, ref detail) => {
                fmt::Debug::fmt(&kind, f)?;
                f.write_str(": ")?;
                desc.fmt(f)?;
                f.write_str(" -> ")?;
                detail.fmt(f)
            }
            ErrorRepr::Many(ref errors) => {
                if errors.is_empty() {
                    write!(f, "Multiple errors occurred (empty)")?;
                } else if errors.len() == 1 {
                    errors[0].fmt(f)?;
                } else {
                    write!(f, "Multiple errors occurred ({} total):", errors.len())?;
                    for (i, error) in errors.iter().enumerate() {
                        write!(f, "\n  {}: {}", i + 1, error)?;
                    }
                }

                Ok(())
            }
        }
    }
}

impl error::Error for ShiftError {}

impl From<(ErrorKind, &'static str)> for ShiftError {
    fn from((kind, desc): (ErrorKind, &'static str)) -> ShiftError {
        ShiftError {
            repr: ErrorRepr::WithDescription(kind, desc),
        }
    }
}

impl From<(ErrorKind, &'static str, String)> for ShiftError {
    fn from((kind, desc, detail): (ErrorKind, &'static str, String)) -> ShiftError {
        ShiftError {
            repr: ErrorRepr::WithDescriptionAndDetail(kind, desc, detail),
        }
    }
}

impl<E> From<Vec<E>> for ShiftError
where
    E: Into<ShiftError>,
{
    fn from(errors: Vec<E>) -> ShiftError {
        ShiftError {
            repr: ErrorRepr::Many(errors.into_iter().map(Into::into).collect()),
        }
    }
}

impl From<std::io::Error> for ShiftError {
    fn from(err: std::io::Error) -> ShiftError {
        ShiftError {
            repr: ErrorRepr::WithDescriptionAndDetail(
                ErrorKind::IoError,
                "I/O error occurred",
                err.to_string(),
            ),
        }
    }
}

/// Maps syntax, data and EOF failures to [`ErrorKind::DeserializationError`].
impl From<serde_json::Error> for ShiftError {
    fn from(err: serde_json::Error) -> ShiftError {
        let (kind, description) = match err.classify() {
            serde_json::error::Category::Io => (ErrorKind::IoError, "JSON I/O operation failed"),
            serde_json::error::Category::Syntax
            | serde_json::error::Category::Data
            | serde_json::error::Category::Eof => (
                ErrorKind::DeserializationError,
                "JSON deserialization failed",
            ),
        };

        ShiftError {
            repr: ErrorRepr::WithDescriptionAndDetail(kind, description, err.to_string()),
        }
    }
}

impl From<sqlx::Error> for ShiftError {
    fn from(err: sqlx::Error) -> ShiftError {
        let kind = match &err {
            sqlx::Error::Io(_) => ErrorKind::IoError,
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                ErrorKind::DeserializationError
            }
            sqlx::Error::Encode(_) => ErrorKind::SerializationError,
            _ => ErrorKind::StateStoreError,
        };

        ShiftError {
            repr: ErrorRepr::WithDescriptionAndDetail(
                kind,
                "Migration store operation failed",
                err.to_string(),
            ),
        }
    }
}

impl From<tokio::task::JoinError> for ShiftError {
    fn from(err: tokio::task::JoinError) -> ShiftError {
        let description = if err.is_panic() {
            "Migration worker panicked"
        } else {
            "Migration worker was aborted"
        };

        ShiftError {
            repr: ErrorRepr::WithDescriptionAndDetail(
                ErrorKind::WorkerPanic,
                description,
                err.to_string(),
            ),
        }
    }
}

impl From<shift_config::shared::ValidationError> for ShiftError {
    fn from(err: shift_config::shared::ValidationError) -> ShiftError {
        ShiftError {
            repr: ErrorRepr::WithDescriptionAndDetail(
                ErrorKind::ConfigError,
                "Invalid engine configuration",
                err.to_string(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{bail, shift_error};

    #[test]
    fn test_simple_error_creation() {
        let err = ShiftError::from((ErrorKind::TableNotFound, "Target table does not exist"));
        assert_eq!(err.kind(), ErrorKind::TableNotFound);
        assert_eq!(err.detail(), None);
        assert_eq!(err.kinds(), vec![ErrorKind::TableNotFound]);
    }

    #[test]
    fn test_error_with_detail() {
        let err = ShiftError::from((
            ErrorKind::SchemaTranslationError,
            "Row cannot be translated",
            "value 300 does not fit in tinyint".to_string(),
        ));
        assert_eq!(err.kind(), ErrorKind::SchemaTranslationError);
        assert_eq!(err.detail(), Some("value 300 does not fit in tinyint"));
    }

    #[test]
    fn test_multiple_errors() {
        let multi_err = ShiftError::many(vec![
            ShiftError::from((ErrorKind::ValidationError, "Invalid statement")),
            ShiftError::from((
                ErrorKind::LockTimeout,
                "Fence not acquired",
                "waited 2s".to_string(),
            )),
        ]);

        assert_eq!(multi_err.kind(), ErrorKind::ValidationError);
        assert_eq!(
            multi_err.kinds(),
            vec![ErrorKind::ValidationError, ErrorKind::LockTimeout]
        );
        assert_eq!(multi_err.detail(), Some("waited 2s"));
    }

    #[test]
    fn test_empty_multiple_errors() {
        let multi_err = ShiftError::many(vec![]);
        assert_eq!(multi_err.kind(), ErrorKind::Unknown);
        assert!(multi_err.kinds().is_empty());
    }

    #[test]
    fn test_error_display_with_detail() {
        let err = ShiftError::from((
            ErrorKind::FeedUnavailable,
            "Change feed unavailable",
            "gave up after 5 attempts".to_string(),
        ));

        assert_eq!(
            err.to_string(),
            "FeedUnavailable: Change feed unavailable -> gave up after 5 attempts"
        );
    }

    #[test]
    fn test_only_feed_errors_are_transient() {
        assert!(shift_error!(ErrorKind::FeedTransientError, "Feed read failed").is_transient());
        assert!(!shift_error!(ErrorKind::LockTimeout, "Fence not acquired").is_transient());
    }

    #[test]
    fn test_bail_macro() {
        fn validate(chunk_size: usize) -> ShiftResult<usize> {
            if chunk_size == 0 {
                bail!(
                    ErrorKind::ValidationError,
                    "Invalid chunk size",
                    format!("chunk size {chunk_size} is not allowed")
                );
            }

            Ok(chunk_size)
        }

        assert_eq!(validate(10), Ok(10));
        let err = validate(0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationError);
        assert_eq!(err.detail(), Some("chunk size 0 is not allowed"));
    }

    #[test]
    fn test_json_error_classification() {
        let err: ShiftError = serde_json::from_str::<u32>("not json").unwrap_err().into();
        assert_eq!(err.kind(), ErrorKind::DeserializationError);
    }
}

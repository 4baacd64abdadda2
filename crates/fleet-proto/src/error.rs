use thiserror::Error;

/// A single structured violation of the capability schema, as returned by
/// [`crate::capability::validate`]. Multiple violations may be reported for a
/// single definition; callers should surface the whole list, not just the first.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaViolation {
	#[error("missing required field {0:?}")]
	MissingField(&'static str),
	#[error("field {field:?} has the wrong type: {reason}")]
	WrongType { field: &'static str, reason: String },
	#[error("invalid version {0:?}: expected MAJOR.MINOR.PATCH")]
	InvalidVersion(String),
	#[error("duplicate error code {0:?}")]
	DuplicateErrorCode(String),
	#[error("tags exceed the size cap of {limit} (got {actual})")]
	TooManyTags { limit: usize, actual: usize },
	#[error("schema for {field:?} is not valid JSON Schema: {reason}")]
	InvalidJsonSchema { field: &'static str, reason: String },
}

/// Errors raised by the strict wire parser in [`crate::capability::parse`].
#[derive(Debug, Error)]
pub enum ParseError {
	#[error("payload is not valid UTF-8")]
	NotUtf8,
	#[error("payload exceeds the maximum size of {limit} bytes (got {actual})")]
	TooLarge { limit: usize, actual: usize },
	#[error("payload nesting exceeds the maximum depth of {limit} (got at least {actual})")]
	TooDeep { limit: usize, actual: usize },
	#[error("unknown top-level key {0:?}")]
	UnknownKey(String),
	#[error("malformed JSON: {0}")]
	Malformed(#[from] serde_json::Error),
}

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CodecError {
    #[error("buffer too short for field {field}: needed {needed} bits, {available} available")]
    Truncated { field: String, needed: usize, available: usize },

    #[error("cannot convert value for field {field}: {reason}")]
    BadConversion { field: String, reason: String },

    #[error("value {value} is not a member of enum {enum_name} (field {field})")]
    UnknownEnumValue { field: String, enum_name: String, value: String },

    #[error("field {field} has no value and no default")]
    Unspecified { field: String },

    #[error("wrong packet identity: field {field} expected {expected}, got {got}")]
    WrongIdentity { field: String, expected: String, got: String },

    #[error("field {field} repeats {expected} times, got {got} values")]
    WrongCount { field: String, expected: usize, got: usize },

    #[error("no field or group named {0}")]
    UnknownField(String),

    #[error("invalid schema {schema}: {reason}")]
    Schema { schema: String, reason: String },
}

impl CodecError {
    pub fn bad_conversion(field: &str, reason: impl Into<String>) -> CodecError {
        CodecError::BadConversion {
            field: field.to_string(),
            reason: reason.into(),
        }
    }

    pub fn schema(schema: &str, reason: impl Into<String>) -> CodecError {
        CodecError::Schema {
            schema: schema.to_string(),
            reason: reason.into(),
        }
    }
}

pub type CodecResult<T> = Result<T, CodecError>;

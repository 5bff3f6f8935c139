use std::io::{self, Write};

use serde::Serialize;

use crate::error::{BookError, ErrorKind};

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
    pub hint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
}

impl From<&BookError> for ErrorEnvelope {
    fn from(err: &BookError) -> Self {
        Self {
            error: ErrorBody {
                kind: err.kind(),
                message: err.to_string(),
                hint: err.hint(),
                detail: err.detail(),
            },
        }
    }
}

pub struct JsonOutput;

impl JsonOutput {
    /// Prints a result object to stdout.
    pub fn print<T: Serialize>(value: &T) -> io::Result<()> {
        Self::write_json(&mut io::stdout(), value)
    }

    /// Prints the error object to stderr.
    pub fn print_error(err: &BookError) -> io::Result<()> {
        Self::write_json(&mut io::stderr(), &ErrorEnvelope::from(err))
    }

    pub fn write_json<W: Write, T: Serialize>(out: &mut W, value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        out.write_all(json.as_bytes())?;
        out.write_all(b"\n")?;
        out.flush()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;
    use crate::domain::Source;

    #[test]
    fn error_envelope_carries_kind_and_hint() {
        let err = BookError::Unavailable {
            backend: Source::Annas,
            message: "annas-mcp search failed".to_string(),
            detail: Some("Failed to connect".to_string()),
        };
        let mut buffer = Vec::new();
        JsonOutput::write_json(&mut buffer, &ErrorEnvelope::from(&err)).unwrap();
        let value: Value = serde_json::from_slice(&buffer).unwrap();
        assert_eq!(value["error"]["kind"], "Unavailable");
        assert_eq!(value["error"]["detail"], "Failed to connect");
        assert!(value["error"]["hint"].as_str().is_some_and(|hint| !hint.is_empty()));
    }

    #[test]
    fn detail_is_omitted_when_absent() {
        let err = BookError::Invalid("bad".to_string());
        let mut buffer = Vec::new();
        JsonOutput::write_json(&mut buffer, &ErrorEnvelope::from(&err)).unwrap();
        let value: Value = serde_json::from_slice(&buffer).unwrap();
        assert!(value["error"].get("detail").is_none());
    }
}

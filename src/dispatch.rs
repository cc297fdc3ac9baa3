//! Outgoing query requests.
//!
//! The binding layer hands over loosely typed values; everything is checked
//! and copied into an owned [`QueryRequest`] before a single byte is queued.
//! The request is dropped when the send call returns, on every path.

use serde_json::Value;
use tracing::{debug, trace};

use crate::error::{ClientError, Result};
use crate::event_loop::{IoWatcher, Reactor};
use crate::pg::session::{FlushStatus, Session};
use crate::pg::PgError;

/// Most parameters one Bind message can carry.
pub const MAX_PARAMETERS: usize = u16::MAX as usize;

/// A query on its way to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryRequest {
    text: String,
    parameters: Option<Vec<String>>,
}

impl QueryRequest {
    /// A plain query.
    pub fn simple(text: &str) -> Result<Self> {
        Ok(Self {
            text: validate_text(text)?,
            parameters: None,
        })
    }

    /// A query with positional parameters; every value must be a string.
    pub fn with_params(text: &str, values: &[Value]) -> Result<Self> {
        let text = validate_text(text)?;
        if values.len() > MAX_PARAMETERS {
            return Err(ClientError::ValidationError(format!(
                "too many parameters: {} (at most {})",
                values.len(),
                MAX_PARAMETERS
            )));
        }
        let parameters = values
            .iter()
            .enumerate()
            .map(|(i, value)| match value {
                Value::String(s) => Ok(s.clone()),
                other => Err(ClientError::ValidationError(format!(
                    "parameter ${} must be a string, got {}",
                    i + 1,
                    value_kind(other)
                ))),
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            text,
            parameters: Some(parameters),
        })
    }

    /// A query with positional string parameters.
    pub fn with_text_params<S: AsRef<str>>(text: &str, values: &[S]) -> Result<Self> {
        let text = validate_text(text)?;
        if values.len() > MAX_PARAMETERS {
            return Err(ClientError::ValidationError(format!(
                "too many parameters: {} (at most {})",
                values.len(),
                MAX_PARAMETERS
            )));
        }
        Ok(Self {
            text,
            parameters: Some(values.iter().map(|v| v.as_ref().to_string()).collect()),
        })
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn parameters(&self) -> Option<&[String]> {
        self.parameters.as_deref()
    }

    /// Queue this request on `session` and push it toward the socket.
    ///
    /// A hard flush failure counts as a transmission failure. Output the
    /// socket cannot take yet is left to the write watcher.
    pub(crate) fn transmit<S: Session, R: Reactor>(
        &self,
        session: &mut S,
        watcher: &mut IoWatcher<R>,
    ) -> Result<()> {
        let queued = match self.parameters {
            Some(ref params) => session.send_query_params(&self.text, params),
            None => session.send_query(&self.text),
        };
        queued.map_err(ClientError::TransmissionError)?;
        trace!(params = self.parameters.as_ref().map(Vec::len), "query queued");

        match session.flush() {
            FlushStatus::Done => Ok(()),
            FlushStatus::Pending => {
                debug!("output pending, watching for writability");
                watcher.start_write();
                Ok(())
            }
            FlushStatus::Failed => Err(ClientError::TransmissionError(PgError::Io(
                std::io::Error::other(session.error_message()),
            ))),
        }
    }
}

fn validate_text(text: &str) -> Result<String> {
    if text.is_empty() {
        return Err(ClientError::ValidationError(
            "query text must not be empty".to_string(),
        ));
    }
    Ok(text.to_string())
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_non_string_parameter_is_rejected() {
        let err = QueryRequest::with_params("SELECT $1", &[json!(42)]).unwrap_err();
        match err {
            ClientError::ValidationError(msg) => {
                assert_eq!(msg, "parameter $1 must be a string, got number")
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_rejection_mid_array() {
        let err =
            QueryRequest::with_params("SELECT $1, $2, $3", &[json!("a"), json!("b"), json!(null)])
                .unwrap_err();
        assert!(err.to_string().contains("$3"));
    }

    #[test]
    fn test_parameters_are_copied() {
        let values = vec![json!("x"), json!("")];
        let request = QueryRequest::with_params("SELECT $1, $2", &values).unwrap();
        drop(values);
        assert_eq!(request.parameters(), Some(&["x".to_string(), String::new()][..]));
    }

    #[test]
    fn test_zero_parameters_still_use_extended_protocol() {
        let request = QueryRequest::with_params("SELECT 1", &[]).unwrap();
        assert_eq!(request.parameters(), Some(&[][..]));
        assert_eq!(QueryRequest::simple("SELECT 1").unwrap().parameters(), None);
    }

    #[test]
    fn test_empty_text_is_rejected() {
        assert!(matches!(
            QueryRequest::simple(""),
            Err(ClientError::ValidationError(_))
        ));
    }
}

//! The JSON payload carried on both legs of the bus.

use crate::{Error, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// The domain payload of a bus message.
///
/// The same shape travels both legs: the request leg carries
/// `{id, owner, expression}` with `result` absent; the result leg carries
/// the same fields with `result` set. `id` is the store-assigned record id
/// and is the sole correlation key between the two legs.
///
/// Results are normalized to `f64` on the wire regardless of whether the
/// evaluator produced an integer or a float.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalculationJob {
    pub id: u64,
    pub owner: String,
    pub expression: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<f64>,
}

impl CalculationJob {
    /// A request-leg job: no result yet.
    pub fn request(id: u64, owner: impl Into<String>, expression: impl Into<String>) -> Self {
        Self {
            id,
            owner: owner.into(),
            expression: expression.into(),
            result: None,
        }
    }

    /// Turns a request-leg job into its result-leg counterpart.
    pub fn with_result(mut self, result: f64) -> Self {
        self.result = Some(result);
        self
    }

    /// Serializes the job for the wire.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedPayload`] if serialization fails.
    pub fn encode(&self) -> Result<Bytes> {
        let bytes = serde_json::to_vec(self).map_err(|err| Error::MalformedPayload {
            context: format!("encode: {err}"),
        })?;
        Ok(Bytes::from(bytes))
    }

    /// Deserializes a job from payload bytes.
    ///
    /// Unknown fields are tolerated; missing required fields are not.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedPayload`] if the bytes are not a valid job.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload).map_err(|err| Error::MalformedPayload {
            context: err.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_leg_omits_result() {
        let job = CalculationJob::request(7, "alice", "2+2");
        let bytes = job.encode().unwrap();
        let text = core::str::from_utf8(&bytes).unwrap();

        assert!(!text.contains("result"));
        assert_eq!(CalculationJob::decode(&bytes).unwrap(), job);
    }

    #[test]
    fn result_leg_round_trips() {
        let job = CalculationJob::request(7, "alice", "2+2").with_result(4.0);
        let decoded = CalculationJob::decode(&job.encode().unwrap()).unwrap();

        assert_eq!(decoded.result, Some(4.0));
        assert_eq!(decoded, job);
    }

    #[test]
    fn unknown_fields_are_tolerated() {
        let decoded = CalculationJob::decode(
            br#"{"id":1,"owner":"bob","expression":"1-1","extra":"ignored"}"#,
        )
        .unwrap();
        assert_eq!(decoded.id, 1);
        assert_eq!(decoded.result, None);
    }

    #[test]
    fn garbage_is_a_malformed_payload() {
        let err = CalculationJob::decode(b"not json").unwrap_err();
        assert!(matches!(err, Error::MalformedPayload { .. }));
    }
}

//! Messages crossing the isolated executor boundary.
//!
//! The boundary is treated like a process boundary: both directions carry
//! JSON text frames and nothing else. Frame shapes:
//!
//! ```text
//! request:  {"type":"runQuantum","data":{"numTrials":50000,"sequence":3}}
//! response: {"type":"chshResult","data":{"sequence":3,"result":{...}}}
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::engine::{BatchProgress, TrialBatchResult, TrialMode};
use crate::error::ExecutorError;

/// Payload of a batch request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRequest {
    pub num_trials: u64,
    /// Correlates the eventual result with this request.
    pub sequence: u64,
}

/// Owner → worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum WorkerRequest {
    RunQuantum(BatchRequest),
    RunClassical(BatchRequest),
    Shutdown,
}

impl WorkerRequest {
    pub fn batch(mode: TrialMode, num_trials: u64, sequence: u64) -> Self {
        let request = BatchRequest {
            num_trials,
            sequence,
        };
        match mode {
            TrialMode::Quantum => Self::RunQuantum(request),
            TrialMode::Classical => Self::RunClassical(request),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressReport {
    pub sequence: u64,
    #[serde(flatten)]
    pub progress: BatchProgress,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReply {
    pub sequence: u64,
    pub result: TrialBatchResult,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerFault {
    pub sequence: Option<u64>,
    pub message: String,
}

/// Worker → owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum WorkerResponse {
    Ready,
    /// Advisory; the owner may ignore it.
    Progress(ProgressReport),
    ChshResult(BatchReply),
    ClassicalResult(BatchReply),
    Error(WorkerFault),
}

pub fn encode<T: Serialize>(message: &T) -> Result<String, ExecutorError> {
    serde_json::to_string(message).map_err(ExecutorError::Protocol)
}

pub fn decode<T: DeserializeOwned>(frame: &str) -> Result<T, ExecutorError> {
    serde_json::from_str(frame).map_err(ExecutorError::Protocol)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_shape() {
        let frame = encode(&WorkerRequest::batch(TrialMode::Quantum, 50_000, 3)).unwrap();
        assert_eq!(
            frame,
            r#"{"type":"runQuantum","data":{"numTrials":50000,"sequence":3}}"#
        );
        let frame = encode(&WorkerRequest::Shutdown).unwrap();
        assert_eq!(frame, r#"{"type":"shutdown"}"#);
    }

    #[test]
    fn test_response_tags() {
        let frame = encode(&WorkerResponse::Ready).unwrap();
        assert_eq!(frame, r#"{"type":"ready"}"#);

        let progress = WorkerResponse::Progress(ProgressReport {
            sequence: 9,
            progress: BatchProgress {
                completed: 10_000,
                total: 50_000,
                partial_statistic: 2.81,
            },
        });
        let value: serde_json::Value = serde_json::from_str(&encode(&progress).unwrap()).unwrap();
        assert_eq!(value["type"], "progress");
        assert_eq!(value["data"]["completed"], 10_000);
        assert_eq!(value["data"]["partialStatistic"], 2.81);
        assert_eq!(decode::<WorkerResponse>(&encode(&progress).unwrap()).unwrap(), progress);
    }

    #[test]
    fn test_malformed_frame_is_protocol_error() {
        let err = decode::<WorkerRequest>(r#"{"type":"runBell","data":{}}"#).unwrap_err();
        assert!(matches!(err, ExecutorError::Protocol(_)));
    }
}

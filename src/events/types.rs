//! Event kinds and their wire envelope.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::query::{DeliberationMode, ModelId};

/// All deliberation lifecycle events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CouncilEvent {
    /// The orchestrator accepted a query.
    DeliberationStart {
        request_id: String,
        mode: DeliberationMode,
        council: Vec<ModelId>,
        timestamp: DateTime<Utc>,
    },

    /// Stage 1 returned.
    Stage1Complete {
        request_id: String,
        ok: usize,
        failed: usize,
        timestamp: DateTime<Utc>,
    },

    /// A reviewer returned a valid ranking.
    VoteCast {
        request_id: String,
        reviewer: ModelId,
        timestamp: DateTime<Utc>,
    },

    /// Stage 2 returned.
    Stage2Complete {
        request_id: String,
        valid_rankings: usize,
        timestamp: DateTime<Utc>,
    },

    /// Stage 3 returned.
    Stage3Complete {
        request_id: String,
        chairman: ModelId,
        timestamp: DateTime<Utc>,
    },

    /// The result was written; the deliberation is done.
    Complete {
        request_id: String,
        transcript_dir: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// A fatal error (or a non-fatal transcript write failure, by subkind).
    Error {
        request_id: String,
        kind: String,
        detail: String,
        timestamp: DateTime<Utc>,
    },
}

impl CouncilEvent {
    /// The dotted event kind used on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DeliberationStart { .. } => "council.deliberation_start",
            Self::Stage1Complete { .. } => "council.stage1.complete",
            Self::VoteCast { .. } => "model.vote_cast",
            Self::Stage2Complete { .. } => "council.stage2.complete",
            Self::Stage3Complete { .. } => "council.stage3.complete",
            Self::Complete { .. } => "council.complete",
            Self::Error { .. } => "council.error",
        }
    }

    pub fn request_id(&self) -> &str {
        match self {
            Self::DeliberationStart { request_id, .. }
            | Self::Stage1Complete { request_id, .. }
            | Self::VoteCast { request_id, .. }
            | Self::Stage2Complete { request_id, .. }
            | Self::Stage3Complete { request_id, .. }
            | Self::Complete { request_id, .. }
            | Self::Error { request_id, .. } => request_id,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::DeliberationStart { timestamp, .. }
            | Self::Stage1Complete { timestamp, .. }
            | Self::VoteCast { timestamp, .. }
            | Self::Stage2Complete { timestamp, .. }
            | Self::Stage3Complete { timestamp, .. }
            | Self::Complete { timestamp, .. }
            | Self::Error { timestamp, .. } => *timestamp,
        }
    }

    /// The wire envelope consumed by SSE and webhook forwarders:
    /// `{event, request_id, timestamp, data}`.
    pub fn envelope(&self) -> serde_json::Value {
        let mut data = match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        };
        data.remove("type");
        data.remove("request_id");
        let timestamp = data
            .remove("timestamp")
            .unwrap_or_else(|| serde_json::Value::String(self.timestamp().to_rfc3339()));

        serde_json::json!({
            "event": self.kind(),
            "request_id": self.request_id(),
            "timestamp": timestamp,
            "data": data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_strings() {
        let event = CouncilEvent::VoteCast {
            request_id: "r1".to_string(),
            reviewer: "m2".to_string(),
            timestamp: Utc::now(),
        };
        assert_eq!(event.kind(), "model.vote_cast");
        assert_eq!(event.request_id(), "r1");
    }

    #[test]
    fn test_envelope_shape() {
        let event = CouncilEvent::Stage1Complete {
            request_id: "r1".to_string(),
            ok: 3,
            failed: 1,
            timestamp: Utc::now(),
        };
        let envelope = event.envelope();

        assert_eq!(envelope["event"], "council.stage1.complete");
        assert_eq!(envelope["request_id"], "r1");
        assert!(envelope["timestamp"].is_string());
        assert_eq!(envelope["data"]["ok"], 3);
        assert_eq!(envelope["data"]["failed"], 1);
        assert!(envelope["data"].get("request_id").is_none());
    }

    #[test]
    fn test_event_serde_roundtrip() {
        let event = CouncilEvent::Error {
            request_id: "r9".to_string(),
            kind: "transcript_write".to_string(),
            detail: "disk full".to_string(),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"error\""));
        let back: CouncilEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind(), "council.error");
    }
}

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Everything observed about one relayed exchange. A snapshot of this record
/// rides on every telemetry event, so consumers can render partial state
/// before the exchange finishes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExchangeRecord {
    /// Url the client asked for, never rewritten.
    pub url: String,
    /// Url actually dialed when a proxy or rewrite rule redirected the
    /// exchange.
    pub real_url: Option<String>,
    pub resolved_rule: Option<String>,
    pub start_time: i64,
    pub request_time: Option<i64>,
    pub dns_time: Option<i64>,
    pub response_time: Option<i64>,
    pub end_time: Option<i64>,
    pub req_error: bool,
    pub res_error: bool,
    pub request: RequestRecord,
    pub response: ResponseRecord,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestRecord {
    pub ip: String,
    pub method: String,
    pub http_version: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResponseRecord {
    pub ip: Option<String>,
    pub status: Option<StatusValue>,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

/// Status slot of a response record. Numeric for anything an upstream said,
/// a literal marker string when the client walked away first.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum StatusValue {
    Code(u16),
    Text(String),
}

pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::{ResponseRecord, StatusValue};

    #[test]
    fn status_serializes_untagged() {
        let numeric = ResponseRecord {
            status: Some(StatusValue::Code(101)),
            ..ResponseRecord::default()
        };
        let aborted = ResponseRecord {
            status: Some(StatusValue::Text("aborted".to_string())),
            ..ResponseRecord::default()
        };

        let numeric_json = serde_json::to_string(&numeric).unwrap();
        let aborted_json = serde_json::to_string(&aborted).unwrap();

        assert!(numeric_json.contains("\"status\":101"));
        assert!(aborted_json.contains("\"status\":\"aborted\""));
    }
}

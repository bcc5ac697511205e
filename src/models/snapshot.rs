use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::BTreeMap;

/// What the client asked for, captured once per forwarded plain-HTTP request.
///
/// Query parameters, headers and cookies keep a single value per name; form
/// fields keep every submitted value in order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundRequestSnapshot {
    pub method: String,
    pub path: String,
    #[serde(rename = "get_params")]
    pub query: BTreeMap<String, String>,
    pub headers: BTreeMap<String, String>,
    pub cookies: BTreeMap<String, String>,
    #[serde(rename = "post_params")]
    pub form: BTreeMap<String, Vec<String>>,
}

/// What the origin answered, captured before the body is streamed back.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundResponseSnapshot {
    pub code: u16,
    /// Full status text, e.g. `"302 Found"`
    pub message: String,
    pub headers: BTreeMap<String, String>,
}

/// One recorded transaction: both snapshots already encoded as text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionRecord {
    pub request: String,
    pub response: String,
    pub captured_at: DateTime<Utc>,
}

impl TransactionRecord {
    pub fn new(request: String, response: String) -> Self {
        Self {
            request,
            response,
            captured_at: Utc::now(),
        }
    }
}

/// A transaction row read back from storage
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct StoredTransaction {
    pub id: i64,
    pub request: String,
    pub response: String,
    pub captured_at: DateTime<Utc>,
}

impl StoredTransaction {
    /// Decode the request column; `None` when it was stored empty or is not a snapshot
    pub fn request_snapshot(&self) -> Option<InboundRequestSnapshot> {
        serde_json::from_str(&self.request).ok()
    }

    /// Decode the response column; `None` when it was stored empty or is not a snapshot
    pub fn response_snapshot(&self) -> Option<OutboundResponseSnapshot> {
        serde_json::from_str(&self.response).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_snapshot_field_names() {
        let mut snapshot = InboundRequestSnapshot {
            method: "POST".to_string(),
            path: "/submit".to_string(),
            ..Default::default()
        };
        snapshot.query.insert("a".to_string(), "1".to_string());
        snapshot
            .form
            .insert("foo".to_string(), vec!["bar".to_string(), "baz".to_string()]);

        let value = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(value["method"], "POST");
        assert_eq!(value["path"], "/submit");
        assert_eq!(value["get_params"]["a"], "1");
        assert_eq!(value["post_params"]["foo"], serde_json::json!(["bar", "baz"]));
        assert!(value["headers"].as_object().unwrap().is_empty());
        assert!(value["cookies"].as_object().unwrap().is_empty());
    }

    #[test]
    fn test_response_snapshot_field_names() {
        let mut snapshot = OutboundResponseSnapshot {
            code: 302,
            message: "302 Found".to_string(),
            ..Default::default()
        };
        snapshot
            .headers
            .insert("Location".to_string(), "/x".to_string());

        let text = serde_json::to_string(&snapshot).unwrap();
        assert_eq!(
            text,
            r#"{"code":302,"message":"302 Found","headers":{"Location":"/x"}}"#
        );
    }

    #[test]
    fn test_stored_transaction_with_empty_column() {
        let stored = StoredTransaction {
            id: 1,
            request: String::new(),
            response: r#"{"code":200,"message":"200 OK","headers":{}}"#.to_string(),
            captured_at: Utc::now(),
        };

        assert!(stored.request_snapshot().is_none());
        assert_eq!(stored.response_snapshot().unwrap().code, 200);
    }
}

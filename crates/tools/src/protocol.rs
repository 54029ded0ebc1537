//! Stdio tool-server wire format.
//!
//! One JSON object per line. Requests carry `{id, method, params}`;
//! responses carry `{id, result}` or `{id, error: {code, message}}`.
//! Methods: `tools/list` and `tools/call`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const METHOD_LIST: &str = "tools/list";
pub const METHOD_CALL: &str = "tools/call";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Request {
    pub fn new(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            id,
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseError {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_line_round_trip() {
        let req = Request::new(7, METHOD_CALL, Some(serde_json::json!({"tool": "fs.read"})));
        let line = serde_json::to_string(&req).unwrap();
        assert!(!line.contains('\n'));
        let back: Request = serde_json::from_str(&line).unwrap();
        assert_eq!(back.id, 7);
        assert_eq!(back.method, METHOD_CALL);
    }

    #[test]
    fn error_response_parses() {
        let line = r#"{"id":3,"error":{"code":-32000,"message":"boom"}}"#;
        let resp: Response = serde_json::from_str(line).unwrap();
        assert!(resp.result.is_none());
        assert_eq!(resp.error.unwrap().message, "boom");
    }
}

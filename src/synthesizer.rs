//! Response overrides carried by generated output.
//!
//! A template may return a reserved top-level `_res` object:
//!
//! ```text
//! { _res: { status: 201, headers: {...}, cookies: {...}, data: {...} }, ... }
//! ```
//!
//! `_res` is always removed from the body. When `status` is present and not
//! 200, a `data` payload replaces the body.

use http::StatusCode;
use serde_json::Value;

/// Reserved control key.
pub const CONTROL_KEY: &str = "_res";

/// Generated output after overrides were applied.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesizedResponse {
    pub status: StatusCode,
    pub headers: Vec<(String, String)>,
    pub cookies: Vec<(String, String)>,
    pub body: Value,
}

/// Split generated output into body and overrides.
pub fn synthesize(mut generated: Value) -> SynthesizedResponse {
    let mut response = SynthesizedResponse {
        status: StatusCode::OK,
        headers: Vec::new(),
        cookies: Vec::new(),
        body: Value::Null,
    };

    let control = generated
        .as_object_mut()
        .and_then(|object| object.remove(CONTROL_KEY));

    let Some(Value::Object(mut control)) = control else {
        response.body = generated;
        return response;
    };

    let status = control.get("status").and_then(parse_status);
    if let Some(status) = status {
        response.status = status;
    }

    response.headers = string_pairs(control.get("headers"));
    response.cookies = string_pairs(control.get("cookies"));

    response.body = match (status, control.remove("data")) {
        (Some(status), Some(data)) if status != StatusCode::OK && !is_falsy(&data) => data,
        _ => generated,
    };

    response
}

/// Accept numeric statuses and numeric strings (`"404"`, `"404 Not Found"`).
fn parse_status(value: &Value) -> Option<StatusCode> {
    let code = match value {
        Value::Number(n) => n.as_f64().map(|f| f.trunc() as i64)?,
        Value::String(s) => {
            let digits: String = s.trim().chars().take_while(|c| c.is_ascii_digit()).collect();
            digits.parse().ok()?
        }
        _ => return None,
    };
    u16::try_from(code)
        .ok()
        .and_then(|c| StatusCode::from_u16(c).ok())
}

fn string_pairs(value: Option<&Value>) -> Vec<(String, String)> {
    let Some(Value::Object(map)) = value else {
        return Vec::new();
    };
    map.iter()
        .map(|(k, v)| {
            let v = match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (k.clone(), v)
        })
        .collect()
}

fn is_falsy(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

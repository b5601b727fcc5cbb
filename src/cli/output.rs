#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

use crate::error::{code, get_error_info, EngineError};
use serde_json::{json, Value};

#[must_use]
pub fn success_envelope(command: &str, payload: Value) -> Value {
    json!({
        "command": command,
        "status": "ok",
        "payload": payload,
    })
}

#[must_use]
pub fn error_envelope(command: &str, error: &EngineError) -> Value {
    let fix = get_error_info(error.code()).map(|(_, fix)| fix);
    json!({
        "command": command,
        "status": "error",
        "error": {
            "code": error.code(),
            "message": error.to_string(),
            "fix": fix,
            "exit_code": error.exit_code(),
        },
    })
}

#[must_use]
pub fn usage_error_envelope(message: &str, suggestions: &[String]) -> Value {
    let fix = suggestions.first().map_or_else(
        || get_error_info(code::CLI_ERROR).map(|(_, fix)| fix.to_string()),
        |suggestion| Some(format!("did you mean `{suggestion}`?")),
    );
    json!({
        "status": "error",
        "error": {
            "code": code::CLI_ERROR,
            "message": message,
            "suggestions": suggestions,
            "fix": fix,
        },
    })
}

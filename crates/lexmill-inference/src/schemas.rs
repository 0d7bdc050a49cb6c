//! Strict structured-output schemas, one per job type.
//!
//! Every object lists all of its properties as required and forbids extra
//! ones; optional values are expressed as a `null` union. The shapes match
//! the result types in `lexmill_core::results`.

use serde_json::{json, Value as JsonValue};

use lexmill_core::JobType;

/// Schema name sent alongside the schema (e.g. `flag_result`).
pub fn schema_name(job_type: JobType) -> String {
    format!("{}_result", job_type.as_str())
}

/// The strict JSON schema for `job_type`.
pub fn schema_for(job_type: JobType) -> JsonValue {
    match job_type {
        JobType::Flag => object(json!({
            "flagged": { "type": "boolean" },
            "flagged_reason": nullable_string(),
            "confidence": confidence(),
            "notes": nullable_string(),
        })),
        JobType::Edit => object(json!({
            "edits": {
                "type": "array",
                "items": object(json!({
                    "field": { "type": "string" },
                    "value": { "type": "string" },
                })),
            },
            "new_frame_code": nullable_string(),
            "relations": {
                "type": "array",
                "items": object(json!({
                    "relation_type": { "type": "string" },
                    "target_code": { "type": "string" },
                })),
            },
            "confidence": confidence(),
            "notes": nullable_string(),
        })),
        JobType::Reallocate => object(json!({
            "moves": {
                "type": "array",
                "items": object(json!({
                    "entry_code": { "type": "string" },
                    "target_frame_code": { "type": "string" },
                    "reason": nullable_string(),
                })),
            },
            "confidence": confidence(),
            "notes": nullable_string(),
        })),
        JobType::Allocate => object(json!({
            "recommended_frame_code": nullable_string(),
            "confidence": confidence(),
            "notes": nullable_string(),
        })),
        JobType::Split => object(json!({
            "new_frames_created": { "type": "integer", "minimum": 0 },
            "reallocations": { "type": "integer", "minimum": 0 },
            "original_deleted": { "type": "boolean" },
            "summary": nullable_string(),
            "confidence": { "type": ["number", "null"], "minimum": 0, "maximum": 1 },
        })),
        JobType::Review => object(json!({
            "action": { "type": "string", "enum": ["approve", "reject", "revise"] },
            "justification": { "type": "string" },
            "confidence": confidence(),
            "notes": nullable_string(),
        })),
    }
}

fn object(properties: JsonValue) -> JsonValue {
    let required: Vec<JsonValue> = properties
        .as_object()
        .map(|p| p.keys().cloned().map(JsonValue::from).collect())
        .unwrap_or_default();
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
        "additionalProperties": false,
    })
}

fn nullable_string() -> JsonValue {
    json!({ "type": ["string", "null"] })
}

fn confidence() -> JsonValue {
    json!({ "type": "number", "minimum": 0, "maximum": 1 })
}

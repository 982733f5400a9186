//! The `ch` message format: single-product tasks with catalog identifiers
//! echoed back on output.

use chrono::Utc;
use serde_json::{json, Map, Value};

use super::{require_str, JobSpec, JobTarget, MessageError, MessageResolver};

pub const FORMAT: &str = "ch";

/// Timestamp format used on `ch` output messages.
const OUTPUT_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub struct ChResolver;

impl MessageResolver for ChResolver {
    fn format(&self) -> &'static str {
        FORMAT
    }

    fn resolve_input(&self, message: &Value) -> Result<JobSpec, MessageError> {
        let url = require_str(message, "url")?.to_string();
        let site = require_str(message, "site")?.to_string();
        let result_queue = require_str(message, "result_queue")?.to_string();

        let options = match message.get("cmd_args") {
            Some(Value::Object(map)) => map.clone(),
            Some(Value::Null) | None => Map::new(),
            Some(_) => return Err(MessageError::InvalidField("cmd_args")),
        };

        Ok(JobSpec {
            format: FORMAT.to_string(),
            site,
            target: JobTarget::Url(url),
            result_queue: Some(result_queue),
            as_of: None,
            quantity: None,
            pages: None,
            summary: false,
            options,
            raw: message.clone(),
        })
    }

    fn success(&self, spec: &JobSpec, bucket: &str, key: &str) -> Value {
        let mut message = base_message(spec, "success");
        message["s3_filepath"] = json!(key);
        message["bucket_name"] = json!(bucket);
        message
    }

    fn failure(&self, spec: &JobSpec) -> Value {
        base_message(spec, "failure")
    }
}

fn base_message(spec: &JobSpec, status: &str) -> Value {
    json!({
        "url": spec.target_url(),
        "event": spec.raw.get("event").cloned().unwrap_or(Value::Null),
        "site_id": spec.raw.get("site_id").cloned().unwrap_or(Value::Null),
        "product_id": spec.raw.get("product_id").cloned().unwrap_or(Value::Null),
        "date": Utc::now().format(OUTPUT_DATE_FORMAT).to_string(),
        "status": status,
    })
}

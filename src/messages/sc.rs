//! The `sc` message format: single-product, search-term, and shelf tasks.

use chrono::Utc;
use serde_json::{json, Map, Value};

use super::{
    optional_count, optional_date, optional_str, require_str, JobSpec, JobTarget, MessageError,
    MessageResolver,
};

pub const FORMAT: &str = "sc";

/// Suffix on the `site` field marking shelf-page tasks.
const SHELF_SITE_SUFFIX: &str = "_shelf_urls";

pub struct ScResolver;

impl MessageResolver for ScResolver {
    fn format(&self) -> &'static str {
        FORMAT
    }

    fn resolve_input(&self, message: &Value) -> Result<JobSpec, MessageError> {
        let raw_site = require_str(message, "site")?.to_string();
        let result_queue = require_str(message, "result_queue")?.to_string();

        let url = optional_str(message, "url");
        let search_term = optional_str(message, "searchterms_str");

        let (site, target) = if let Some(site) = raw_site.strip_suffix(SHELF_SITE_SUFFIX) {
            let url = url.ok_or(MessageError::MissingField("url"))?;
            (site.to_string(), JobTarget::ShelfUrl(url))
        } else if let Some(url) = url {
            (raw_site, JobTarget::Url(url))
        } else if let Some(term) = search_term {
            (raw_site, JobTarget::SearchTerm(term))
        } else {
            return Err(MessageError::MissingField("url"));
        };

        let mut options = match message.get("cmd_args") {
            Some(Value::Object(map)) => map.clone(),
            Some(Value::Null) | None => Map::new(),
            Some(_) => return Err(MessageError::InvalidField("cmd_args")),
        };

        // cmd_args.quantity overrides the top-level field.
        let quantity = match optional_count(&Value::Object(options.clone()), "quantity")? {
            Some(q) => Some(q),
            None => optional_count(message, "quantity")?,
        };
        let pages = match optional_count(message, "pages_count")? {
            Some(p) => Some(p),
            None => optional_count(message, "num_pages")?,
        };

        let as_of = optional_date(message, "crawl_date")?;
        if let Some(date) = as_of {
            options.insert("crawl_date".to_string(), json!(date.to_string()));
        }

        let summary = match message.get("summary") {
            Some(Value::String(s)) => !s.is_empty(),
            Some(Value::Bool(b)) => *b,
            _ => false,
        };

        Ok(JobSpec {
            format: FORMAT.to_string(),
            site,
            target,
            result_queue: Some(result_queue),
            as_of,
            quantity,
            pages,
            summary,
            options,
            raw: message.clone(),
        })
    }

    fn success(&self, spec: &JobSpec, bucket: &str, key: &str) -> Value {
        let mut message = base_message(spec, "success");
        message["bucket_name"] = json!(bucket);
        message["s3_key_data"] = json!(key);
        message
    }

    fn failure(&self, spec: &JobSpec) -> Value {
        base_message(spec, "failure")
    }
}

fn base_message(spec: &JobSpec, status: &str) -> Value {
    json!({
        "msg_id": spec.raw.get("task_id").cloned().unwrap_or(Value::Null),
        "server_ip": spec.raw.get("server_ip").cloned().unwrap_or(Value::Null),
        "utc_datetime": Utc::now().to_rfc3339(),
        "status": status,
        "site": spec.site,
        "url": spec.target_url(),
        "searchterms_str": spec.search_term(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn resolve(body: &str) -> Result<JobSpec, MessageError> {
        ScResolver.resolve_input(&serde_json::from_str(body).unwrap())
    }

    #[test]
    fn test_product_task() {
        let spec = resolve(
            r#"{"url": "https://acme.test/p/1", "site": "acme",
                "result_queue": "results", "response_format": "sc",
                "task_id": "t-17", "crawl_date": "2020-06-01"}"#,
        )
        .unwrap();
        assert_eq!(spec.target, JobTarget::Url("https://acme.test/p/1".to_string()));
        assert_eq!(spec.as_of, NaiveDate::from_ymd_opt(2020, 6, 1));
        assert_eq!(spec.options["crawl_date"], "2020-06-01");
        assert!(!spec.summary);
    }

    #[test]
    fn test_shelf_site_suffix_rewrites_target() {
        let spec = resolve(
            r#"{"url": "https://acme.test/shelf/tools", "site": "acme_shelf_urls",
                "result_queue": "results", "response_format": "sc"}"#,
        )
        .unwrap();
        assert_eq!(spec.site, "acme");
        assert_eq!(
            spec.target,
            JobTarget::ShelfUrl("https://acme.test/shelf/tools".to_string())
        );
    }

    #[test]
    fn test_cmd_args_quantity_overrides() {
        let spec = resolve(
            r#"{"searchterms_str": "widgets", "site": "acme",
                "result_queue": "results", "response_format": "sc",
                "quantity": "50", "cmd_args": {"quantity": 10}}"#,
        )
        .unwrap();
        assert_eq!(spec.quantity, Some(10));
    }

    #[test]
    fn test_missing_target_is_rejected() {
        let err = resolve(
            r#"{"site": "acme", "result_queue": "results", "response_format": "sc"}"#,
        )
        .unwrap_err();
        assert!(matches!(err, MessageError::MissingField("url")));
    }

    #[test]
    fn test_output_messages() {
        let spec = resolve(
            r#"{"url": "https://acme.test/p/1", "site": "acme",
                "result_queue": "results", "response_format": "sc",
                "task_id": "t-17", "server_ip": "10.0.0.5"}"#,
        )
        .unwrap();

        let success = ScResolver.success(&spec, "crawl-output", "output/2020/06/01/abc.jl");
        assert_eq!(success["status"], "success");
        assert_eq!(success["msg_id"], "t-17");
        assert_eq!(success["server_ip"], "10.0.0.5");
        assert_eq!(success["bucket_name"], "crawl-output");
        assert_eq!(success["s3_key_data"], "output/2020/06/01/abc.jl");

        let failure = ScResolver.failure(&spec);
        assert_eq!(failure["status"], "failure");
        assert!(failure.get("s3_key_data").is_none());
    }
}

//! Queue message formats and the typed resolver registry.
//!
//! Input messages declare their family through a `response_format` field;
//! a registry maps that discriminator to a resolver which validates the
//! message into a `JobSpec` and later shapes the matching result message.
//! Messages the registry cannot resolve are poison: deleted, never retried.

pub mod ch;
pub mod sc;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::NaiveDate;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::cache::CRAWL_DATE_FORMAT;

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("Error while parsing message JSON: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("Unknown message format {0:?}")]
    UnknownFormat(Option<String>),
    #[error("Message missing required field `{0}`")]
    MissingField(&'static str),
    #[error("Invalid value for field `{0}`")]
    InvalidField(&'static str),
}

/// What a crawl task targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobTarget {
    /// A single product page.
    Url(String),
    /// A search query walked through result listings.
    SearchTerm(String),
    /// A shelf (category) page walked like search results.
    ShelfUrl(String),
}

/// One resolved unit of work: job type plus parameters.
#[derive(Debug, Clone)]
pub struct JobSpec {
    /// Message family, used to shape the result message.
    pub format: String,
    pub site: String,
    pub target: JobTarget,
    /// Queue the result message should go to, unless overridden by config.
    pub result_queue: Option<String>,
    /// Logical crawl date for reproducible historical crawls.
    pub as_of: Option<NaiveDate>,
    /// Maximum number of items for search/shelf jobs.
    pub quantity: Option<u32>,
    /// Maximum number of listing pages for search/shelf jobs.
    pub pages: Option<u32>,
    /// Summary jobs skip caching.
    pub summary: bool,
    /// Free-form job parameters, passed through to the job.
    pub options: Map<String, Value>,
    /// The original message, kept for echo fields on output.
    pub raw: Value,
}

impl JobSpec {
    pub fn target_url(&self) -> Option<&str> {
        match &self.target {
            JobTarget::Url(url) | JobTarget::ShelfUrl(url) => Some(url),
            JobTarget::SearchTerm(_) => None,
        }
    }

    pub fn search_term(&self) -> Option<&str> {
        match &self.target {
            JobTarget::SearchTerm(term) => Some(term),
            _ => None,
        }
    }
}

/// Validates input messages of one format and shapes its result messages.
pub trait MessageResolver: Send + Sync {
    /// The `response_format` discriminator this resolver owns.
    fn format(&self) -> &'static str;

    fn resolve_input(&self, message: &Value) -> Result<JobSpec, MessageError>;

    /// Result message for a completed task whose output was uploaded.
    fn success(&self, spec: &JobSpec, bucket: &str, key: &str) -> Value;

    /// Result message for a failed task. No output pointer.
    fn failure(&self, spec: &JobSpec) -> Value;
}

/// Registry of message resolvers keyed by format, fixed at startup.
#[derive(Clone, Default)]
pub struct ResolverRegistry {
    resolvers: HashMap<&'static str, Arc<dyn MessageResolver>>,
}

impl ResolverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the standard production formats.
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(sc::ScResolver));
        registry.register(Arc::new(ch::ChResolver));
        registry
    }

    pub fn register(&mut self, resolver: Arc<dyn MessageResolver>) {
        self.resolvers.insert(resolver.format(), resolver);
    }

    pub fn for_format(&self, format: &str) -> Option<Arc<dyn MessageResolver>> {
        self.resolvers.get(format).cloned()
    }

    /// Resolve a raw message body into a job spec.
    ///
    /// Messages without a recognized format but also without a `url` are
    /// assumed to be `sc` search/shelf tasks, which historically arrive
    /// that way. Anything else unrecognized is unresolvable.
    pub fn resolve(&self, body: &str) -> Result<JobSpec, MessageError> {
        let message: Value = serde_json::from_str(body)?;
        let format = message
            .get("response_format")
            .and_then(Value::as_str)
            .map(str::to_string);

        let resolver = format
            .as_deref()
            .and_then(|f| self.resolvers.get(f))
            .cloned();
        let resolver = match resolver {
            Some(resolver) => resolver,
            None if message.get("url").is_none() => {
                tracing::warn!("Assuming sc format for message without url");
                self.resolvers
                    .get(sc::FORMAT)
                    .cloned()
                    .ok_or_else(|| MessageError::UnknownFormat(format.clone()))?
            }
            None => return Err(MessageError::UnknownFormat(format)),
        };
        resolver.resolve_input(&message)
    }
}

pub(crate) fn require_str<'a>(
    message: &'a Value,
    field: &'static str,
) -> Result<&'a str, MessageError> {
    message
        .get(field)
        .ok_or(MessageError::MissingField(field))?
        .as_str()
        .ok_or(MessageError::InvalidField(field))
}

pub(crate) fn optional_str(message: &Value, field: &str) -> Option<String> {
    message.get(field).and_then(Value::as_str).map(str::to_string)
}

/// Accepts numeric fields sent as either JSON numbers or strings.
pub(crate) fn optional_count(message: &Value, field: &'static str) -> Result<Option<u32>, MessageError> {
    match message.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .map(|n| Some(n as u32))
            .ok_or(MessageError::InvalidField(field)),
        Some(Value::String(s)) => s
            .parse::<u32>()
            .map(Some)
            .map_err(|_| MessageError::InvalidField(field)),
        Some(_) => Err(MessageError::InvalidField(field)),
    }
}

pub(crate) fn optional_date(
    message: &Value,
    field: &'static str,
) -> Result<Option<NaiveDate>, MessageError> {
    match message.get(field).and_then(Value::as_str) {
        Some(raw) => NaiveDate::parse_from_str(raw, CRAWL_DATE_FORMAT)
            .map(Some)
            .map_err(|_| MessageError::InvalidField(field)),
        None => Ok(None),
    }
}

//! Output object storage and result shaping.
//!
//! Each completed task uploads exactly one object: the JSON-lines encoding
//! of its emitted records, under a date-partitioned key with a random
//! component. The object is written before the result message is sent.

mod fs;
mod memory;

pub use fs::FsObjectStore;
pub use memory::MemoryObjectStore;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use uuid::Uuid;

use crate::record::ProductRecord;

#[derive(Debug, Error)]
pub enum OutputError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Record serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("{0}")]
    Backend(String),
}

/// Object storage collaborator. One object per completed task.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, body: Vec<u8>) -> Result<(), OutputError>;
}

/// Generate an output object key: date partition plus a random component
/// so concurrent workers never collide.
pub fn object_key(prefix: &str) -> String {
    format!(
        "{}/{}/{}.jl",
        prefix,
        Utc::now().format("%Y/%m/%d"),
        Uuid::new_v4()
    )
}

/// Encode records as JSON lines.
pub fn to_json_lines(records: &[ProductRecord]) -> Result<Vec<u8>, OutputError> {
    let mut out = Vec::new();
    for record in records {
        serde_json::to_writer(&mut out, record)?;
        out.push(b'\n');
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_key_shape() {
        let key = object_key("output");
        let parts: Vec<&str> = key.split('/').collect();
        assert_eq!(parts.len(), 5);
        assert_eq!(parts[0], "output");
        assert_eq!(parts[1].len(), 4); // year
        assert!(parts[4].ends_with(".jl"));

        // Random component keeps concurrent keys distinct.
        assert_ne!(key, object_key("output"));
    }

    #[test]
    fn test_json_lines_one_record_per_line() {
        let records = vec![
            ProductRecord::new("acme").with_url("https://acme.test/p/1"),
            ProductRecord::new("acme").with_url("https://acme.test/p/2"),
        ];
        let encoded = to_json_lines(&records).unwrap();
        let text = String::from_utf8(encoded).unwrap();
        let lines: Vec<&str> = text.trim_end().split('\n').collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            let value: serde_json::Value = serde_json::from_str(line).unwrap();
            assert_eq!(value["site"], "acme");
        }
    }
}

//! 持久化写入端

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Serialize;
use tokio::io::AsyncWriteExt;

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("Persistence write failed: {0}")]
    PersistenceWriteFailed(String),

    #[error("Remote store rejected write ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// 文档字段值
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    String(String),
    Double(f64),
    Integer(i64),
    /// 由存储端在写入时填入服务器时间
    ServerTimestamp,
}

/// 本地写入端中服务器时间戳的占位值
pub const SERVER_TIMESTAMP_PLACEHOLDER: &str = "__server_timestamp__";

impl Serialize for FieldValue {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            FieldValue::String(s) => serializer.serialize_str(s),
            FieldValue::Double(v) => serializer.serialize_f64(*v),
            FieldValue::Integer(v) => serializer.serialize_i64(*v),
            FieldValue::ServerTimestamp => serializer.serialize_str(SERVER_TIMESTAMP_PLACEHOLDER),
        }
    }
}

pub type Fields = BTreeMap<String, FieldValue>;

/// 持久化写入端
///
/// `document_key` 为 `None` 时由存储端生成文档 ID。
#[async_trait::async_trait]
pub trait PersistenceSink: Send + Sync {
    async fn write(
        &self,
        collection: &str,
        document_key: Option<&str>,
        fields: Fields,
    ) -> Result<(), PersistenceError>;
}

/// 丢弃所有写入
pub struct NullSink;

#[async_trait::async_trait]
impl PersistenceSink for NullSink {
    async fn write(
        &self,
        _collection: &str,
        _document_key: Option<&str>,
        _fields: Fields,
    ) -> Result<(), PersistenceError> {
        Ok(())
    }
}

#[derive(Serialize)]
struct JsonlEntry<'a> {
    collection: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    document: Option<&'a str>,
    fields: &'a Fields,
    written_at_millis: i64,
}

/// 每次写入追加一行 JSON 到本地文件
pub struct JsonlSink {
    path: PathBuf,
    file: tokio::sync::Mutex<Option<tokio::fs::File>>,
}

impl JsonlSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: tokio::sync::Mutex::new(None),
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

#[async_trait::async_trait]
impl PersistenceSink for JsonlSink {
    async fn write(
        &self,
        collection: &str,
        document_key: Option<&str>,
        fields: Fields,
    ) -> Result<(), PersistenceError> {
        let entry = JsonlEntry {
            collection,
            document: document_key,
            fields: &fields,
            written_at_millis: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
                .unwrap_or_default(),
        };
        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');

        let mut file = self.file.lock().await;
        if file.is_none() {
            if let Some(parent) = self.path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let opened = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            *file = Some(opened);
        }
        if let Some(f) = file.as_mut() {
            f.write_all(&line).await?;
            f.flush().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_values_serialize_untagged() {
        let mut fields = Fields::new();
        fields.insert("name".to_string(), FieldValue::String("A1".to_string()));
        fields.insert("latitude".to_string(), FieldValue::Double(12.5));
        fields.insert("observedAtMillis".to_string(), FieldValue::Integer(7));
        fields.insert("timestamp".to_string(), FieldValue::ServerTimestamp);

        let json = serde_json::to_value(&fields).unwrap();
        assert_eq!(json["name"], "A1");
        assert_eq!(json["latitude"], 12.5);
        assert_eq!(json["observedAtMillis"], 7);
        assert_eq!(json["timestamp"], SERVER_TIMESTAMP_PLACEHOLDER);
    }

    #[tokio::test]
    async fn test_jsonl_sink_appends_lines() {
        let path = std::env::temp_dir()
            .join(format!("gpsrelay-{}", uuid::Uuid::new_v4()))
            .join("fixes.jsonl");
        let sink = JsonlSink::new(&path);

        let mut fields = Fields::new();
        fields.insert("name".to_string(), FieldValue::String("A1".to_string()));
        sink.write("gps/currentUser/gpsNames", None, fields.clone())
            .await
            .unwrap();
        sink.write("gps/currentUser/gpsNames", Some("doc"), fields)
            .await
            .unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["collection"], "gps/currentUser/gpsNames");
        assert!(lines[0].get("document").is_none());
        assert_eq!(lines[1]["document"], "doc");
        assert_eq!(lines[1]["fields"]["name"], "A1");

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }
}

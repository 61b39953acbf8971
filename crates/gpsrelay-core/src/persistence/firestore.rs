//! Firestore REST 写入端
//!
//! 使用 `documents:commit` 接口，一次写入一个文档；
//! `FieldValue::ServerTimestamp` 字段转换成 `REQUEST_TIME` 变换。

use log::debug;
use serde_json::{Value, json};

use crate::persistence::sink::{FieldValue, Fields, PersistenceError, PersistenceSink};

const API_BASE: &str = "https://firestore.googleapis.com/v1";

#[derive(Debug, Clone)]
pub struct FirestoreConfig {
    pub project_id: String,
    /// Web API key，作为 `key` 查询参数
    pub api_key: Option<String>,
    /// OAuth2 访问令牌，作为 Bearer 头
    pub access_token: Option<String>,
}

pub struct FirestoreSink {
    config: FirestoreConfig,
    client: reqwest::Client,
}

impl FirestoreSink {
    pub fn new(config: FirestoreConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn database(&self) -> String {
        format!("projects/{}/databases/(default)", self.config.project_id)
    }

    fn commit_url(&self) -> String {
        format!("{}/{}/documents:commit", API_BASE, self.database())
    }

    fn document_name(
        &self,
        collection: &str,
        document_key: Option<&str>,
    ) -> Result<String, PersistenceError> {
        let collection = collection.trim_matches('/');
        // 集合路径必须是奇数段：coll 或 coll/doc/coll
        if collection.is_empty() || collection.split('/').count() % 2 == 0 {
            return Err(PersistenceError::PersistenceWriteFailed(format!(
                "invalid collection path: {:?}",
                collection
            )));
        }
        let key = document_key.map_or_else(
            || uuid::Uuid::new_v4().simple().to_string(),
            str::to_string,
        );
        Ok(format!("{}/documents/{}/{}", self.database(), collection, key))
    }
}

/// 构造 commit 请求体
pub(crate) fn commit_body(document_name: &str, fields: &Fields) -> Value {
    let mut values = serde_json::Map::new();
    let mut transforms = Vec::new();

    for (key, value) in fields {
        match value {
            FieldValue::String(s) => {
                values.insert(key.clone(), json!({ "stringValue": s }));
            }
            FieldValue::Double(v) => {
                values.insert(key.clone(), json!({ "doubleValue": v }));
            }
            FieldValue::Integer(v) => {
                // Firestore REST 用字符串表示 int64
                values.insert(key.clone(), json!({ "integerValue": v.to_string() }));
            }
            FieldValue::ServerTimestamp => {
                transforms.push(json!({
                    "fieldPath": key,
                    "setToServerValue": "REQUEST_TIME"
                }));
            }
        }
    }

    let mut write = json!({
        "update": {
            "name": document_name,
            "fields": values
        }
    });
    if !transforms.is_empty() {
        write["updateTransforms"] = Value::Array(transforms);
    }
    json!({ "writes": [write] })
}

#[async_trait::async_trait]
impl PersistenceSink for FirestoreSink {
    async fn write(
        &self,
        collection: &str,
        document_key: Option<&str>,
        fields: Fields,
    ) -> Result<(), PersistenceError> {
        let name = self.document_name(collection, document_key)?;
        let body = commit_body(&name, &fields);

        let mut request = self.client.post(self.commit_url()).json(&body);
        if let Some(key) = &self.config.api_key {
            request = request.query(&[("key", key)]);
        }
        if let Some(token) = &self.config.access_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PersistenceError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        debug!("Firestore write committed: {}", name);
        Ok(())
    }
}

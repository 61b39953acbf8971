//! 应用配置和持久化
//!
//! 扫描时长、会话超时、目标服务/特征、分帧方式以及持久化后端都在
//! `<config_dir>/gpsrelay/settings.toml` 中配置，缺失的字段取默认值。

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use log::debug;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ble::{SessionConfig, UART_SERVICE_UUID, UART_TX_CHAR_UUID};
use crate::events::DEFAULT_EVENT_CAPACITY;
use crate::logging::LogLevel;
use crate::persistence::{
    DEFAULT_QUEUE_CAPACITY, DEFAULT_USER_ID, FirestoreConfig, FirestoreSink, JsonlSink,
    PersistenceSink, StoreLayout,
};
use crate::stream::{DEFAULT_MAX_BUFFER, Framing};

/// 应用设置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    pub log_level: LogLevel,
    pub scan: ScanSettings,
    pub session: SessionSettings,
    pub persistence: PersistenceSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanSettings {
    /// 单次扫描时长
    pub timeout_secs: u64,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self { timeout_secs: 10 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub connect_timeout_ms: u64,
    pub discovery_timeout_ms: u64,
    pub service_uuid: Uuid,
    pub characteristic_uuid: Uuid,
    pub framing: Framing,
    pub max_frame_buffer: usize,
    /// 事件总线容量，落后更多的订阅者会丢事件
    pub event_capacity: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            discovery_timeout_ms: 15_000,
            service_uuid: UART_SERVICE_UUID,
            characteristic_uuid: UART_TX_CHAR_UUID,
            framing: Framing::default(),
            max_frame_buffer: DEFAULT_MAX_BUFFER,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistenceBackend {
    /// 不持久化
    #[default]
    None,
    /// 追加到本地 JSON Lines 文件
    Jsonl,
    /// Firestore REST
    Firestore,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceSettings {
    pub backend: PersistenceBackend,
    pub user_id: String,
    pub queue_capacity: usize,
    pub jsonl_path: PathBuf,
    pub firestore: Option<FirestoreSettings>,
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        Self {
            backend: PersistenceBackend::None,
            user_id: DEFAULT_USER_ID.to_string(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            jsonl_path: default_jsonl_path(),
            firestore: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FirestoreSettings {
    pub project_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
}

impl RelaySettings {
    /// 获取配置文件路径
    pub fn config_path() -> PathBuf {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("gpsrelay");
        config_dir.join("settings.toml")
    }

    /// 加载设置（如果文件不存在或无法解析则使用默认值）
    pub fn load() -> Self {
        let path = Self::config_path();
        if path.exists() {
            match Self::load_from(&path) {
                Ok(settings) => return settings,
                Err(e) => log::warn!("{:#}, using defaults", e),
            }
        }
        Self::default()
    }

    /// 从指定文件加载，任何错误都会返回
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file {:?}", path))?;
        let settings = toml::from_str(&content)
            .with_context(|| format!("Failed to parse settings {:?}", path))?;
        debug!("Loaded settings from {:?}", path);
        Ok(settings)
    }

    /// 保存设置
    pub fn save(&self) -> anyhow::Result<()> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_toml()?)?;
        debug!("Saved settings to {:?}", path);
        Ok(())
    }

    pub fn to_toml(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan.timeout_secs)
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            connect_timeout: Duration::from_millis(self.session.connect_timeout_ms),
            discovery_timeout: Duration::from_millis(self.session.discovery_timeout_ms),
            service_uuid: self.session.service_uuid,
            characteristic_uuid: self.session.characteristic_uuid,
            framing: self.session.framing,
            max_frame_buffer: self.session.max_frame_buffer,
        }
    }

    pub fn store_layout(&self) -> StoreLayout {
        StoreLayout::new(self.persistence.user_id.clone())
    }

    /// 按配置构造持久化写入端；`backend = "none"` 时返回 `None`
    pub fn persistence_sink(&self) -> anyhow::Result<Option<Arc<dyn PersistenceSink>>> {
        match self.persistence.backend {
            PersistenceBackend::None => Ok(None),
            PersistenceBackend::Jsonl => Ok(Some(Arc::new(JsonlSink::new(
                self.persistence.jsonl_path.clone(),
            )))),
            PersistenceBackend::Firestore => {
                let firestore = self
                    .persistence
                    .firestore
                    .as_ref()
                    .filter(|f| !f.project_id.is_empty())
                    .context("Firestore backend requires [persistence.firestore] project_id")?;
                Ok(Some(Arc::new(FirestoreSink::new(FirestoreConfig {
                    project_id: firestore.project_id.clone(),
                    api_key: firestore.api_key.clone(),
                    access_token: firestore.access_token.clone(),
                }))))
            }
        }
    }
}

fn default_jsonl_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("gpsrelay")
        .join("fixes.jsonl")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = RelaySettings::default();
        assert_eq!(settings.scan_timeout(), Duration::from_secs(10));
        assert_eq!(settings.persistence.backend, PersistenceBackend::None);
        assert_eq!(settings.persistence.user_id, "currentUser");

        let config = settings.session_config();
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.discovery_timeout, Duration::from_secs(15));
        assert_eq!(config.service_uuid, UART_SERVICE_UUID);
        assert_eq!(config.framing, Framing::Fixed { length: 21 });
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let settings: RelaySettings = toml::from_str(
            r#"
            log_level = "debug"

            [session]
            connect_timeout_ms = 2500
            framing = { mode = "delimited", delimiter = 10 }

            [persistence]
            backend = "jsonl"
            jsonl_path = "/tmp/fixes.jsonl"
            "#,
        )
        .unwrap();

        assert_eq!(settings.log_level, LogLevel::Debug);
        assert_eq!(settings.scan.timeout_secs, 10);
        assert_eq!(settings.session.connect_timeout_ms, 2500);
        assert_eq!(settings.session.discovery_timeout_ms, 15_000);
        assert_eq!(settings.session.framing, Framing::lines());
        assert_eq!(settings.persistence.backend, PersistenceBackend::Jsonl);
        assert_eq!(settings.persistence.queue_capacity, 1024);
        assert!(settings.persistence_sink().unwrap().is_some());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = std::env::temp_dir().join(format!("gpsrelay-{}", Uuid::new_v4()));
        let path = dir.join("settings.toml");

        let mut settings = RelaySettings::default();
        settings.scan.timeout_secs = 3;
        settings.persistence.backend = PersistenceBackend::Firestore;
        settings.persistence.firestore = Some(FirestoreSettings {
            project_id: "demo".to_string(),
            api_key: Some("key".to_string()),
            access_token: None,
        });
        settings.save_to(&path).unwrap();

        let loaded = RelaySettings::load_from(&path).unwrap();
        assert_eq!(loaded.scan.timeout_secs, 3);
        assert_eq!(loaded.persistence.backend, PersistenceBackend::Firestore);
        assert_eq!(
            loaded.persistence.firestore.unwrap().api_key.as_deref(),
            Some("key")
        );

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_load_from_missing_file_fails() {
        let path = std::env::temp_dir()
            .join(format!("gpsrelay-{}", Uuid::new_v4()))
            .join("settings.toml");
        assert!(RelaySettings::load_from(&path).is_err());
    }

    #[test]
    fn test_firestore_backend_requires_project() {
        let mut settings = RelaySettings::default();
        settings.persistence.backend = PersistenceBackend::Firestore;
        assert!(settings.persistence_sink().is_err());

        settings.persistence.backend = PersistenceBackend::None;
        assert!(settings.persistence_sink().unwrap().is_none());
    }
}

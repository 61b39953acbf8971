//! 持久化队列
//!
//! 尽力而为、发后即忘：
//! - `enqueue` 从不等待，队列满或已关闭时记录警告并丢弃记录
//! - 后台任务依次把记录写入 [`PersistenceSink`]，失败只记日志，不重试
//! - 每条记录写两次：名称写入 `gps/{user}/gpsNames`，
//!   坐标写入 `users/{user}/gpsData/{name}/locations`（附服务器时间戳）

pub mod firestore;
pub mod sink;

use std::sync::Arc;

use log::{debug, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::stream::GpsRecord;

pub use firestore::{FirestoreConfig, FirestoreSink};
pub use sink::{
    FieldValue, Fields, JsonlSink, NullSink, PersistenceError, PersistenceSink,
    SERVER_TIMESTAMP_PLACEHOLDER,
};

pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;
pub const DEFAULT_USER_ID: &str = "currentUser";

/// 记录在存储中的位置
#[derive(Debug, Clone)]
pub struct StoreLayout {
    pub user_id: String,
}

impl StoreLayout {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
        }
    }

    pub fn names_collection(&self) -> String {
        format!("gps/{}/gpsNames", self.user_id)
    }

    pub fn locations_collection(&self, name: &str) -> String {
        format!("users/{}/gpsData/{}/locations", self.user_id, name)
    }
}

impl Default for StoreLayout {
    fn default() -> Self {
        Self::new(DEFAULT_USER_ID)
    }
}

/// 持久化队列句柄，可廉价克隆
#[derive(Clone)]
pub struct PersistenceQueue {
    tx: mpsc::Sender<GpsRecord>,
}

impl PersistenceQueue {
    /// 启动后台写入任务
    ///
    /// 所有句柄被丢弃后，任务写完剩余记录即退出。
    pub fn spawn(
        sink: Arc<dyn PersistenceSink>,
        layout: StoreLayout,
        capacity: usize,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let worker = tokio::spawn(run_worker(sink, layout, rx));
        (Self { tx }, worker)
    }

    /// 入队，永不阻塞
    pub fn enqueue(&self, record: GpsRecord) {
        match self.tx.try_send(record) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(record)) => {
                warn!("Persistence queue full, dropping fix from {}", record.name);
            }
            Err(mpsc::error::TrySendError::Closed(record)) => {
                warn!("Persistence queue closed, dropping fix from {}", record.name);
            }
        }
    }
}

async fn run_worker(
    sink: Arc<dyn PersistenceSink>,
    layout: StoreLayout,
    mut rx: mpsc::Receiver<GpsRecord>,
) {
    while let Some(record) = rx.recv().await {
        store_record(sink.as_ref(), &layout, &record).await;
    }
    debug!("Persistence queue drained");
}

/// 写入一条记录，失败只记录日志
async fn store_record(sink: &dyn PersistenceSink, layout: &StoreLayout, record: &GpsRecord) {
    let names = layout.names_collection();
    let locations = layout.locations_collection(&record.name);

    let mut name_fields = Fields::new();
    name_fields.insert("name".to_string(), FieldValue::String(record.name.clone()));

    let mut location_fields = Fields::new();
    location_fields.insert("latitude".to_string(), FieldValue::Double(record.latitude));
    location_fields.insert("longitude".to_string(), FieldValue::Double(record.longitude));
    location_fields.insert(
        "observedAtMillis".to_string(),
        FieldValue::Integer(record.observed_at_millis),
    );
    location_fields.insert("timestamp".to_string(), FieldValue::ServerTimestamp);

    let (name_result, location_result) = tokio::join!(
        sink.write(&names, None, name_fields),
        sink.write(&locations, None, location_fields),
    );

    match name_result {
        Ok(()) => debug!("GPS name {} stored successfully", record.name),
        Err(e) => warn!("Error adding GPS name {}: {}", record.name, e),
    }
    match location_result {
        Ok(()) => debug!("Location data for {} added", record.name),
        Err(e) => warn!("Error adding location data for {}: {}", record.name, e),
    }
}

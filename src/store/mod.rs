use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use interprocess::local_socket::{prelude::*, GenericNamespaced, Stream};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::models::{
    default_mode_color_themes, Identity, PersistedRecord, Settings, Statistics, Task, TimerMode,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("record store daemon error: {0}")]
    Daemon(String),
    #[error("store lock poisoned")]
    Poisoned,
}

pub type StoreResult<T> = Result<T, StoreError>;

// ==================== 线协议 ====================

/// focusd 的请求帧，每行一条JSON
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WireRequest {
    Load { key: String },
    Save { key: String, record: Value },
}

/// focusd 的响应帧
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WireResponse {
    Found { record: Value },
    Missing,
    Saved,
    Error { message: String },
}

/// 记录级合并：来稿的顶层字段覆盖已存字段，其余字段原样保留。
/// 只合并顶层，不做深合并。
pub fn merge_record(existing: Option<Value>, incoming: Value) -> Value {
    match (existing, incoming) {
        (Some(Value::Object(mut base)), Value::Object(incoming)) => {
            for (key, value) in incoming {
                base.insert(key, value);
            }
            Value::Object(base)
        }
        (_, incoming) => incoming,
    }
}

// ==================== 存储后端 ====================

/// 键值记录存储。远端与本地两个实现满足同一套load/save语义。
pub trait RecordStore: Send + Sync {
    fn load(&self, key: &str) -> StoreResult<Option<PersistedRecord>>;
    fn save(&self, key: &str, record: &PersistedRecord) -> StoreResult<()>;
}

/// 本地存储：SQLite里的JSON键值表
pub struct LocalStore {
    conn: Mutex<Connection>,
}

impl LocalStore {
    /// 打开或创建数据库
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS records (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// 读原始JSON文档
    pub fn load_raw(&self, key: &str) -> StoreResult<Option<Value>> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT value FROM records WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// 写原始JSON文档（upsert）
    pub fn save_raw(&self, key: &str, value: &Value) -> StoreResult<()> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        conn.execute(
            "INSERT INTO records (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, serde_json::to_string(value)?, Utc::now()],
        )?;
        Ok(())
    }
}

impl RecordStore for LocalStore {
    fn load(&self, key: &str) -> StoreResult<Option<PersistedRecord>> {
        match self.load_raw(key)? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    fn save(&self, key: &str, record: &PersistedRecord) -> StoreResult<()> {
        self.save_raw(key, &serde_json::to_value(record)?)
    }
}

/// 远端存储：经本地socket访问focusd，一行请求一行响应
pub struct RemoteStore {
    socket: String,
}

impl RemoteStore {
    pub fn new(socket: String) -> Self {
        Self { socket }
    }

    fn request(&self, request: &WireRequest) -> StoreResult<WireResponse> {
        let name = self.socket.as_str().to_ns_name::<GenericNamespaced>()?;
        let mut conn = BufReader::new(Stream::connect(name)?);

        let mut frame = serde_json::to_string(request)?;
        frame.push('\n');
        conn.get_mut().write_all(frame.as_bytes())?;

        let mut line = String::new();
        conn.read_line(&mut line)?;
        Ok(serde_json::from_str(&line)?)
    }
}

impl RecordStore for RemoteStore {
    fn load(&self, key: &str) -> StoreResult<Option<PersistedRecord>> {
        match self.request(&WireRequest::Load {
            key: key.to_string(),
        })? {
            WireResponse::Found { record } => Ok(Some(serde_json::from_value(record)?)),
            WireResponse::Missing => Ok(None),
            WireResponse::Error { message } => Err(StoreError::Daemon(message)),
            WireResponse::Saved => Err(StoreError::Daemon("unexpected response".to_string())),
        }
    }

    fn save(&self, key: &str, record: &PersistedRecord) -> StoreResult<()> {
        match self.request(&WireRequest::Save {
            key: key.to_string(),
            record: serde_json::to_value(record)?,
        })? {
            WireResponse::Saved => Ok(()),
            WireResponse::Error { message } => Err(StoreError::Daemon(message)),
            _ => Err(StoreError::Daemon("unexpected response".to_string())),
        }
    }
}

// ==================== 加载合并策略 ====================

/// 一次load合并出的内存状态。设置是逐字段浅合并（旧记录缺的字段
/// 用默认值补齐）；任务与统计是累积结构，整体替换。
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedState {
    pub settings: Settings,
    pub tasks: Vec<Task>,
    pub statistics: Statistics,
    pub theme: String,
    pub mode_color_themes: BTreeMap<TimerMode, String>,
}

impl Default for LoadedState {
    fn default() -> Self {
        Self {
            settings: Settings::default(),
            tasks: Vec::new(),
            statistics: Statistics::default(),
            theme: "light".to_string(),
            mode_color_themes: default_mode_color_themes(),
        }
    }
}

impl LoadedState {
    /// 记录缺失时全部留默认值，且不回写
    pub fn from_record(record: Option<PersistedRecord>) -> Self {
        let mut loaded = Self::default();
        let Some(record) = record else {
            return loaded;
        };

        if let Some(patch) = &record.settings {
            loaded.settings.apply(patch);
        }
        if let Some(tasks) = record.tasks {
            loaded.tasks = tasks;
        }
        if let Some(statistics) = record.statistics {
            loaded.statistics = statistics;
        }
        if let Some(theme) = record.theme {
            loaded.theme = theme;
        }
        if let Some(themes) = record.mode_color_themes {
            loaded.mode_color_themes = themes;
        } else if let Some(legacy) = record.color_theme {
            // 一次性迁移旧版单色字段；新shape只存在内存里，
            // 下次save自然写成modeColorThemes
            loaded.mode_color_themes = BTreeMap::from([
                (TimerMode::Focus, legacy),
                (TimerMode::ShortBreak, "green".to_string()),
                (TimerMode::LongBreak, "blue".to_string()),
            ]);
        }
        loaded
    }
}

// ==================== 中介 ====================

/// 持久化中介：按身份选择后端。已登录走focusd，匿名走本地库。
/// load/save都是阻塞调用，外层用spawn_blocking挂到运行时上，
/// 存储悬挂不会卡住计时。
pub struct StoreMediator {
    identity: Identity,
    local: Arc<dyn RecordStore>,
    remote: Arc<dyn RecordStore>,
}

impl StoreMediator {
    pub fn new(
        local: Arc<dyn RecordStore>,
        remote: Arc<dyn RecordStore>,
        identity: Identity,
    ) -> Self {
        Self {
            identity,
            local,
            remote,
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// 切换身份；返回是否发生了变化
    pub fn set_identity(&mut self, identity: Identity) -> bool {
        if self.identity == identity {
            return false;
        }
        tracing::info!("identity changed: {} -> {}", self.identity, identity);
        self.identity = identity;
        true
    }

    /// 当前身份的后端与记录键。把身份标签一起交给调用方，
    /// 晚到的响应与当前身份不符时必须丢弃。
    pub fn backend(&self) -> (Identity, Arc<dyn RecordStore>) {
        let backend = if self.identity.is_anonymous() {
            Arc::clone(&self.local)
        } else {
            Arc::clone(&self.remote)
        };
        (self.identity.clone(), backend)
    }

    /// 加载并合并。失败只告警，调用方继续用内存默认值。
    pub fn load_blocking(&self) -> (Identity, LoadedState) {
        let (identity, backend) = self.backend();
        let record = match backend.load(identity.record_key()) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!("failed to load record for {identity}: {e}");
                None
            }
        };
        (identity.clone(), LoadedState::from_record(record))
    }

    /// 保存完整快照。失败记日志后吞掉，绝不打断计时；
    /// 下一次成功的全量写入自然补上。
    pub fn save_blocking(&self, record: &PersistedRecord) {
        let (identity, backend) = self.backend();
        if let Err(e) = backend.save(identity.record_key(), record) {
            tracing::warn!("failed to save record for {identity}: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Task;
    use serde_json::json;

    fn open_store() -> (tempfile::TempDir, LocalStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path().join("focus.db")).unwrap();
        (dir, store)
    }

    #[test]
    fn local_store_roundtrip() {
        let (_dir, store) = open_store();
        let record = PersistedRecord {
            settings: Some(Settings::default().to_patch()),
            tasks: Some(vec![Task::new("review notes".to_string())]),
            statistics: Some(Statistics::default()),
            theme: Some("dark".to_string()),
            mode_color_themes: Some(default_mode_color_themes()),
            color_theme: None,
            updated_at: Some(Utc::now()),
        };

        store.save("anonymous", &record).unwrap();
        let loaded = store.load("anonymous").unwrap().unwrap();
        assert_eq!(loaded.theme.as_deref(), Some("dark"));
        assert_eq!(loaded.tasks.unwrap()[0].text, "review notes");
    }

    #[test]
    fn local_store_upsert_overwrites() {
        let (_dir, store) = open_store();
        store.save_raw("k", &json!({"theme": "light"})).unwrap();
        store.save_raw("k", &json!({"theme": "dark"})).unwrap();
        assert_eq!(store.load_raw("k").unwrap().unwrap()["theme"], "dark");
    }

    #[test]
    fn absent_record_loads_as_none_without_write() {
        let (_dir, store) = open_store();
        assert!(store.load("nobody").unwrap().is_none());
        // load不产生回写
        assert!(store.load_raw("nobody").unwrap().is_none());
    }

    #[test]
    fn from_record_absent_keeps_defaults() {
        let loaded = LoadedState::from_record(None);
        assert_eq!(loaded, LoadedState::default());
        assert_eq!(loaded.settings.focus_duration_min, 25);
        assert_eq!(loaded.theme, "light");
    }

    #[test]
    fn settings_merge_is_shallow_over_defaults() {
        let record: PersistedRecord =
            serde_json::from_value(json!({"settings": {"focusDurationMin": 50}})).unwrap();
        let loaded = LoadedState::from_record(Some(record));
        assert_eq!(loaded.settings.focus_duration_min, 50);
        // 写入记录后才加的字段保持默认
        assert_eq!(loaded.settings.sound_repeat_count, 1);
        assert!(loaded.settings.notifications_enabled);
    }

    #[test]
    fn tasks_and_statistics_replace_wholesale() {
        let record: PersistedRecord = serde_json::from_value(json!({
            "tasks": [],
            "statistics": {"totalSessions": 7, "totalFocusMinutes": 175, "dailyStats": {}}
        }))
        .unwrap();
        let loaded = LoadedState::from_record(Some(record));
        assert!(loaded.tasks.is_empty());
        assert_eq!(loaded.statistics.total_sessions, 7);
        assert_eq!(loaded.statistics.total_focus_minutes, 175);
    }

    #[test]
    fn legacy_color_theme_migrates_on_load() {
        let record: PersistedRecord =
            serde_json::from_value(json!({"colorTheme": "purple"})).unwrap();
        let loaded = LoadedState::from_record(Some(record));
        assert_eq!(loaded.mode_color_themes[&TimerMode::Focus], "purple");
        assert_eq!(loaded.mode_color_themes[&TimerMode::ShortBreak], "green");
        assert_eq!(loaded.mode_color_themes[&TimerMode::LongBreak], "blue");
    }

    #[test]
    fn mode_color_themes_wins_over_legacy_field() {
        let record: PersistedRecord = serde_json::from_value(json!({
            "colorTheme": "purple",
            "modeColorThemes": {"focus": "gray", "shortBreak": "green", "longBreak": "blue"}
        }))
        .unwrap();
        let loaded = LoadedState::from_record(Some(record));
        assert_eq!(loaded.mode_color_themes[&TimerMode::Focus], "gray");
    }

    #[test]
    fn merge_record_preserves_unrelated_fields() {
        let existing = json!({"theme": "light", "externalField": {"keep": true}});
        let incoming = json!({"theme": "dark", "tasks": []});
        let merged = merge_record(Some(existing), incoming);
        assert_eq!(merged["theme"], "dark");
        assert_eq!(merged["externalField"]["keep"], true);
        assert!(merged["tasks"].as_array().unwrap().is_empty());
    }

    #[test]
    fn merge_record_without_existing_takes_incoming() {
        let incoming = json!({"theme": "dark"});
        assert_eq!(merge_record(None, incoming.clone()), incoming);
    }

    #[test]
    fn mediator_picks_backend_by_identity() {
        let dir = tempfile::tempdir().unwrap();
        let local: Arc<dyn RecordStore> =
            Arc::new(LocalStore::open(dir.path().join("local.db")).unwrap());
        // 远端后端在测试里也用一个本地库顶替，只验证选择逻辑
        let remote: Arc<dyn RecordStore> =
            Arc::new(LocalStore::open(dir.path().join("remote.db")).unwrap());

        let mut mediator =
            StoreMediator::new(Arc::clone(&local), Arc::clone(&remote), Identity::Anonymous);

        let record = PersistedRecord {
            theme: Some("dark".to_string()),
            ..Default::default()
        };
        mediator.save_blocking(&record);
        assert!(local.load("anonymous").unwrap().is_some());
        assert!(remote.load("anonymous").unwrap().is_none());

        assert!(mediator.set_identity(Identity::User("u1".to_string())));
        assert!(!mediator.set_identity(Identity::User("u1".to_string())));
        mediator.save_blocking(&record);
        assert!(remote.load("u1").unwrap().is_some());

        let (identity, loaded) = mediator.load_blocking();
        assert_eq!(identity, Identity::User("u1".to_string()));
        assert_eq!(loaded.theme, "dark");
    }
}

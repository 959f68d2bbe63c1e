use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// 计时模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TimerMode {
    Focus,
    ShortBreak,
    LongBreak,
}

impl std::fmt::Display for TimerMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            TimerMode::Focus => "Focus",
            TimerMode::ShortBreak => "Short break",
            TimerMode::LongBreak => "Long break",
        };
        write!(f, "{label}")
    }
}

/// 提示音类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SoundKind {
    #[default]
    Bell,
    Chime,
    Ping,
    Alert,
    Digital,
}

impl SoundKind {
    pub fn token(&self) -> &'static str {
        match self {
            SoundKind::Bell => "bell",
            SoundKind::Chime => "chime",
            SoundKind::Ping => "ping",
            SoundKind::Alert => "alert",
            SoundKind::Digital => "digital",
        }
    }

    /// 未知的持久化token回退到bell
    pub fn from_token(token: &str) -> Self {
        match token {
            "chime" => SoundKind::Chime,
            "ping" => SoundKind::Ping,
            "alert" => SoundKind::Alert,
            "digital" => SoundKind::Digital,
            _ => SoundKind::Bell,
        }
    }
}

impl Serialize for SoundKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.token())
    }
}

impl<'de> Deserialize<'de> for SoundKind {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(SoundKind::from_token(&raw))
    }
}

/// 用户设置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub focus_duration_min: u32,
    pub short_break_duration_min: u32,
    pub long_break_duration_min: u32,
    pub auto_start_breaks: bool,
    pub auto_start_focus: bool,
    pub sound_enabled: bool,
    pub selected_sound: SoundKind,
    pub sound_volume: f64,
    pub sound_repeat_count: u32,
    pub notifications_enabled: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            focus_duration_min: 25,
            short_break_duration_min: 5,
            long_break_duration_min: 15,
            auto_start_breaks: false,
            auto_start_focus: false,
            sound_enabled: true,
            selected_sound: SoundKind::Bell,
            sound_volume: 0.5,
            sound_repeat_count: 1,
            notifications_enabled: true,
        }
    }
}

impl Settings {
    /// 模式对应的时长（秒）
    pub fn duration_secs(&self, mode: TimerMode) -> u32 {
        let minutes = match mode {
            TimerMode::Focus => self.focus_duration_min,
            TimerMode::ShortBreak => self.short_break_duration_min,
            TimerMode::LongBreak => self.long_break_duration_min,
        };
        minutes * 60
    }

    /// 浅合并：仅覆盖补丁中出现的字段
    pub fn apply(&mut self, patch: &SettingsPatch) {
        if let Some(v) = patch.focus_duration_min {
            self.focus_duration_min = v;
        }
        if let Some(v) = patch.short_break_duration_min {
            self.short_break_duration_min = v;
        }
        if let Some(v) = patch.long_break_duration_min {
            self.long_break_duration_min = v;
        }
        if let Some(v) = patch.auto_start_breaks {
            self.auto_start_breaks = v;
        }
        if let Some(v) = patch.auto_start_focus {
            self.auto_start_focus = v;
        }
        if let Some(v) = patch.sound_enabled {
            self.sound_enabled = v;
        }
        if let Some(v) = patch.selected_sound {
            self.selected_sound = v;
        }
        if let Some(v) = patch.sound_volume {
            self.sound_volume = v;
        }
        if let Some(v) = patch.sound_repeat_count {
            self.sound_repeat_count = v;
        }
        if let Some(v) = patch.notifications_enabled {
            self.notifications_enabled = v;
        }
    }

    pub fn to_patch(&self) -> SettingsPatch {
        SettingsPatch {
            focus_duration_min: Some(self.focus_duration_min),
            short_break_duration_min: Some(self.short_break_duration_min),
            long_break_duration_min: Some(self.long_break_duration_min),
            auto_start_breaks: Some(self.auto_start_breaks),
            auto_start_focus: Some(self.auto_start_focus),
            sound_enabled: Some(self.sound_enabled),
            selected_sound: Some(self.selected_sound),
            sound_volume: Some(self.sound_volume),
            sound_repeat_count: Some(self.sound_repeat_count),
            notifications_enabled: Some(self.notifications_enabled),
        }
    }
}

/// 设置补丁：缺失字段保持原值，保证旧记录的前向兼容
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SettingsPatch {
    pub focus_duration_min: Option<u32>,
    pub short_break_duration_min: Option<u32>,
    pub long_break_duration_min: Option<u32>,
    pub auto_start_breaks: Option<bool>,
    pub auto_start_focus: Option<bool>,
    pub sound_enabled: Option<bool>,
    pub selected_sound: Option<SoundKind>,
    pub sound_volume: Option<f64>,
    pub sound_repeat_count: Option<u32>,
    pub notifications_enabled: Option<bool>,
}

/// 计时器状态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerState {
    pub mode: TimerMode,
    pub remaining_seconds: u32,
    pub is_running: bool,
    pub is_paused: bool,
    pub completed_focus_sessions: u32,
    pub linked_task_id: Option<Uuid>,
}

impl TimerState {
    /// 初始状态：空闲的Focus模式，剩余时间取自设置
    pub fn with_settings(settings: &Settings) -> Self {
        Self {
            mode: TimerMode::Focus,
            remaining_seconds: settings.duration_secs(TimerMode::Focus),
            is_running: false,
            is_paused: false,
            completed_focus_sessions: 0,
            linked_task_id: None,
        }
    }

    pub fn format_remaining(&self) -> String {
        let minutes = self.remaining_seconds / 60;
        let seconds = self.remaining_seconds % 60;
        format!("{:02}:{:02}", minutes, seconds)
    }
}

/// 任务数据模型
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: Uuid,
    pub text: String,
    pub completed: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub linked_session_count: u32,
}

impl Task {
    pub fn new(text: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            text,
            completed: false,
            created_at: Utc::now(),
            linked_session_count: 0,
        }
    }
}

/// 任务补丁
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskPatch {
    pub text: Option<String>,
    pub completed: Option<bool>,
}

/// 单日统计桶
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DayStats {
    pub sessions: u32,
    pub focus_minutes: u32,
}

/// 累计统计，按ISO日期（YYYY-MM-DD）分桶
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Statistics {
    pub total_sessions: u32,
    pub total_focus_minutes: u32,
    pub daily_stats: BTreeMap<String, DayStats>,
}

/// 各模式默认的配色主题
pub fn default_mode_color_themes() -> BTreeMap<TimerMode, String> {
    BTreeMap::from([
        (TimerMode::Focus, "red".to_string()),
        (TimerMode::ShortBreak, "green".to_string()),
        (TimerMode::LongBreak, "blue".to_string()),
    ])
}

/// 持久化记录。字段名是持久格式的一部分，不能改动；
/// `colorTheme` 是旧版字段，只读不写。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PersistedRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settings: Option<SettingsPatch>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tasks: Option<Vec<Task>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub statistics: Option<Statistics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub theme: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode_color_themes: Option<BTreeMap<TimerMode, String>>,
    #[serde(skip_serializing)]
    pub color_theme: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// 持久化身份：已登录用户或匿名哨兵
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    Anonymous,
    User(String),
}

impl Identity {
    /// 持久化记录的键
    pub fn record_key(&self) -> &str {
        match self {
            Identity::Anonymous => "anonymous",
            Identity::User(id) => id,
        }
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, Identity::Anonymous)
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Identity::Anonymous => write!(f, "anonymous"),
            Identity::User(id) => write!(f, "{id}"),
        }
    }
}

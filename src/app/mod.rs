use std::collections::BTreeMap;

use chrono::{Local, Utc};
use tokio::sync::{mpsc, watch};
use tokio::task;
use uuid::Uuid;

use crate::engine::{self, CountdownDriver, Effect, Intent};
use crate::models::{
    default_mode_color_themes, Identity, PersistedRecord, Settings, SettingsPatch, Statistics,
    Task, TaskPatch, TimerMode, TimerState,
};
use crate::notify::NotificationManager;
use crate::stats;
use crate::store::{LoadedState, StoreMediator};

/// 共享聚合状态：每个运行中的应用（或测试）构造一份，
/// 不用全局单例。只有本模块与engine会改它。
#[derive(Debug, Clone, PartialEq)]
pub struct AppState {
    pub timer: TimerState,
    pub settings: Settings,
    pub tasks: Vec<Task>,
    pub statistics: Statistics,
    pub theme: String,
    pub mode_color_themes: BTreeMap<TimerMode, String>,
}

impl Default for AppState {
    fn default() -> Self {
        let settings = Settings::default();
        Self {
            timer: TimerState::with_settings(&settings),
            settings,
            tasks: Vec::new(),
            statistics: Statistics::default(),
            theme: "light".to_string(),
            mode_color_themes: default_mode_color_themes(),
        }
    }
}

impl AppState {
    pub fn from_loaded(loaded: LoadedState) -> Self {
        let mut state = Self::default();
        state.apply_loaded(loaded);
        state
    }

    /// 用一次load的结果覆盖内存状态。计时器本体不持久化，
    /// 只在空闲时按新设置重derive剩余时间。
    pub fn apply_loaded(&mut self, loaded: LoadedState) {
        self.settings = loaded.settings;
        self.tasks = loaded.tasks;
        self.statistics = loaded.statistics;
        self.theme = loaded.theme;
        self.mode_color_themes = loaded.mode_color_themes;

        if !self.timer.is_running && !self.timer.is_paused {
            self.timer.remaining_seconds = self.settings.duration_secs(self.timer.mode);
        }
        if let Some(id) = self.timer.linked_task_id {
            if !self.tasks.iter().any(|t| t.id == id) {
                self.timer.linked_task_id = None;
            }
        }
    }

    /// 完整快照，带新时间戳。每次保存都写全量。
    pub fn snapshot(&self) -> PersistedRecord {
        PersistedRecord {
            settings: Some(self.settings.to_patch()),
            tasks: Some(self.tasks.clone()),
            statistics: Some(self.statistics.clone()),
            theme: Some(self.theme.clone()),
            mode_color_themes: Some(self.mode_color_themes.clone()),
            color_theme: None,
            updated_at: Some(Utc::now()),
        }
    }

    // ==================== 设置 ====================

    /// 浅合并更新设置。非法时长被整字段拒绝，音量与重复次数钳位。
    /// 空闲时按当前模式重derive剩余时间；暂停中的剩余时间不动。
    pub fn update_settings(&mut self, patch: SettingsPatch) {
        let patch = sanitize_patch(patch);
        self.settings.apply(&patch);
        if !self.timer.is_running && !self.timer.is_paused {
            self.timer.remaining_seconds = self.settings.duration_secs(self.timer.mode);
        }
    }

    pub fn set_theme(&mut self, theme: String) {
        self.theme = theme;
    }

    pub fn set_mode_color_theme(&mut self, mode: TimerMode, theme: String) {
        self.mode_color_themes.insert(mode, theme);
    }

    // ==================== 任务 ====================

    /// 新建任务。空白文本在边界上拒绝，不会进入状态。
    pub fn add_task(&mut self, text: &str) -> Option<&Task> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        self.tasks.push(Task::new(text.to_string()));
        self.tasks.last()
    }

    pub fn update_task(&mut self, id: Uuid, patch: TaskPatch) -> bool {
        let Some(task) = self.tasks.iter_mut().find(|t| t.id == id) else {
            return false;
        };
        if let Some(text) = &patch.text {
            let text = text.trim();
            if text.is_empty() {
                return false;
            }
            task.text = text.to_string();
        }
        if let Some(completed) = patch.completed {
            task.completed = completed;
        }
        true
    }

    /// 删除任务；指向它的linkedTaskId一并清除
    pub fn delete_task(&mut self, id: Uuid) -> bool {
        let before = self.tasks.len();
        self.tasks.retain(|t| t.id != id);
        let deleted = self.tasks.len() != before;
        if deleted && self.timer.linked_task_id == Some(id) {
            self.timer.linked_task_id = None;
        }
        deleted
    }

    pub fn toggle_task(&mut self, id: Uuid) -> Option<bool> {
        let task = self.tasks.iter_mut().find(|t| t.id == id)?;
        task.completed = !task.completed;
        Some(task.completed)
    }

    pub fn link_task(&mut self, id: Option<Uuid>) -> bool {
        match id {
            Some(id) if !self.tasks.iter().any(|t| t.id == id) => false,
            id => {
                self.timer.linked_task_id = id;
                true
            }
        }
    }

    /// 弱引用解析：任务已删除时视同未关联
    pub fn linked_task(&self) -> Option<&Task> {
        let id = self.timer.linked_task_id?;
        self.tasks.iter().find(|t| t.id == id)
    }
}

/// 设置补丁消毒：时长必须为正，音量与重复次数钳位到合法区间
fn sanitize_patch(mut patch: SettingsPatch) -> SettingsPatch {
    for duration in [
        &mut patch.focus_duration_min,
        &mut patch.short_break_duration_min,
        &mut patch.long_break_duration_min,
    ] {
        if *duration == Some(0) {
            tracing::warn!("rejecting non-positive duration in settings update");
            *duration = None;
        }
    }
    if let Some(volume) = patch.sound_volume.as_mut() {
        *volume = volume.clamp(0.0, 1.0);
    }
    if let Some(repeat) = patch.sound_repeat_count.as_mut() {
        *repeat = (*repeat).clamp(1, 5);
    }
    patch
}

/// UI边界与外部事件投进来的命令。全部在单个循环里顺序执行，
/// 任何转换都不会被观察到半途状态。
#[derive(Debug, Clone)]
pub enum Command {
    Intent(Intent),
    UpdateSettings(SettingsPatch),
    AddTask(String),
    UpdateTask { id: Uuid, patch: TaskPatch },
    DeleteTask(Uuid),
    ToggleTask(Uuid),
    LinkTask(Option<Uuid>),
    SetTheme(String),
    SetModeColorTheme { mode: TimerMode, theme: String },
    IdentityChanged(Identity),
    LoadFinished { identity: Identity, loaded: LoadedState },
    Shutdown,
}

/// 应用服务：命令循环 + 副作用执行。纯转换在engine里，
/// 这里只做I/O编排。
pub struct App {
    state: AppState,
    mediator: StoreMediator,
    notifier: NotificationManager,
    driver: CountdownDriver,
    tx: mpsc::UnboundedSender<Command>,
    rx: mpsc::UnboundedReceiver<Command>,
    timer_tx: watch::Sender<TimerState>,
}

impl App {
    pub fn new(
        state: AppState,
        mediator: StoreMediator,
        notifier: NotificationManager,
    ) -> (Self, mpsc::UnboundedSender<Command>, watch::Receiver<TimerState>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = watch::channel(state.timer.clone());
        let driver = CountdownDriver::new(tx.clone());
        let app = Self {
            state,
            mediator,
            notifier,
            driver,
            tx: tx.clone(),
            rx,
            timer_tx,
        };
        (app, tx, timer_rx)
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// 运行到Shutdown为止，返回最终状态
    pub async fn run(mut self) -> AppState {
        self.spawn_load();
        while let Some(command) = self.rx.recv().await {
            if matches!(command, Command::Shutdown) {
                break;
            }
            self.handle(command);
        }
        self.driver.cancel();
        self.state
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Intent(intent) => {
                let today = stats::day_key(Local::now().date_naive());
                let effects = engine::apply(&mut self.state, intent, &today);
                self.sync_driver();
                self.run_effects(effects);
            }
            Command::UpdateSettings(patch) => {
                self.state.update_settings(patch);
                self.spawn_save();
            }
            Command::AddTask(text) => {
                if self.state.add_task(&text).is_some() {
                    self.spawn_save();
                } else {
                    tracing::warn!("ignoring task with empty text");
                }
            }
            Command::UpdateTask { id, patch } => {
                if self.state.update_task(id, patch) {
                    self.spawn_save();
                }
            }
            Command::DeleteTask(id) => {
                if self.state.delete_task(id) {
                    self.spawn_save();
                }
            }
            Command::ToggleTask(id) => {
                if self.state.toggle_task(id).is_some() {
                    self.spawn_save();
                }
            }
            Command::LinkTask(id) => {
                if self.state.link_task(id) {
                    self.spawn_save();
                }
            }
            Command::SetTheme(theme) => {
                self.state.set_theme(theme);
                self.spawn_save();
            }
            Command::SetModeColorTheme { mode, theme } => {
                self.state.set_mode_color_theme(mode, theme);
                self.spawn_save();
            }
            Command::IdentityChanged(identity) => {
                if self.mediator.set_identity(identity) {
                    self.spawn_load();
                }
            }
            Command::LoadFinished { identity, loaded } => {
                // 晚到的、属于旧身份的结果直接丢弃
                if &identity != self.mediator.identity() {
                    tracing::debug!("discarding stale load for {identity}");
                    return;
                }
                self.state.apply_loaded(loaded);
            }
            Command::Shutdown => {}
        }
        let _ = self.timer_tx.send(self.state.timer.clone());
    }

    /// 驱动与状态对齐：运行且未暂停才持有tick任务
    fn sync_driver(&mut self) {
        if self.state.timer.is_running && !self.state.timer.is_paused {
            self.driver.ensure_running();
        } else {
            self.driver.cancel();
        }
    }

    fn run_effects(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::PlaySound {
                    sound,
                    volume,
                    repeat_count,
                } => self.notifier.request_sound(sound, volume, repeat_count),
                Effect::NotifyPhaseComplete { completed, next } => {
                    if let Err(e) = self.notifier.send_phase_complete(completed, next) {
                        tracing::warn!("failed to send notification: {e}");
                    }
                }
                Effect::RequestSave => self.spawn_save(),
                Effect::ScheduleAutoStart { delay } => {
                    let tx = self.tx.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = tx.send(Command::Intent(Intent::Start));
                    });
                }
            }
        }
    }

    /// 保存在阻塞线程上进行，计时与交互不等它
    fn spawn_save(&self) {
        let (identity, backend) = self.mediator.backend();
        let record = self.state.snapshot();
        task::spawn_blocking(move || {
            if let Err(e) = backend.save(identity.record_key(), &record) {
                tracing::warn!("failed to save record for {identity}: {e}");
            }
        });
    }

    /// 为当前身份发起加载；结果带身份标签回投命令循环
    fn spawn_load(&self) {
        let (identity, backend) = self.mediator.backend();
        let tx = self.tx.clone();
        task::spawn_blocking(move || {
            let record = match backend.load(identity.record_key()) {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!("failed to load record for {identity}: {e}");
                    None
                }
            };
            let loaded = LoadedState::from_record(record);
            let _ = tx.send(Command::LoadFinished { identity, loaded });
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{LocalStore, RecordStore};
    use std::sync::Arc;

    #[test]
    fn add_task_rejects_whitespace_text() {
        let mut state = AppState::default();
        assert!(state.add_task("   ").is_none());
        assert!(state.add_task("").is_none());
        assert!(state.tasks.is_empty());

        let id = state.add_task("  write tests  ").unwrap().id;
        assert_eq!(state.tasks[0].text, "write tests");
        assert!(!state.tasks[0].completed);
        assert_eq!(state.tasks[0].id, id);
    }

    #[test]
    fn delete_task_clears_matching_link_only() {
        let mut state = AppState::default();
        let a = state.add_task("a").unwrap().id;
        let b = state.add_task("b").unwrap().id;
        assert!(state.link_task(Some(a)));

        assert!(state.delete_task(b));
        assert_eq!(state.timer.linked_task_id, Some(a));

        assert!(state.delete_task(a));
        assert_eq!(state.timer.linked_task_id, None);
        assert!(!state.delete_task(a));
    }

    #[test]
    fn linked_task_resolves_or_null() {
        let mut state = AppState::default();
        let id = state.add_task("a").unwrap().id;
        state.timer.linked_task_id = Some(id);
        assert_eq!(state.linked_task().unwrap().id, id);

        // 绕过delete_task直接移除，读侧仍然安全
        state.tasks.clear();
        assert!(state.linked_task().is_none());
    }

    #[test]
    fn toggle_and_update_task() {
        let mut state = AppState::default();
        let id = state.add_task("a").unwrap().id;
        assert_eq!(state.toggle_task(id), Some(true));
        assert_eq!(state.toggle_task(id), Some(false));
        assert_eq!(state.toggle_task(Uuid::new_v4()), None);

        assert!(state.update_task(
            id,
            TaskPatch {
                text: Some("renamed".to_string()),
                completed: Some(true),
            }
        ));
        assert_eq!(state.tasks[0].text, "renamed");
        assert!(state.tasks[0].completed);

        // 空文本补丁被拒绝
        assert!(!state.update_task(
            id,
            TaskPatch {
                text: Some("   ".to_string()),
                completed: None,
            }
        ));
        assert_eq!(state.tasks[0].text, "renamed");
    }

    #[test]
    fn settings_update_rederives_remaining_while_idle() {
        let mut state = AppState::default();
        state.update_settings(SettingsPatch {
            focus_duration_min: Some(50),
            ..Default::default()
        });
        assert_eq!(state.timer.remaining_seconds, 50 * 60);

        // 运行中不动剩余时间
        state.timer.is_running = true;
        state.timer.remaining_seconds = 123;
        state.update_settings(SettingsPatch {
            focus_duration_min: Some(10),
            ..Default::default()
        });
        assert_eq!(state.timer.remaining_seconds, 123);

        // 暂停中同样保留剩余时间
        state.timer.is_running = false;
        state.timer.is_paused = true;
        state.update_settings(SettingsPatch {
            focus_duration_min: Some(40),
            ..Default::default()
        });
        assert_eq!(state.timer.remaining_seconds, 123);
    }

    #[test]
    fn settings_patch_is_sanitized() {
        let mut state = AppState::default();
        state.update_settings(SettingsPatch {
            focus_duration_min: Some(0),
            sound_volume: Some(3.5),
            sound_repeat_count: Some(9),
            ..Default::default()
        });
        // 零时长被拒，其余钳位
        assert_eq!(state.settings.focus_duration_min, 25);
        assert_eq!(state.settings.sound_volume, 1.0);
        assert_eq!(state.settings.sound_repeat_count, 5);
    }

    #[test]
    fn snapshot_contains_full_state() {
        let mut state = AppState::default();
        state.add_task("a");
        state.set_theme("dark".to_string());
        let record = state.snapshot();
        assert!(record.settings.is_some());
        assert_eq!(record.tasks.as_ref().unwrap().len(), 1);
        assert!(record.statistics.is_some());
        assert_eq!(record.theme.as_deref(), Some("dark"));
        assert!(record.mode_color_themes.is_some());
        assert!(record.updated_at.is_some());
    }

    fn test_app(dir: &tempfile::TempDir) -> (App, mpsc::UnboundedSender<Command>) {
        let local: Arc<dyn RecordStore> =
            Arc::new(LocalStore::open(dir.path().join("local.db")).unwrap());
        let remote: Arc<dyn RecordStore> =
            Arc::new(LocalStore::open(dir.path().join("remote.db")).unwrap());
        let mediator = StoreMediator::new(local, remote, Identity::Anonymous);
        let (app, tx, _timer_rx) =
            App::new(AppState::default(), mediator, NotificationManager::new());
        (app, tx)
    }

    #[tokio::test]
    async fn stale_load_for_old_identity_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let (mut app, _tx) = test_app(&dir);

        let stale = LoadedState {
            theme: "dark".to_string(),
            ..Default::default()
        };
        app.handle(Command::LoadFinished {
            identity: Identity::User("previous".to_string()),
            loaded: stale,
        });
        assert_eq!(app.state().theme, "light");

        // 身份匹配时才应用
        let fresh = LoadedState {
            theme: "dark".to_string(),
            ..Default::default()
        };
        app.handle(Command::LoadFinished {
            identity: Identity::Anonymous,
            loaded: fresh,
        });
        assert_eq!(app.state().theme, "dark");
    }

    #[tokio::test]
    async fn mutating_commands_apply_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let (mut app, _tx) = test_app(&dir);

        app.handle(Command::AddTask("deep work".to_string()));
        assert_eq!(app.state().tasks.len(), 1);
        let id = app.state().tasks[0].id;

        app.handle(Command::LinkTask(Some(id)));
        assert_eq!(app.state().timer.linked_task_id, Some(id));

        app.handle(Command::Intent(Intent::Start));
        assert!(app.state().timer.is_running);
        assert!(app.driver.is_active());

        app.handle(Command::Intent(Intent::Pause));
        assert!(app.state().timer.is_paused);
        assert!(!app.driver.is_active());

        app.handle(Command::DeleteTask(id));
        assert_eq!(app.state().timer.linked_task_id, None);
    }
}

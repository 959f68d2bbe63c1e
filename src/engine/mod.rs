use std::time::Duration;

use crate::app::AppState;
use crate::models::{SoundKind, TimerMode};
use crate::stats;

mod driver;

pub use driver::CountdownDriver;

/// 自动开始前的固定延迟，给外层的模式切换渲染留出时间
pub const AUTO_START_DELAY: Duration = Duration::from_secs(1);

/// 计时器意图。无效请求（如空闲时暂停）一律按无操作处理，
/// 状态机内部没有错误分支。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Start,
    Pause,
    Reset,
    Skip,
    SwitchMode(TimerMode),
    Tick,
}

/// 纯转换产生的副作用请求，由外层执行，状态机不做I/O
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    PlaySound {
        sound: SoundKind,
        volume: f64,
        repeat_count: u32,
    },
    NotifyPhaseComplete {
        completed: TimerMode,
        next: TimerMode,
    },
    RequestSave,
    ScheduleAutoStart {
        delay: Duration,
    },
}

/// 状态机转换入口。`today`是调用方在当下取的本地日期键（YYYY-MM-DD）。
pub fn apply(state: &mut AppState, intent: Intent, today: &str) -> Vec<Effect> {
    match intent {
        Intent::Start => {
            if state.timer.is_running {
                return Vec::new();
            }
            // 耗尽后再次开始：先回满当前模式的时长
            if state.timer.remaining_seconds == 0 {
                state.timer.remaining_seconds = state.settings.duration_secs(state.timer.mode);
            }
            state.timer.is_running = true;
            state.timer.is_paused = false;
            Vec::new()
        }
        Intent::Pause => {
            if !state.timer.is_running {
                return Vec::new();
            }
            state.timer.is_running = false;
            state.timer.is_paused = true;
            Vec::new()
        }
        Intent::Reset => {
            state.timer.remaining_seconds = state.settings.duration_secs(state.timer.mode);
            state.timer.is_running = false;
            state.timer.is_paused = false;
            Vec::new()
        }
        Intent::Skip => {
            // 只在运行中有效；清零后在同一次分发里立即按完成处理
            if !state.timer.is_running {
                return Vec::new();
            }
            state.timer.remaining_seconds = 0;
            complete(state, today)
        }
        Intent::SwitchMode(mode) => {
            if state.timer.is_running {
                return Vec::new();
            }
            state.timer.mode = mode;
            state.timer.remaining_seconds = state.settings.duration_secs(mode);
            state.timer.is_running = false;
            state.timer.is_paused = false;
            Vec::new()
        }
        Intent::Tick => {
            if !state.timer.is_running || state.timer.is_paused {
                return Vec::new();
            }
            state.timer.remaining_seconds = state.timer.remaining_seconds.saturating_sub(1);
            if state.timer.remaining_seconds == 0 {
                complete(state, today)
            } else {
                Vec::new()
            }
        }
    }
}

/// 一个阶段计完：停表、记账、切到下一模式，并产生副作用请求。
/// 每完成第4个专注会话（第4、8、…个）进长休息，其余进短休息；
/// 休息结束一律回到专注。
fn complete(state: &mut AppState, today: &str) -> Vec<Effect> {
    let finished = state.timer.mode;
    state.timer.is_running = false;
    state.timer.is_paused = false;

    let next = match finished {
        TimerMode::Focus => {
            state.timer.completed_focus_sessions += 1;
            stats::record_focus_completion(
                &mut state.statistics,
                state.settings.focus_duration_min,
                today,
            );
            // 关联任务计数；引用已失效则顺手清掉
            if let Some(task_id) = state.timer.linked_task_id {
                match state.tasks.iter_mut().find(|t| t.id == task_id) {
                    Some(task) => task.linked_session_count += 1,
                    None => state.timer.linked_task_id = None,
                }
            }
            if state.timer.completed_focus_sessions % 4 == 0 {
                TimerMode::LongBreak
            } else {
                TimerMode::ShortBreak
            }
        }
        TimerMode::ShortBreak | TimerMode::LongBreak => TimerMode::Focus,
    };

    state.timer.mode = next;
    state.timer.remaining_seconds = state.settings.duration_secs(next);

    let mut effects = Vec::new();
    if state.settings.sound_enabled {
        effects.push(Effect::PlaySound {
            sound: state.settings.selected_sound,
            volume: state.settings.sound_volume,
            repeat_count: state.settings.sound_repeat_count,
        });
    }
    if state.settings.notifications_enabled {
        effects.push(Effect::NotifyPhaseComplete {
            completed: finished,
            next,
        });
    }
    effects.push(Effect::RequestSave);

    let auto_start = match next {
        TimerMode::Focus => state.settings.auto_start_focus,
        TimerMode::ShortBreak | TimerMode::LongBreak => state.settings.auto_start_breaks,
    };
    if auto_start {
        effects.push(Effect::ScheduleAutoStart {
            delay: AUTO_START_DELAY,
        });
    }

    effects
}

use anyhow::Result;
use notify_rust::{Notification, Timeout};

use crate::models::{SoundKind, TimerMode};

/// 通知管理器。引擎只发请求，投递在这里完成，核心不等待结果。
pub struct NotificationManager;

impl NotificationManager {
    pub fn new() -> Self {
        Self
    }

    /// 阶段完成通知
    pub fn send_phase_complete(&self, completed: TimerMode, next: TimerMode) -> Result<()> {
        let (summary, body) = match completed {
            TimerMode::Focus => ("专注完成", "干得好！休息一下吧。"),
            TimerMode::ShortBreak | TimerMode::LongBreak => ("休息结束", "准备开始下一段专注吧！"),
        };

        Notification::new()
            .summary(&format!("🍅 {}", summary))
            .body(&format!("{} (next: {})", body, next))
            .icon("emblem-default")
            .timeout(Timeout::Milliseconds(5000))
            .show()?;
        Ok(())
    }

    /// 提示音请求。音频解码播放不在本程序范围内，
    /// 这里响一声终端铃并把参数写进日志。
    pub fn request_sound(&self, sound: SoundKind, volume: f64, repeat_count: u32) {
        print!("\x07");
        tracing::info!(
            sound = sound.token(),
            volume,
            repeat_count,
            "sound requested"
        );
    }
}

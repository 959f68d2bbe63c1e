use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use crate::app::Command;
use crate::engine::Intent;

/// 倒计时驱动：运行期间以1秒节拍向命令循环发Tick。
/// 句柄归驱动所有，重新调度前必须先取消旧任务，保证同一时刻
/// 最多只有一个tick任务在飞。
pub struct CountdownDriver {
    tx: UnboundedSender<Command>,
    ticker: Option<JoinHandle<()>>,
    period: Duration,
}

impl CountdownDriver {
    pub fn new(tx: UnboundedSender<Command>) -> Self {
        Self {
            tx,
            ticker: None,
            period: Duration::from_secs(1),
        }
    }

    /// 已有活跃任务则保持节拍不变，否则取消残留句柄后新开一个
    pub fn ensure_running(&mut self) {
        if self.is_active() {
            return;
        }
        self.cancel();

        let tx = self.tx.clone();
        let period = self.period;
        self.ticker = Some(tokio::spawn(async move {
            let mut interval = time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // interval的第一个tick立即返回，跳过它
            interval.tick().await;
            loop {
                interval.tick().await;
                if tx.send(Command::Intent(Intent::Tick)).is_err() {
                    break;
                }
            }
        }));
    }

    pub fn cancel(&mut self) {
        if let Some(handle) = self.ticker.take() {
            handle.abort();
        }
    }

    pub fn is_active(&self) -> bool {
        self.ticker.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for CountdownDriver {
    fn drop(&mut self) {
        self.cancel();
    }
}

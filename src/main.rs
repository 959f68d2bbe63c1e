use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

mod app;
mod config;
mod engine;
mod models;
mod notify;
mod stats;
mod store;

use app::{App, AppState, Command};
use config::AppConfig;
use engine::Intent;
use models::{Identity, SettingsPatch, Task, TimerMode};
use notify::NotificationManager;
use store::{LocalStore, RecordStore, RemoteStore, StoreMediator};

#[derive(Parser)]
#[command(name = "focus")]
#[command(about = "Terminal focus timer with tasks and statistics", long_about = None)]
struct Cli {
    /// Local database path (defaults to user data directory)
    #[arg(short, long)]
    db_path: Option<PathBuf>,

    /// Daemon socket name (defaults to config or focusd.sock)
    #[arg(long)]
    socket: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the interactive timer session
    Run,

    /// Add a new task
    Add {
        /// Task text
        text: String,
    },

    /// List all tasks
    List,

    /// Toggle a task's completed flag
    Toggle {
        /// Task ID (full UUID or unique prefix)
        id: String,
    },

    /// Edit a task's text
    Edit {
        /// Task ID (full UUID or unique prefix)
        id: String,
        /// New text
        text: String,
    },

    /// Delete a task
    Rm {
        /// Task ID (full UUID or unique prefix)
        id: String,
    },

    /// Update timer settings
    Set {
        /// Focus duration in minutes
        #[arg(long)]
        focus: Option<u32>,
        /// Short break duration in minutes
        #[arg(long)]
        short_break: Option<u32>,
        /// Long break duration in minutes
        #[arg(long)]
        long_break: Option<u32>,
        /// Auto-start breaks after a focus session
        #[arg(long)]
        auto_start_breaks: Option<bool>,
        /// Auto-start focus after a break
        #[arg(long)]
        auto_start_focus: Option<bool>,
        /// Enable completion sound
        #[arg(long)]
        sound: Option<bool>,
        /// Completion sound (bell, chime, ping, alert, digital)
        #[arg(long)]
        sound_name: Option<String>,
        /// Sound volume, 0.0 to 1.0
        #[arg(long)]
        volume: Option<f64>,
        /// Sound repeat count, 1 to 5
        #[arg(long)]
        repeat: Option<u32>,
        /// Enable desktop notifications
        #[arg(long)]
        notifications: Option<bool>,
    },

    /// Show statistics for the past 7 days
    Stats,

    /// Show or set the UI theme
    Theme {
        /// Theme name (omit to show current)
        name: Option<String>,
        /// Set the color theme of one timer mode instead (focus, short, long)
        #[arg(long)]
        mode: Option<String>,
    },

    /// Log in as a user (switches to the daemon backend)
    Login {
        /// User name
        user: String,
    },

    /// Log out (switches back to the local database)
    Logout,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = AppConfig::load()?;
    if let Some(socket) = cli.socket {
        config.socket = Some(socket);
    }

    match cli.command {
        Some(Commands::Run) | None => {
            let mediator = open_mediator(cli.db_path, &config)?;
            run_interactive(mediator).await?;
        }
        Some(Commands::Add { text }) => {
            with_loaded_state(cli.db_path, &config, |state| {
                match state.add_task(&text) {
                    Some(task) => {
                        println!("✅ Task added: [{}] {}", short_id(task.id), task.text);
                        true
                    }
                    None => {
                        println!("❌ Task text must not be empty");
                        false
                    }
                }
            })?;
        }
        Some(Commands::List) => {
            with_loaded_state(cli.db_path, &config, |state| {
                if state.tasks.is_empty() {
                    println!("No tasks found.");
                } else {
                    for task in &state.tasks {
                        let status_icon = if task.completed { "✅" } else { "⭕" };
                        let sessions = if task.linked_session_count > 0 {
                            format!("  🍅 x{}", task.linked_session_count)
                        } else {
                            String::new()
                        };
                        println!(
                            "[{}] {} {}{}",
                            short_id(task.id),
                            status_icon,
                            task.text,
                            sessions
                        );
                    }
                }
                false
            })?;
        }
        Some(Commands::Toggle { id }) => {
            with_loaded_state(cli.db_path, &config, |state| {
                let Some(id) = resolve_task_id(&state.tasks, &id) else {
                    println!("❌ No task matches '{}'", id);
                    return false;
                };
                match state.toggle_task(id) {
                    Some(true) => println!("✅ Task {} completed", short_id(id)),
                    Some(false) => println!("⭕ Task {} reopened", short_id(id)),
                    None => return false,
                }
                true
            })?;
        }
        Some(Commands::Edit { id, text }) => {
            with_loaded_state(cli.db_path, &config, |state| {
                let Some(id) = resolve_task_id(&state.tasks, &id) else {
                    println!("❌ No task matches '{}'", id);
                    return false;
                };
                let patch = models::TaskPatch {
                    text: Some(text.clone()),
                    completed: None,
                };
                if state.update_task(id, patch) {
                    println!("✅ Task {} updated", short_id(id));
                    true
                } else {
                    println!("❌ Task text must not be empty");
                    false
                }
            })?;
        }
        Some(Commands::Rm { id }) => {
            with_loaded_state(cli.db_path, &config, |state| {
                let Some(id) = resolve_task_id(&state.tasks, &id) else {
                    println!("❌ No task matches '{}'", id);
                    return false;
                };
                state.delete_task(id);
                println!("✅ Task {} deleted", short_id(id));
                true
            })?;
        }
        Some(Commands::Set {
            focus,
            short_break,
            long_break,
            auto_start_breaks,
            auto_start_focus,
            sound,
            sound_name,
            volume,
            repeat,
            notifications,
        }) => {
            let patch = SettingsPatch {
                focus_duration_min: focus,
                short_break_duration_min: short_break,
                long_break_duration_min: long_break,
                auto_start_breaks,
                auto_start_focus,
                sound_enabled: sound,
                selected_sound: sound_name.as_deref().map(models::SoundKind::from_token),
                sound_volume: volume,
                sound_repeat_count: repeat,
                notifications_enabled: notifications,
            };
            with_loaded_state(cli.db_path, &config, |state| {
                state.update_settings(patch.clone());
                print_settings(state);
                true
            })?;
        }
        Some(Commands::Stats) => {
            with_loaded_state(cli.db_path, &config, |state| {
                let today = chrono::Local::now().date_naive();
                let report = stats::weekly_report(&state.statistics, today);
                println!("📊 Past 7 days");
                for (day, bucket) in &report.days {
                    let bar = "█".repeat(bucket.sessions as usize);
                    println!(
                        "  {}  {:>2} sessions  {:>4} min  {}",
                        day, bucket.sessions, bucket.focus_minutes, bar
                    );
                }
                println!(
                    "  week: {} sessions, {} focus minutes",
                    report.sessions, report.focus_minutes
                );
                println!(
                    "  all time: {} sessions, {} focus minutes",
                    state.statistics.total_sessions, state.statistics.total_focus_minutes
                );
                false
            })?;
        }
        Some(Commands::Theme { name, mode }) => match (name, mode) {
            (Some(name), Some(mode)) => {
                let Some(mode) = parse_mode(&mode) else {
                    bail!("unknown mode '{mode}' (expected focus, short or long)");
                };
                with_loaded_state(cli.db_path, &config, |state| {
                    state.set_mode_color_theme(mode, name.clone());
                    println!("✅ {} color theme set to {}", mode, name);
                    true
                })?;
            }
            (Some(name), None) => {
                with_loaded_state(cli.db_path, &config, |state| {
                    state.set_theme(name.clone());
                    println!("✅ Theme set to {}", name);
                    true
                })?;
            }
            (None, _) => {
                with_loaded_state(cli.db_path, &config, |state| {
                    println!("Theme: {}", state.theme);
                    for (mode, color) in &state.mode_color_themes {
                        println!("  {}: {}", mode, color);
                    }
                    false
                })?;
            }
        },
        Some(Commands::Login { user }) => {
            let user = user.trim().to_string();
            if user.is_empty() {
                bail!("user name must not be empty");
            }
            config.user = Some(user.clone());
            config.save()?;
            println!("✅ Logged in as {} (records now go through focusd)", user);
        }
        Some(Commands::Logout) => {
            config.user = None;
            config.save()?;
            println!("✅ Logged out (records now stay in the local database)");
        }
    }

    Ok(())
}

// ==================== 单次命令 ====================

fn open_mediator(cli_db: Option<PathBuf>, config: &AppConfig) -> Result<StoreMediator> {
    let db_path = config.local_db_path(cli_db)?;
    let local: Arc<dyn RecordStore> = Arc::new(LocalStore::open(db_path)?);
    let remote: Arc<dyn RecordStore> = Arc::new(RemoteStore::new(config.socket_name()));
    Ok(StoreMediator::new(local, remote, config.identity()))
}

/// 单次命令的读改写循环：加载当前身份的记录，跑一个闭包，
/// 闭包返回true时写回完整快照。
fn with_loaded_state<F>(cli_db: Option<PathBuf>, config: &AppConfig, f: F) -> Result<()>
where
    F: FnOnce(&mut AppState) -> bool,
{
    let mediator = open_mediator(cli_db, config)?;
    let (_, loaded) = mediator.load_blocking();
    let mut state = AppState::from_loaded(loaded);
    if f(&mut state) {
        mediator.save_blocking(&state.snapshot());
    }
    Ok(())
}

/// UUID全文或唯一前缀解析
fn resolve_task_id(tasks: &[Task], needle: &str) -> Option<Uuid> {
    if let Ok(id) = Uuid::parse_str(needle) {
        return tasks.iter().find(|t| t.id == id).map(|t| t.id);
    }
    let mut matches = tasks
        .iter()
        .filter(|t| t.id.to_string().starts_with(needle));
    let first = matches.next()?;
    if matches.next().is_some() {
        return None;
    }
    Some(first.id)
}

fn short_id(id: Uuid) -> String {
    id.to_string()[..8].to_string()
}

fn print_settings(state: &AppState) {
    let s = &state.settings;
    println!("⚙️  Settings");
    println!(
        "  durations: focus {}m / short break {}m / long break {}m",
        s.focus_duration_min, s.short_break_duration_min, s.long_break_duration_min
    );
    println!(
        "  auto-start: breaks {} / focus {}",
        s.auto_start_breaks, s.auto_start_focus
    );
    println!(
        "  sound: {} ({}, volume {:.1}, x{})",
        s.sound_enabled,
        s.selected_sound.token(),
        s.sound_volume,
        s.sound_repeat_count
    );
    println!("  notifications: {}", s.notifications_enabled);
}

// ==================== 交互式会话 ====================

fn parse_mode(token: &str) -> Option<TimerMode> {
    match token {
        "focus" | "f" => Some(TimerMode::Focus),
        "short" | "sb" => Some(TimerMode::ShortBreak),
        "long" | "lb" => Some(TimerMode::LongBreak),
        _ => None,
    }
}

/// REPL行到命令的翻译。None表示无法识别。
fn parse_repl(line: &str) -> Option<Command> {
    let mut parts = line.trim().split_whitespace();
    let command = match parts.next()? {
        "start" | "s" => Command::Intent(Intent::Start),
        "pause" | "p" => Command::Intent(Intent::Pause),
        "reset" | "r" => Command::Intent(Intent::Reset),
        "skip" | "k" => Command::Intent(Intent::Skip),
        "mode" | "m" => Command::Intent(Intent::SwitchMode(parse_mode(parts.next()?)?)),
        "add" | "a" => {
            let text = parts.collect::<Vec<_>>().join(" ");
            Command::AddTask(text)
        }
        "link" | "l" => Command::LinkTask(Some(Uuid::parse_str(parts.next()?).ok()?)),
        "unlink" | "u" => Command::LinkTask(None),
        "login" => Command::IdentityChanged(Identity::User(parts.next()?.to_string())),
        "logout" => Command::IdentityChanged(Identity::Anonymous),
        "quit" | "q" | "exit" => Command::Shutdown,
        _ => return None,
    };
    Some(command)
}

async fn run_interactive(mediator: StoreMediator) -> Result<()> {
    let (app, tx, mut timer_rx) = App::new(
        AppState::default(),
        mediator,
        NotificationManager::new(),
    );
    let app_task = tokio::spawn(app.run());

    // 计时行单独渲染，命令行回车自然覆盖它
    let render = tokio::spawn(async move {
        while timer_rx.changed().await.is_ok() {
            let timer = timer_rx.borrow().clone();
            let icon = if timer.is_paused {
                "⏸"
            } else if timer.is_running {
                "▶"
            } else {
                "⏹"
            };
            print!(
                "\r{} {} {}  (focus sessions: {})   ",
                icon,
                timer.mode,
                timer.format_remaining(),
                timer.completed_focus_sessions
            );
            let _ = std::io::stdout().flush();
        }
    });

    println!("🍅 focus — start/pause/reset/skip, mode <focus|short|long>, add <text>,");
    println!("   link <uuid>, unlink, login <user>, logout, quit");

    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                let _ = tx.send(Command::Shutdown);
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line? else {
                    let _ = tx.send(Command::Shutdown);
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                match parse_repl(&line) {
                    Some(Command::Shutdown) => {
                        let _ = tx.send(Command::Shutdown);
                        break;
                    }
                    Some(command) => {
                        let _ = tx.send(command);
                    }
                    None => println!("❌ Unknown command: {}", line.trim()),
                }
            }
        }
    }

    render.abort();
    let state = app_task.await?;
    println!(
        "\n👋 Session over: {} focus sessions completed",
        state.timer.completed_focus_sessions
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repl_parses_timer_commands() {
        assert!(matches!(
            parse_repl("start"),
            Some(Command::Intent(Intent::Start))
        ));
        assert!(matches!(
            parse_repl("  mode long  "),
            Some(Command::Intent(Intent::SwitchMode(TimerMode::LongBreak)))
        ));
        assert!(matches!(parse_repl("quit"), Some(Command::Shutdown)));
        assert!(parse_repl("mode sideways").is_none());
        assert!(parse_repl("frobnicate").is_none());
    }

    #[test]
    fn repl_parses_task_commands() {
        match parse_repl("add deep work block") {
            Some(Command::AddTask(text)) => assert_eq!(text, "deep work block"),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(matches!(
            parse_repl("unlink"),
            Some(Command::LinkTask(None))
        ));
        assert!(matches!(
            parse_repl("logout"),
            Some(Command::IdentityChanged(Identity::Anonymous))
        ));
    }

    #[test]
    fn task_id_prefix_resolution() {
        let tasks = vec![Task::new("a".to_string()), Task::new("b".to_string())];
        let full = tasks[0].id.to_string();
        assert_eq!(resolve_task_id(&tasks, &full), Some(tasks[0].id));
        assert_eq!(resolve_task_id(&tasks, &full[..8]), Some(tasks[0].id));
        assert_eq!(resolve_task_id(&tasks, "zzzz"), None);
        // 空前缀匹配所有任务，不唯一
        assert_eq!(resolve_task_id(&tasks, ""), None);
    }
}

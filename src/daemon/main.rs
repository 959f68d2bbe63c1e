use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use directories::ProjectDirs;
use interprocess::local_socket::{prelude::*, GenericNamespaced, ListenerOptions, Stream};
use tracing_subscriber::EnvFilter;

// 引用主crate的模块（通过路径）
#[path = "../models/mod.rs"]
mod models;
#[path = "../store/mod.rs"]
mod store;

use store::{merge_record, LocalStore, StoreResult, WireRequest, WireResponse};

/// 记录守护进程：为已登录身份保管持久化记录。
/// 行协议见store模块；保存走记录级合并，顶层字段覆盖。
pub struct Daemon {
    store: Arc<LocalStore>,
    socket: String,
}

impl Daemon {
    pub fn new(db_path: PathBuf, socket: String) -> Result<Self> {
        let store = LocalStore::open(&db_path)
            .with_context(|| format!("failed to open record database at {}", db_path.display()))?;
        Ok(Self {
            store: Arc::new(store),
            socket,
        })
    }

    /// 接受循环。每个连接一个线程，存储句柄共享。
    pub fn run(&self) -> Result<()> {
        let name = self
            .socket
            .as_str()
            .to_ns_name::<GenericNamespaced>()
            .with_context(|| format!("invalid socket name {}", self.socket))?;
        let listener = ListenerOptions::new()
            .name(name)
            .create_sync()
            .with_context(|| format!("failed to bind socket {}", self.socket))?;

        tracing::info!("focusd listening on {}", self.socket);

        for conn in listener.incoming() {
            let conn = match conn {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::warn!("failed to accept connection: {e}");
                    continue;
                }
            };
            let store = Arc::clone(&self.store);
            std::thread::spawn(move || {
                if let Err(e) = handle_connection(conn, &store) {
                    tracing::warn!("connection closed with error: {e}");
                }
            });
        }
        Ok(())
    }
}

/// 每行一条请求，回一行响应。格式错误回Error帧但不断开。
fn handle_connection(conn: Stream, store: &LocalStore) -> Result<()> {
    let mut reader = BufReader::new(conn);
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Ok(());
        }
        let response = match serde_json::from_str::<WireRequest>(&line) {
            Ok(request) => handle_request(request, store),
            Err(e) => WireResponse::Error {
                message: format!("malformed request: {e}"),
            },
        };
        let conn = reader.get_mut();
        serde_json::to_writer(&mut *conn, &response)?;
        conn.write_all(b"\n")?;
        conn.flush()?;
    }
}

fn handle_request(request: WireRequest, store: &LocalStore) -> WireResponse {
    let result: StoreResult<WireResponse> = (|| match request {
        WireRequest::Load { key } => {
            tracing::debug!("load {key}");
            match store.load_raw(&key)? {
                Some(record) => Ok(WireResponse::Found { record }),
                None => Ok(WireResponse::Missing),
            }
        }
        WireRequest::Save { key, record } => {
            tracing::debug!("save {key}");
            let merged = merge_record(store.load_raw(&key)?, record);
            store.save_raw(&key, &merged)?;
            Ok(WireResponse::Saved)
        }
    })();
    result.unwrap_or_else(|e| WireResponse::Error {
        message: e.to_string(),
    })
}

#[derive(Parser)]
#[command(name = "focusd")]
#[command(about = "Focus timer record daemon", long_about = None)]
struct Cli {
    /// Record database path (defaults to user data directory)
    #[arg(short, long)]
    db_path: Option<PathBuf>,

    /// Socket name to listen on
    #[arg(long, default_value = "focusd.sock")]
    socket: String,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let db_path = match cli.db_path {
        Some(path) => path,
        None => {
            let proj_dirs = ProjectDirs::from("com", "focus-cycle", "focus")
                .context("failed to resolve project directories")?;
            let data_dir = proj_dirs.data_dir();
            std::fs::create_dir_all(data_dir)
                .with_context(|| format!("failed to create {}", data_dir.display()))?;
            data_dir.join("focusd.db")
        }
    };

    let daemon = Daemon::new(db_path, cli.socket)?;
    tokio::task::spawn_blocking(move || daemon.run()).await??;
    Ok(())
}

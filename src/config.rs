use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use crate::models::Identity;

const DEFAULT_SOCKET: &str = "focusd.sock";

/// 应用配置（config.toml）。身份由login/logout写入，
/// CLI参数可以覆盖这里的路径。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// 已登录的用户ID；缺省为匿名
    pub user: Option<String>,
    /// focusd 的本地socket名
    pub socket: Option<String>,
    /// 本地数据库路径覆盖
    pub db_path: Option<PathBuf>,
}

fn project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from("com", "focus-cycle", "focus")
        .context("Failed to get project directories")
}

impl AppConfig {
    pub fn config_path() -> Result<PathBuf> {
        Ok(project_dirs()?.config_dir().join("config.toml"))
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("Invalid config: {}", path.display()))
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, toml::to_string_pretty(self)?)
            .with_context(|| format!("Failed to write config: {}", path.display()))
    }

    pub fn identity(&self) -> Identity {
        match &self.user {
            Some(user) if !user.trim().is_empty() => Identity::User(user.clone()),
            _ => Identity::Anonymous,
        }
    }

    pub fn socket_name(&self) -> String {
        self.socket
            .clone()
            .unwrap_or_else(|| DEFAULT_SOCKET.to_string())
    }

    /// 本地数据库路径，缺省放在用户数据目录
    pub fn local_db_path(&self, cli_override: Option<PathBuf>) -> Result<PathBuf> {
        if let Some(path) = cli_override.or_else(|| self.db_path.clone()) {
            return Ok(path);
        }
        let dirs = project_dirs()?;
        let data_dir = dirs.data_dir();
        fs::create_dir_all(data_dir).context("Failed to create data directory")?;
        Ok(data_dir.join("focus.db"))
    }
}

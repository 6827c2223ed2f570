use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// 1 本のリレー内で完結するエラー。リスナーやマネージャーには伝播しない
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Could not resolve destination '{host}': {reason}")]
    Resolution { host: String, reason: String },

    #[error("Connection to destination {0} refused")]
    ConnectionRefused(String),

    #[error("Timed out connecting to destination {0}")]
    ConnectTimeout(String),

    #[error("Connection reset by peer")]
    ConnectionReset,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl RelayError {
    /// ダイヤル時の io::Error を分類
    pub(crate) fn from_dial(target: &str, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => RelayError::ConnectionRefused(target.to_string()),
            io::ErrorKind::TimedOut => RelayError::ConnectTimeout(target.to_string()),
            _ => RelayError::Io(err),
        }
    }
}

/// 1 本のトンネルの起動を妨げるエラー
#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
}

/// 設定ファイル全体、またはセクション単位のエラー
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{} not found. Please create it with tunnel configurations.", .0.display())]
    NotFound(PathBuf),

    #[error("Failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to parse {}: {message}", .path.display())]
    Parse { path: PathBuf, message: String },

    #[error("Missing configuration option '{field}' in section [{section}]")]
    MissingField { section: String, field: String },

    #[error("Invalid value '{value}' for option '{field}' in section [{section}]: {reason}")]
    InvalidValue {
        section: String,
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to open log file {} for section [{section}]: {source}", .path.display())]
    LogSink {
        section: String,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ConfigError {
    /// ファイル全体が使えない (起動を中止すべき) エラーか
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ConfigError::NotFound(_) | ConfigError::Read { .. } | ConfigError::Parse { .. }
        )
    }
}

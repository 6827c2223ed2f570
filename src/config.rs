use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ini::{Ini, ParseOption};
use tracing::level_filters::LevelFilter;

use crate::error::ConfigError;
use crate::logging::{parse_level, TunnelLogger};
use crate::relay::{RelayOptions, DEFAULT_CHUNK_SIZE, DEFAULT_CONNECT_TIMEOUT, MAX_CHUNK_SIZE};
use crate::tunnel::TunnelSpec;

/// 全セクションに継承される既定値のセクション名
const DEFAULT_SECTION: &str = "DEFAULT";

type Values = HashMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Ini,
    Toml,
}

impl ConfigFormat {
    /// 拡張子が `.toml` なら TOML、それ以外は INI
    pub fn from_path(path: &Path) -> Self {
        match path.extension() {
            Some(ext) if ext.eq_ignore_ascii_case("toml") => ConfigFormat::Toml,
            _ => ConfigFormat::Ini,
        }
    }
}

/// 1 セクション分の検証済み設定
#[derive(Debug, Clone, PartialEq)]
pub struct TunnelConfig {
    pub name: String,
    pub listen_ip: String,
    pub listen_port: u16,
    pub forward_ip: String,
    pub forward_port: u16,
    pub log_file: PathBuf,
    pub log_level: LevelFilter,
    pub log_payload: bool,
    pub buffer_size: usize,
    pub connect_timeout: Duration,
    pub tcp_nodelay: bool,
    pub tcp_keepalive: Option<Duration>,
}

impl TunnelConfig {
    pub fn relay_options(&self) -> RelayOptions {
        RelayOptions {
            chunk_size: self.buffer_size,
            log_payload: self.log_payload,
            connect_timeout: self.connect_timeout,
            nodelay: self.tcp_nodelay,
            keepalive: self.tcp_keepalive,
        }
    }

    /// ログシンクを開き、リスナーに渡せる `TunnelSpec` にする
    pub fn into_spec(self) -> Result<TunnelSpec, ConfigError> {
        let logger = TunnelLogger::open_file(&self.name, &self.log_file, self.log_level)
            .map_err(|source| ConfigError::LogSink {
                section: self.name.clone(),
                path: self.log_file.clone(),
                source,
            })?;
        let options = self.relay_options();
        Ok(TunnelSpec::new(
            self.name,
            self.listen_ip,
            self.listen_port,
            self.forward_ip,
            self.forward_port,
            logger,
        )
        .with_options(options))
    }
}

/// 宣言順のセクション。エラーはセクション単位で保持する
#[derive(Debug)]
pub struct Section {
    pub name: String,
    pub tunnel: Result<TunnelConfig, ConfigError>,
}

#[derive(Debug, Default)]
pub struct GatewayConfig {
    pub sections: Vec<Section>,
}

impl GatewayConfig {
    /// 設定ファイルを読む。ファイル自体が無い・壊れている場合のみ Err
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => ConfigError::NotFound(path.to_path_buf()),
            _ => ConfigError::Read {
                path: path.to_path_buf(),
                source: e,
            },
        })?;
        Self::parse(&text, ConfigFormat::from_path(path), path)
    }

    pub fn parse(text: &str, format: ConfigFormat, origin: &Path) -> Result<Self, ConfigError> {
        let raw = match format {
            ConfigFormat::Ini => parse_ini(text),
            ConfigFormat::Toml => parse_toml(text),
        }
        .map_err(|message| ConfigError::Parse {
            path: origin.to_path_buf(),
            message,
        })?;
        Ok(raw.resolve())
    }

    /// 検証を通ったトンネル設定
    pub fn tunnels(&self) -> impl Iterator<Item = &TunnelConfig> {
        self.sections.iter().filter_map(|s| s.tunnel.as_ref().ok())
    }
}

#[derive(Default)]
struct RawConfig {
    defaults: Values,
    sections: Vec<(String, Values)>,
}

impl RawConfig {
    fn resolve(self) -> GatewayConfig {
        let defaults = self.defaults;
        let sections = self
            .sections
            .into_iter()
            .map(|(name, values)| {
                let tunnel = SectionReader {
                    name: &name,
                    values: &values,
                    defaults: &defaults,
                }
                .read();
                Section { name, tunnel }
            })
            .collect();
        GatewayConfig { sections }
    }
}

fn parse_ini(text: &str) -> Result<RawConfig, String> {
    // エスケープ処理を切らないと Windows のパスが壊れる
    let option = ParseOption {
        enabled_escape: false,
        ..ParseOption::default()
    };
    let ini = Ini::load_from_str_opt(text, option).map_err(|e| e.to_string())?;

    let mut raw = RawConfig::default();
    for (section, props) in ini.iter() {
        let values: Values = props
            .iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v.to_string()))
            .collect();
        match section {
            None => raw.defaults.extend(values),
            Some(name) if name == DEFAULT_SECTION => raw.defaults.extend(values),
            Some(name) => raw.sections.push((name.to_string(), values)),
        }
    }
    Ok(raw)
}

fn parse_toml(text: &str) -> Result<RawConfig, String> {
    let root: toml::Value = toml::from_str(text).map_err(|e| e.to_string())?;
    let table = match root {
        toml::Value::Table(table) => table,
        _ => return Err("expected a table at the top level".to_string()),
    };

    let mut raw = RawConfig::default();
    for (key, value) in table {
        match value {
            toml::Value::Table(section) => {
                let values: Values = section
                    .into_iter()
                    .map(|(k, v)| (k.to_ascii_lowercase(), toml_scalar(v)))
                    .collect();
                if key == DEFAULT_SECTION {
                    raw.defaults.extend(values);
                } else {
                    raw.sections.push((key, values));
                }
            }
            scalar => {
                raw.defaults.insert(key.to_ascii_lowercase(), toml_scalar(scalar));
            }
        }
    }
    Ok(raw)
}

/// INI と同じく文字列として扱う
fn toml_scalar(value: toml::Value) -> String {
    match value {
        toml::Value::String(s) => s,
        other => other.to_string(),
    }
}

struct SectionReader<'a> {
    name: &'a str,
    values: &'a Values,
    defaults: &'a Values,
}

impl<'a> SectionReader<'a> {
    fn read(&self) -> Result<TunnelConfig, ConfigError> {
        let listen_ip = self.required("listen_ip")?.to_string();
        let listen_port = self.port("listen_port")?;
        let forward_ip = self.required("forward_ip")?.to_string();
        let forward_port = self.port("forward_port")?;
        let log_file = PathBuf::from(self.required("log_file")?);

        let log_level = match self.get("log_level") {
            None => LevelFilter::INFO,
            Some(value) => parse_level(value)
                .ok_or_else(|| self.invalid("log_level", value, "unknown log level"))?,
        };
        let buffer_size = match self.number("buffer_size")? {
            None => DEFAULT_CHUNK_SIZE,
            Some(0) => return Err(self.invalid("buffer_size", "0", "must be greater than 0")),
            Some(n) if n > MAX_CHUNK_SIZE as u64 => {
                return Err(self.invalid(
                    "buffer_size",
                    &n.to_string(),
                    &format!("must not exceed {} bytes", MAX_CHUNK_SIZE),
                ))
            }
            Some(n) => n as usize,
        };
        let connect_timeout = match self.number("connect_timeout")? {
            None => DEFAULT_CONNECT_TIMEOUT,
            Some(0) => {
                return Err(self.invalid("connect_timeout", "0", "must be greater than 0"))
            }
            Some(secs) => Duration::from_secs(secs),
        };
        let tcp_keepalive = match self.number("tcp_keepalive")? {
            None | Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
        };

        Ok(TunnelConfig {
            name: self.name.to_string(),
            listen_ip,
            listen_port,
            forward_ip,
            forward_port,
            log_file,
            log_level,
            log_payload: self.flag("log_payload", false)?,
            buffer_size,
            connect_timeout,
            tcp_nodelay: self.flag("tcp_nodelay", true)?,
            tcp_keepalive,
        })
    }

    fn get(&self, field: &str) -> Option<&'a str> {
        self.values
            .get(field)
            .or_else(|| self.defaults.get(field))
            .map(|v| v.trim())
    }

    fn required(&self, field: &str) -> Result<&'a str, ConfigError> {
        match self.get(field) {
            None => Err(ConfigError::MissingField {
                section: self.name.to_string(),
                field: field.to_string(),
            }),
            Some("") => Err(self.invalid(field, "", "must not be empty")),
            Some(value) => Ok(value),
        }
    }

    fn port(&self, field: &str) -> Result<u16, ConfigError> {
        let value = self.required(field)?;
        let port: i64 = value
            .parse()
            .map_err(|_| self.invalid(field, value, "not an integer"))?;
        if !(1..=65535).contains(&port) {
            return Err(self.invalid(field, value, "port must be between 1 and 65535"));
        }
        Ok(port as u16)
    }

    fn number(&self, field: &str) -> Result<Option<u64>, ConfigError> {
        self.get(field)
            .map(|value| {
                value
                    .parse()
                    .map_err(|_| self.invalid(field, value, "not a non-negative integer"))
            })
            .transpose()
    }

    /// configparser と同じ真偽値の表記を受け付ける
    fn flag(&self, field: &str, default: bool) -> Result<bool, ConfigError> {
        let value = match self.get(field) {
            None => return Ok(default),
            Some(value) => value,
        };
        match value.to_ascii_lowercase().as_str() {
            "1" | "yes" | "true" | "on" => Ok(true),
            "0" | "no" | "false" | "off" => Ok(false),
            _ => Err(self.invalid(field, value, "not a boolean")),
        }
    }

    fn invalid(&self, field: &str, value: &str, reason: &str) -> ConfigError {
        ConfigError::InvalidValue {
            section: self.name.to_string(),
            field: field.to_string(),
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}

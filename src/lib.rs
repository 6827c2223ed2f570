// 設定されたトンネルごとにローカルで待ち受け、
// 受け付けた接続を固定の転送先へそのまま中継する TCP ゲートウェイ

pub mod config;
pub mod error;
pub mod listener;
pub mod logging;
pub mod manager;
pub mod relay;
pub mod tunnel;

// パブリックAPI
pub use config::{ConfigFormat, GatewayConfig, Section, TunnelConfig};
pub use error::{ConfigError, RelayError, TunnelError};
pub use listener::{Listener, ListenerHandle, ServeReport};
pub use logging::TunnelLogger;
pub use manager::{RunStatus, RunningTunnels, TunnelManager, DEFAULT_GRACE_PERIOD};
pub use relay::{Direction, Relay, RelayEnd, RelayOptions, RelayOutcome, RelayState};
pub use tunnel::TunnelSpec;

use crate::logging::TunnelLogger;
use crate::relay::RelayOptions;

/// 1 本のトンネルの不変な記述子
///
/// リスナーの構築時に値として渡され、以後は `Arc` 越しに読み取り専用で
/// 各リレーと共有される。
#[derive(Clone, Debug)]
pub struct TunnelSpec {
    /// セクション名
    pub name: String,
    pub listen_ip: String,
    /// 0 を指定するとエフェメラルポートにバインドする
    pub listen_port: u16,
    pub forward_ip: String,
    pub forward_port: u16,
    pub logger: TunnelLogger,
    pub options: RelayOptions,
}

impl TunnelSpec {
    pub fn new(
        name: impl Into<String>,
        listen_ip: impl Into<String>,
        listen_port: u16,
        forward_ip: impl Into<String>,
        forward_port: u16,
        logger: TunnelLogger,
    ) -> Self {
        Self {
            name: name.into(),
            listen_ip: listen_ip.into(),
            listen_port,
            forward_ip: forward_ip.into(),
            forward_port,
            logger,
            options: RelayOptions::default(),
        }
    }

    pub fn with_options(mut self, options: RelayOptions) -> Self {
        self.options = options;
        self
    }

    /// 待ち受けアドレス (例: "127.0.0.1:9000")
    pub fn listen_addr(&self) -> String {
        host_port(&self.listen_ip, self.listen_port)
    }

    /// 転送先アドレス (例: "[::1]:9100")
    pub fn forward_addr(&self) -> String {
        host_port(&self.forward_ip, self.forward_port)
    }
}

/// IPv6 リテラルは角括弧で囲む
pub(crate) fn host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

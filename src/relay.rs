use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

use crate::error::RelayError;
use crate::tunnel::TunnelSpec;

pub const DEFAULT_CHUNK_SIZE: usize = 4096;
/// 接続ごとに確保するバッファの上限
pub const MAX_CHUNK_SIZE: usize = 1024 * 1024;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// リレーの動作パラメータ
#[derive(Clone, Debug)]
pub struct RelayOptions {
    /// 1 回の読み取りの最大バイト数
    pub chunk_size: usize,
    /// DEBUG の転送ログにペイロードを 16 進で含める (機密データに注意)
    pub log_payload: bool,
    pub connect_timeout: Duration,
    pub nodelay: bool,
    pub keepalive: Option<Duration>,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            log_payload: false,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            nodelay: true,
            keepalive: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    ClientToDestination,
    DestinationToClient,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ClientToDestination => f.write_str("Client -> Destination"),
            Direction::DestinationToClient => f.write_str("Destination -> Client"),
        }
    }
}

/// `Init → Dialing → Relaying → Closing → Closed`
/// (`Dialing → Closing` はダイヤル失敗時)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelayState {
    Init,
    Dialing,
    Relaying,
    Closing,
    Closed,
}

impl RelayState {
    pub fn can_advance_to(self, next: RelayState) -> bool {
        use RelayState::*;
        matches!(
            (self, next),
            (Init, Dialing)
                | (Dialing, Relaying)
                | (Dialing, Closing)
                | (Relaying, Closing)
                | (Closing, Closed)
        )
    }
}

/// リレーの終わり方
#[derive(Debug)]
pub enum RelayEnd {
    /// どちらかの側が EOF を送った (正常終了)
    Closed(Direction),
    /// 転送中のリセットまたは I/O エラー
    Failed { direction: Direction, error: RelayError },
    /// 転送先に接続できなかった。転送先ソケットは一度も開かれていない
    DialFailed(RelayError),
    /// リスナーの停止要求で打ち切られた
    Stopped,
}

/// ログ用の終了記録
#[derive(Debug)]
pub struct RelayOutcome {
    pub end: RelayEnd,
    pub client_to_destination: u64,
    pub destination_to_client: u64,
}

impl RelayOutcome {
    fn new(end: RelayEnd, client_to_destination: u64, destination_to_client: u64) -> Self {
        Self {
            end,
            client_to_destination,
            destination_to_client,
        }
    }
}

impl fmt::Display for RelayOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.end {
            RelayEnd::Closed(direction) => write!(f, "closed by EOF on {}", direction)?,
            RelayEnd::Failed { direction, error } => write!(f, "{}: {}", direction, error)?,
            RelayEnd::DialFailed(error) => write!(f, "dial failed: {}", error)?,
            RelayEnd::Stopped => f.write_str("stopped by listener")?,
        }
        write!(
            f,
            " ({} bytes client -> destination, {} bytes destination -> client)",
            self.client_to_destination, self.destination_to_client
        )
    }
}

/// 受け付けた 1 本のクライアント接続と、そのためにダイヤルした転送先接続を所有する
///
/// どの経路で終わっても (正常終了・エラー・停止要求) 両方のソケットを
/// 自分で閉じてから `run()` を返す。
pub struct Relay {
    spec: Arc<TunnelSpec>,
    client: TcpStream,
    peer: SocketAddr,
    stop: watch::Receiver<bool>,
    state: RelayState,
}

impl Relay {
    pub fn new(
        spec: Arc<TunnelSpec>,
        client: TcpStream,
        peer: SocketAddr,
        stop: watch::Receiver<bool>,
    ) -> Self {
        Self {
            spec,
            client,
            peer,
            stop,
            state: RelayState::Init,
        }
    }

    pub async fn run(mut self) -> RelayOutcome {
        let target = self.spec.forward_addr();
        info!("[{}] New client connected from {}", target, self.peer);

        self.advance(RelayState::Dialing);
        let dialed = tokio::select! {
            result = dial(&self.spec) => Some(result),
            _ = stop_requested(&mut self.stop) => None,
        };

        let mut destination = match dialed {
            Some(Ok(stream)) => {
                info!("[{}] Connected to destination {}", target, target);
                stream
            }
            Some(Err(e)) => {
                error!("[{}] {}", target, e);
                self.advance(RelayState::Closing);
                self.close_client(&target).await;
                self.advance(RelayState::Closed);
                return RelayOutcome::new(RelayEnd::DialFailed(e), 0, 0);
            }
            None => {
                info!("[{}] Listener stopping, abandoning dial", target);
                self.advance(RelayState::Closing);
                self.close_client(&target).await;
                self.advance(RelayState::Closed);
                return RelayOutcome::new(RelayEnd::Stopped, 0, 0);
            }
        };

        self.advance(RelayState::Relaying);
        let mut sent = 0u64;
        let mut received = 0u64;
        let end = {
            let options = &self.spec.options;
            let (mut client_read, mut client_write) = self.client.split();
            let (mut dest_read, mut dest_write) = destination.split();

            // 先に終わった方向が勝ち、もう一方の方向は破棄される
            tokio::select! {
                end = pump(&mut client_read, &mut dest_write, Direction::ClientToDestination, options, &target, &mut sent) => end,
                end = pump(&mut dest_read, &mut client_write, Direction::DestinationToClient, options, &target, &mut received) => end,
                _ = stop_requested(&mut self.stop) => {
                    info!("[{}] Listener stopping, closing connection", target);
                    RelayEnd::Stopped
                }
            }
        };

        self.advance(RelayState::Closing);
        self.close_client(&target).await;
        if let Err(e) = destination.shutdown().await {
            debug!("[{}] Error while closing destination connection: {}", target, e);
        }
        drop(destination);
        info!("[{}] Destination connection {} closed.", target, target);
        self.advance(RelayState::Closed);

        RelayOutcome::new(end, sent, received)
    }

    fn advance(&mut self, next: RelayState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "invalid relay transition {:?} -> {:?}",
            self.state,
            next
        );
        trace!("Relay state {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// クライアント側を閉じる。エラーはログに残すだけ
    async fn close_client(&mut self, target: &str) {
        if let Err(e) = self.client.shutdown().await {
            debug!(
                "[{}] Error while closing client connection {}: {}",
                target, self.peer, e
            );
        }
        info!("[{}] Client connection {} closed.", target, self.peer);
    }
}

/// 一方向のコピー。読んだチャンクを順番どおりに書いて flush する
async fn pump<R, W>(
    reader: &mut R,
    writer: &mut W,
    direction: Direction,
    options: &RelayOptions,
    target: &str,
    transferred: &mut u64,
) -> RelayEnd
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; options.chunk_size.clamp(1, MAX_CHUNK_SIZE)];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => {
                info!("[{}] {}: No more data. Connection closed.", target, direction);
                return RelayEnd::Closed(direction);
            }
            Ok(n) => n,
            Err(e) => return transfer_failed(target, direction, e),
        };

        let chunk = &buf[..n];
        if let Err(e) = write_chunk(writer, chunk).await {
            return transfer_failed(target, direction, e);
        }
        *transferred += n as u64;

        if options.log_payload {
            debug!(
                "[{}] {}: Transferred {} bytes. Data: {}",
                target,
                direction,
                n,
                hex::encode(chunk)
            );
        } else {
            debug!("[{}] {}: Transferred {} bytes", target, direction, n);
        }
    }
}

async fn write_chunk<W: AsyncWrite + Unpin>(writer: &mut W, chunk: &[u8]) -> io::Result<()> {
    writer.write_all(chunk).await?;
    writer.flush().await
}

fn transfer_failed(target: &str, direction: Direction, err: io::Error) -> RelayEnd {
    let error = match err.kind() {
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe => {
            warn!("[{}] {}: Connection reset by peer.", target, direction);
            RelayError::ConnectionReset
        }
        _ => {
            error!("[{}] {}: Error during transfer: {}", target, direction, err);
            RelayError::Io(err)
        }
    };
    RelayEnd::Failed { direction, error }
}

/// 転送先を解決し、得られたアドレスを順に試す
async fn dial(spec: &TunnelSpec) -> Result<TcpStream, RelayError> {
    let target = spec.forward_addr();
    let addrs: Vec<SocketAddr> = lookup_host((spec.forward_ip.as_str(), spec.forward_port))
        .await
        .map_err(|e| RelayError::Resolution {
            host: spec.forward_ip.clone(),
            reason: e.to_string(),
        })?
        .collect();

    if addrs.is_empty() {
        return Err(RelayError::Resolution {
            host: spec.forward_ip.clone(),
            reason: "no addresses found".to_string(),
        });
    }

    let mut last_err = None;
    for addr in addrs {
        let attempt = match timeout(spec.options.connect_timeout, TcpStream::connect(addr)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")),
        };
        match attempt {
            Ok(stream) => {
                tune_stream(&stream, &spec.options);
                return Ok(stream);
            }
            Err(e) => {
                debug!("Failed to connect to {}: {}", addr, e);
                last_err = Some(e);
            }
        }
    }

    let err = last_err.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::AddrNotAvailable, "no address to connect to")
    });
    Err(RelayError::from_dial(&target, err))
}

/// 停止要求が来るまで待つ。送信側が破棄された場合も停止とみなす
pub(crate) async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    while !*stop.borrow_and_update() {
        if stop.changed().await.is_err() {
            return;
        }
    }
}

/// TCP_NODELAY と keepalive を設定。失敗しても接続は続ける
pub(crate) fn tune_stream(stream: &TcpStream, options: &RelayOptions) {
    if let Err(e) = stream.set_nodelay(options.nodelay) {
        debug!("Failed to set TCP_NODELAY: {}", e);
    }
    if let Some(idle) = options.keepalive {
        let keepalive = TcpKeepalive::new().with_time(idle);
        if let Err(e) = SockRef::from(stream).set_tcp_keepalive(&keepalive) {
            debug!("Failed to set TCP keepalive: {}", e);
        }
    }
}

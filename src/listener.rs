use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tokio::time::{sleep, timeout};
use tracing::instrument::WithSubscriber;
use tracing::{debug, error, info, warn, Instrument};

use crate::error::TunnelError;
use crate::relay::{stop_requested, tune_stream, Relay, RelayOutcome};
use crate::tunnel::TunnelSpec;

/// accept が失敗した後 (EMFILE など) に待つ時間
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// 1 本のトンネルのバインド済みソケットと、そこから生まれたリレー群を所有する
pub struct Listener {
    spec: Arc<TunnelSpec>,
    socket: TcpListener,
    local_addr: SocketAddr,
    stop_tx: Arc<watch::Sender<bool>>,
    stop_rx: watch::Receiver<bool>,
    relays: JoinSet<RelayOutcome>,
    accepted: u64,
    panicked: usize,
}

/// 実行中のリスナーを外から止めるためのハンドル
#[derive(Clone, Debug)]
pub struct ListenerHandle {
    name: String,
    local_addr: SocketAddr,
    stop_tx: Arc<watch::Sender<bool>>,
}

impl ListenerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// 新しい接続の受け付けを止め、全リレーに終了を通知
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }
}

/// `serve()` 終了時の集計
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServeReport {
    pub name: String,
    /// 受け付けた接続数
    pub accepted: u64,
    /// panic したリレー数
    pub panicked: usize,
    /// 猶予期間内に閉じず中断したリレー数
    pub abandoned: usize,
}

impl Listener {
    /// 待ち受けアドレスにバインド。失敗してもこのトンネルだけの問題
    pub async fn start(spec: TunnelSpec) -> Result<Self, TunnelError> {
        let spec = Arc::new(spec);
        let logger = spec.logger.clone();
        logger.attach(Self::bind(spec)).await
    }

    async fn bind(spec: Arc<TunnelSpec>) -> Result<Self, TunnelError> {
        let addr = spec.listen_addr();
        info!(
            "Initializing tunnel: Listen on {}, Forward to {}",
            addr,
            spec.forward_addr()
        );

        let socket = match TcpListener::bind((spec.listen_ip.as_str(), spec.listen_port)).await {
            Ok(socket) => socket,
            Err(e) => {
                error!("Failed to bind {}: {}", addr, e);
                return Err(TunnelError::Bind { addr, source: e });
            }
        };
        let local_addr = socket.local_addr().map_err(|e| TunnelError::Bind {
            addr: addr.clone(),
            source: e,
        })?;
        info!("Listening on {}", local_addr);

        let (stop_tx, stop_rx) = watch::channel(false);
        Ok(Self {
            spec,
            socket,
            local_addr,
            stop_tx: Arc::new(stop_tx),
            stop_rx,
            relays: JoinSet::new(),
            accepted: 0,
            panicked: 0,
        })
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn handle(&self) -> ListenerHandle {
        ListenerHandle {
            name: self.spec.name.clone(),
            local_addr: self.local_addr,
            stop_tx: self.stop_tx.clone(),
        }
    }

    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    /// 停止されるまで接続を受け付け、その後 `grace` を上限にリレーの終了を待つ
    pub async fn serve(self, grace: Duration) -> ServeReport {
        let logger = self.spec.logger.clone();
        logger.attach(self.serve_until_stopped(grace)).await
    }

    async fn serve_until_stopped(mut self, grace: Duration) -> ServeReport {
        self.accept_loop().await;

        let Listener {
            spec,
            socket,
            local_addr,
            mut relays,
            accepted,
            mut panicked,
            ..
        } = self;

        // 新しい接続はもう受け付けない
        drop(socket);
        info!("Stopped accepting connections on {}", local_addr);

        let abandoned = drain(&mut relays, grace, &mut panicked).await;
        info!("Tunnel stopped after {} connection(s)", accepted);

        ServeReport {
            name: spec.name.clone(),
            accepted,
            panicked,
            abandoned,
        }
    }

    async fn accept_loop(&mut self) {
        loop {
            tokio::select! {
                _ = stop_requested(&mut self.stop_rx) => break,
                result = self.socket.accept() => {
                    match result {
                        Ok((stream, peer)) => self.spawn_relay(stream, peer),
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                            sleep(ACCEPT_ERROR_BACKOFF).await;
                        }
                    }
                }
                Some(result) = self.relays.join_next(), if !self.relays.is_empty() => {
                    if record_relay_exit(result) {
                        self.panicked += 1;
                    }
                }
            }
        }
    }

    fn spawn_relay(&mut self, stream: TcpStream, peer: SocketAddr) {
        debug!("New connection from {}", peer);
        tune_stream(&stream, &self.spec.options);
        self.accepted += 1;

        // 呼び出し元のトンネル用ディスパッチャとスパンを引き継ぐ
        let span = tracing::error_span!("relay", %peer);
        let relay = Relay::new(self.spec.clone(), stream, peer, self.stop_tx.subscribe());
        self.relays
            .spawn(relay.run().instrument(span).with_current_subscriber());
    }
}

/// 残ったリレーを `grace` まで待ち、過ぎたものは中断する。中断した数を返す
async fn drain(relays: &mut JoinSet<RelayOutcome>, grace: Duration, panicked: &mut usize) -> usize {
    if relays.is_empty() {
        return 0;
    }
    info!(
        "Waiting up to {:?} for {} active connection(s) to close",
        grace,
        relays.len()
    );

    // Instant に足すと溢れる grace でも timeout なら飽和する
    let reaped = timeout(grace, async {
        while let Some(result) = relays.join_next().await {
            if record_relay_exit(result) {
                *panicked += 1;
            }
        }
    })
    .await;
    if reaped.is_ok() {
        return 0;
    }

    let remaining = relays.len();
    warn!(
        "{} connection(s) still open after {:?}, aborting",
        remaining, grace
    );
    // 中断されたタスクはソケットを drop して閉じる
    relays.shutdown().await;
    remaining
}

/// 終了したリレーをログに残す。panic していたら true
fn record_relay_exit(result: Result<RelayOutcome, JoinError>) -> bool {
    match result {
        Ok(outcome) => {
            debug!("Relay finished: {}", outcome);
            false
        }
        Err(e) if e.is_panic() => {
            error!("Relay task panicked: {}", e);
            true
        }
        Err(e) => {
            debug!("Relay task cancelled: {}", e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::testing::SharedBuf;
    use crate::logging::TunnelLogger;
    use crate::relay::RelayEnd;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tracing::level_filters::LevelFilter;

    const WAIT: Duration = Duration::from_secs(5);
    const GRACE: Duration = Duration::from_secs(2);

    async fn spawn_echo() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = stream.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    fn spec(forward_port: u16, logger: TunnelLogger) -> TunnelSpec {
        TunnelSpec::new("test", "127.0.0.1", 0, "127.0.0.1", forward_port, logger)
    }

    fn blow_up() -> RelayOutcome {
        panic!("relay blew up")
    }

    async fn roundtrip(addr: SocketAddr, payload: &[u8]) -> TcpStream {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(payload).await.unwrap();
        let mut back = vec![0u8; payload.len()];
        stream.read_exact(&mut back).await.unwrap();
        assert_eq!(back, payload);
        stream
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = occupied.local_addr().unwrap().port();

        let buf = SharedBuf::default();
        let mut spec = spec(1, buf.logger("busy", LevelFilter::INFO));
        spec.listen_port = port;

        let result = Listener::start(spec).await;
        assert!(matches!(result, Err(TunnelError::Bind { .. })));
        let log = buf.contents();
        assert!(log.contains("ERROR"), "{}", log);
        assert!(log.contains("Failed to bind"), "{}", log);
    }

    #[tokio::test]
    async fn test_concurrent_connections_are_isolated() {
        let echo = spawn_echo().await;
        let listener = Listener::start(spec(echo.port(), TunnelLogger::disabled()))
            .await
            .unwrap();
        let addr = listener.local_addr();
        let handle = listener.handle();
        let serving = tokio::spawn(listener.serve(GRACE));

        let mut a = TcpStream::connect(addr).await.unwrap();
        let mut b = TcpStream::connect(addr).await.unwrap();
        a.write_all(b"aaaa").await.unwrap();
        b.write_all(b"bbbbbb").await.unwrap();

        let mut got_a = [0u8; 4];
        let mut got_b = [0u8; 6];
        a.read_exact(&mut got_a).await.unwrap();
        b.read_exact(&mut got_b).await.unwrap();
        assert_eq!(&got_a, b"aaaa");
        assert_eq!(&got_b, b"bbbbbb");

        // a をリセットしても b は使い続けられる
        socket2::SockRef::from(&a)
            .set_linger(Some(Duration::ZERO))
            .unwrap();
        drop(a);
        tokio::time::sleep(Duration::from_millis(50)).await;
        b.write_all(b"still here").await.unwrap();
        let mut got = [0u8; 10];
        b.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"still here");

        drop(b);
        handle.stop();
        let report = timeout(WAIT, serving).await.unwrap().unwrap();
        assert_eq!(report.accepted, 2);
        assert_eq!(report.abandoned, 0);
    }

    #[tokio::test]
    async fn test_accept_loop_survives_failed_relays() {
        let closed_port = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };
        let buf = SharedBuf::default();
        let listener = Listener::start(spec(closed_port, buf.logger("dead", LevelFilter::INFO)))
            .await
            .unwrap();
        let addr = listener.local_addr();
        let handle = listener.handle();
        let serving = tokio::spawn(listener.serve(GRACE));

        for _ in 0..3 {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            let mut byte = [0u8; 1];
            let read = timeout(WAIT, stream.read(&mut byte)).await.unwrap();
            assert!(matches!(read, Ok(0) | Err(_)));
        }

        handle.stop();
        let report = timeout(WAIT, serving).await.unwrap().unwrap();
        assert_eq!(report.accepted, 3);
        assert_eq!(buf.contents().matches("refused").count(), 3);
    }

    #[tokio::test]
    async fn test_stop_drains_active_relays() {
        let echo = spawn_echo().await;
        let listener = Listener::start(spec(echo.port(), TunnelLogger::disabled()))
            .await
            .unwrap();
        let addr = listener.local_addr();
        let serving = {
            let handle = listener.handle();
            let task = tokio::spawn(listener.serve(GRACE));
            (handle, task)
        };

        let mut client = roundtrip(addr, b"hold me open").await;
        serving.0.stop();

        let report = timeout(WAIT, serving.1).await.unwrap().unwrap();
        assert_eq!(report.accepted, 1);
        assert_eq!(report.abandoned, 0);

        // リレーは停止時にもクライアント側を閉じる
        let mut byte = [0u8; 1];
        let read = timeout(WAIT, client.read(&mut byte)).await.unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));

        // バインドも解放済み
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_stop_before_serve() {
        let listener = Listener::start(spec(1, TunnelLogger::disabled())).await.unwrap();
        assert_eq!(listener.name(), "test");
        listener.stop();

        let report = timeout(WAIT, listener.serve(GRACE)).await.unwrap();
        assert_eq!(report.name, "test");
        assert_eq!(report.accepted, 0);
    }

    #[tokio::test]
    async fn test_panicked_relay_does_not_stop_accept_loop() {
        let echo = spawn_echo().await;
        let buf = SharedBuf::default();
        let mut listener = Listener::start(spec(echo.port(), buf.logger("panic", LevelFilter::INFO)))
            .await
            .unwrap();
        listener.relays.spawn(async { blow_up() });
        let addr = listener.local_addr();
        let handle = listener.handle();
        let serving = tokio::spawn(listener.serve(GRACE));

        // accept ループ内で回収されるまで待つ
        buf.wait_for("Relay task panicked").await;
        let client = roundtrip(addr, b"after panic").await;
        drop(client);

        handle.stop();
        let report = timeout(WAIT, serving).await.unwrap().unwrap();
        assert_eq!(report.panicked, 1);
        assert_eq!(report.accepted, 1);
        assert_eq!(report.abandoned, 0);
    }

    #[tokio::test]
    async fn test_drain_with_unbounded_grace() {
        let mut relays: JoinSet<RelayOutcome> = JoinSet::new();
        relays.spawn(async {
            sleep(Duration::from_millis(20)).await;
            RelayOutcome {
                end: RelayEnd::Stopped,
                client_to_destination: 0,
                destination_to_client: 0,
            }
        });
        let mut panicked = 0;
        let abandoned = timeout(WAIT, drain(&mut relays, Duration::MAX, &mut panicked))
            .await
            .unwrap();
        assert_eq!(abandoned, 0);
        assert_eq!(panicked, 0);
        assert!(relays.is_empty());
    }

    #[tokio::test]
    async fn test_drain_aborts_after_grace() {
        let mut relays: JoinSet<RelayOutcome> = JoinSet::new();
        relays.spawn(async {
            sleep(Duration::from_secs(3600)).await;
            blow_up()
        });
        let mut panicked = 0;
        let abandoned = timeout(
            WAIT,
            drain(&mut relays, Duration::from_millis(50), &mut panicked),
        )
        .await
        .unwrap();
        assert_eq!(abandoned, 1);
        assert_eq!(panicked, 0);
        assert!(relays.is_empty());
    }
}

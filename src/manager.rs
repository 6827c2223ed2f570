use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::listener::{Listener, ListenerHandle, ServeReport};
use crate::tunnel::TunnelSpec;

/// シャットダウン時にリレーの終了を待つ既定の時間
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// `run()` の結果。何を表示しどう終了するかは呼び出し側が決める
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    /// 起動できたトンネルが 1 本もない
    NoTunnels,
    Stopped {
        /// 起動して停止まで動いたトンネル数
        tunnels: usize,
        /// 起動に失敗したトンネル数
        failed: usize,
        /// 猶予期間を過ぎて中断した接続数
        abandoned: usize,
    },
}

/// 全トンネルのリスナーを所有し、停止と排出の手順を受け持つ
pub struct TunnelManager {
    specs: Vec<TunnelSpec>,
    grace: Duration,
}

/// 起動済みのリスナー群
pub struct RunningTunnels {
    handles: Vec<ListenerHandle>,
    tasks: JoinSet<ServeReport>,
    failed: usize,
}

impl TunnelManager {
    pub fn new(specs: Vec<TunnelSpec>) -> Self {
        Self {
            specs,
            grace: DEFAULT_GRACE_PERIOD,
        }
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// 各トンネルを個別に起動する。失敗したトンネルはスキップ
    pub async fn start(self) -> RunningTunnels {
        let mut handles = Vec::new();
        let mut tasks = JoinSet::new();
        let mut failed = 0;

        for spec in self.specs {
            let name = spec.name.clone();
            match Listener::start(spec).await {
                Ok(listener) => {
                    info!("Started {} server on {}", listener.name(), listener.local_addr());
                    handles.push(listener.handle());
                    tasks.spawn(listener.serve(self.grace));
                }
                Err(e) => {
                    error!("Error starting server for [{}]: {}", name, e);
                    failed += 1;
                }
            }
        }

        RunningTunnels {
            handles,
            tasks,
            failed,
        }
    }

    /// 全トンネルを起動し、`shutdown` が完了するまで動かす
    pub async fn run<F>(self, shutdown: F) -> RunStatus
    where
        F: Future<Output = ()>,
    {
        self.start().await.run_until(shutdown).await
    }
}

impl RunningTunnels {
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn handles(&self) -> &[ListenerHandle] {
        &self.handles
    }

    /// 名前からバインド済みアドレスを引く
    pub fn local_addr(&self, name: &str) -> Option<SocketAddr> {
        self.handles
            .iter()
            .find(|h| h.name() == name)
            .map(|h| h.local_addr())
    }

    pub async fn run_until<F>(mut self, shutdown: F) -> RunStatus
    where
        F: Future<Output = ()>,
    {
        if self.handles.is_empty() {
            return RunStatus::NoTunnels;
        }

        info!("Gateway is running with {} tunnel(s)", self.handles.len());
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                // リスナーは停止されるまで終わらないはず
                Some(result) = self.tasks.join_next() => {
                    match result {
                        Ok(report) => warn!("Tunnel [{}] exited unexpectedly", report.name),
                        Err(e) => error!("Tunnel task failed: {}", e),
                    }
                }
            }
        }

        self.shutdown().await
    }

    async fn shutdown(mut self) -> RunStatus {
        info!("Shutting down {} tunnel(s)...", self.handles.len());
        for handle in &self.handles {
            handle.stop();
        }

        let mut abandoned = 0;
        while let Some(result) = self.tasks.join_next().await {
            match result {
                Ok(report) => {
                    if report.abandoned > 0 {
                        warn!(
                            "Tunnel [{}] aborted {} connection(s) that outlived the grace period",
                            report.name, report.abandoned
                        );
                    }
                    if report.panicked > 0 {
                        warn!(
                            "Tunnel [{}] had {} panicked relay(s)",
                            report.name, report.panicked
                        );
                    }
                    info!(
                        "Tunnel [{}] stopped after {} connection(s)",
                        report.name, report.accepted
                    );
                    abandoned += report.abandoned;
                }
                Err(e) => error!("Tunnel task failed: {}", e),
            }
        }

        info!("All tunnels stopped");
        RunStatus::Stopped {
            tunnels: self.handles.len(),
            failed: self.failed,
            abandoned,
        }
    }
}

use std::fs::{self, OpenOptions};
use std::future::Future;
use std::io;
use std::path::Path;
use std::sync::Mutex;

use tracing::dispatcher::{self, Dispatch};
use tracing::instrument::{Instrument, Instrumented, WithDispatch, WithSubscriber};
use tracing::level_filters::LevelFilter;
use tracing::Span;
use tracing_subscriber::fmt::MakeWriter;

/// トンネルごとのロギングハンドル
///
/// 専用の `Dispatch` を持ち、そのトンネルのリスナーとリレーが出すイベントは
/// すべてこのシンクに書かれる。グローバルな登録簿は使わない。
/// 書き込みの直列化はシンク側 (`Mutex` ライター) で行う。
#[derive(Clone, Debug)]
pub struct TunnelLogger {
    dispatch: Dispatch,
    span: Span,
}

impl TunnelLogger {
    /// 任意のライターに出力するロガーを作成
    pub fn with_writer<W>(name: &str, make_writer: W, level: LevelFilter) -> Self
    where
        W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
    {
        let subscriber = tracing_subscriber::fmt()
            .with_writer(make_writer)
            .with_ansi(false)
            .with_target(false)
            .with_max_level(level)
            .finish();
        let dispatch = Dispatch::new(subscriber);

        // ERROR レベルのスパンならどのログレベルでもトンネル名が付く
        let span = dispatcher::with_default(&dispatch, || tracing::error_span!("tunnel", name = %name));

        Self { dispatch, span }
    }

    /// ログファイル (追記モード) に出力するロガーを作成
    pub fn open_file(name: &str, path: &Path, level: LevelFilter) -> io::Result<Self> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::with_writer(name, Mutex::new(file), level))
    }

    /// 何も出力しないロガー
    pub fn disabled() -> Self {
        Self {
            dispatch: Dispatch::none(),
            span: Span::none(),
        }
    }

    /// このトンネルのシンクとスパンの下でクロージャを実行
    pub fn in_scope<T>(&self, f: impl FnOnce() -> T) -> T {
        dispatcher::with_default(&self.dispatch, || self.span.in_scope(f))
    }

    /// Future をこのトンネルのシンクとスパンに結び付ける
    pub fn attach<F: Future>(&self, fut: F) -> WithDispatch<Instrumented<F>> {
        fut.instrument(self.span.clone())
            .with_subscriber(self.dispatch.clone())
    }
}

/// 設定値からログレベルを解釈 (`warning` も受け付ける)
pub fn parse_level(value: &str) -> Option<LevelFilter> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if value.eq_ignore_ascii_case("warning") {
        return Some(LevelFilter::WARN);
    }
    value.parse().ok()
}

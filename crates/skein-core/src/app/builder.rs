//! EngineBuilder - engine の構築とワイヤリング
//!
//! # Fail-fast 設計
//! - remote worker だけは必須。無ければ `build()` が `BuildError` を返す
//! - それ以外の collaborator は開発用のデフォルトで埋まる
//! - config は `build()` 時に検証する
//! - `remote_retry` があれば worker と notifier を retry デコレータで包む

use std::sync::Arc;

use crate::app::Cleaner;
use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::error::EngineError;
use crate::impls::{InMemoryResourceHolder, NoopNotifier, RetryingNotifier, RetryingWorker};
use crate::jobs::RetryPolicy;
use crate::ports::{Clock, IdGenerator, Notifier, RemoteWorker, ResourceHolder, SystemClock, UlidGenerator};
use crate::store::Storage;

/// # 使用例
/// ```ignore
/// let (engine, cleaner) = EngineBuilder::new()
///     .config(config)
///     .remote_worker(Arc::new(MyWorker))
///     .build()?;
/// ```
#[derive(Default)]
pub struct EngineBuilder {
    config: Option<EngineConfig>,
    storage: Option<Arc<Storage>>,
    remote: Option<Arc<dyn RemoteWorker>>,
    notifier: Option<Arc<dyn Notifier>>,
    holder: Option<Arc<dyn ResourceHolder>>,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
}

/// BuildError は engine 構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("no remote worker configured; tasks would have nowhere to run")]
    MissingRemoteWorker,

    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] EngineError),
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn storage(mut self, storage: Arc<Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn remote_worker(mut self, remote: Arc<dyn RemoteWorker>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn resource_holder(mut self, holder: Arc<dyn ResourceHolder>) -> Self {
        self.holder = Some(holder);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Wire the engine. When `cleanup_interval_ms` is set the disposal
    /// sweep is started too, which needs a running tokio runtime.
    pub fn build(self) -> Result<(Engine, Option<Cleaner>), BuildError> {
        let config = self.config.unwrap_or_default();
        config.validate()?;
        let remote = self.remote.ok_or(BuildError::MissingRemoteWorker)?;

        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let ids: Arc<dyn IdGenerator> = self
            .ids
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(Arc::clone(&clock))));
        let interval = config.cleanup_interval_ms;

        let notifier: Arc<dyn Notifier> = self.notifier.unwrap_or_else(|| Arc::new(NoopNotifier));
        let (remote, notifier) = match &config.remote_retry {
            Some(retry) => {
                let policy = RetryPolicy::from(retry);
                tracing::debug!(attempts = policy.max_attempts, "remote calls retried at the transport");
                let remote: Arc<dyn RemoteWorker> = Arc::new(RetryingWorker::new(remote, policy.clone()));
                let notifier: Arc<dyn Notifier> = Arc::new(RetryingNotifier::new(notifier, policy));
                (remote, notifier)
            }
            None => (remote, notifier),
        };

        let engine = Engine::new(
            config,
            self.storage.unwrap_or_else(|| Arc::new(Storage::in_memory())),
            remote,
            notifier,
            self.holder
                .unwrap_or_else(|| Arc::new(InMemoryResourceHolder::new())),
            clock,
            ids,
        );
        tracing::info!(node = %engine.config().node_id, workers = engine.config().job_workers, "engine built");

        let cleaner = interval.map(|ms| Cleaner::spawn(engine.clone(), std::time::Duration::from_millis(ms)));
        Ok((engine, cleaner))
    }
}

//! Cleaner - disposable タスクの定期回収
//!
//! FINAL になったタスクは `disposable` が立つだけで、`delete_on_dispose`
//! が無効なら残り続ける。Cleaner は一定間隔で `Engine::clean_disposable`
//! を呼んでそれらを消す。
//!
//! # シャットダウン
//! - `watch` channel で停止要求を伝える
//! - sweep の途中では止めない（次の tick を待たずに抜けるだけ）

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::engine::Engine;

/// Handle of the background sweep.
/// - `request_shutdown()` で止まる（drop でも止まる）
/// - `shutdown_and_join()` で終了を待てる
pub struct Cleaner {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl Cleaner {
    pub fn spawn(engine: Engine, interval: Duration) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(sweep_loop(engine, interval, shutdown_rx));
        Self { shutdown_tx, join }
    }

    pub fn request_shutdown(&self) {
        // receiver may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        let _ = self.join.await;
    }
}

async fn sweep_loop(engine: Engine, interval: Duration, mut shutdown_rx: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    tracing::debug!(?interval, "cleaner started");

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        tokio::select! {
            changed = shutdown_rx.changed() => {
                // sender dropped counts as shutdown
                if changed.is_err() {
                    break;
                }
                continue;
            }
            _ = ticker.tick() => {}
        }

        if let Err(e) = engine.clean_disposable().await {
            tracing::error!(error = %e, "disposal sweep failed");
        }
    }
    tracing::debug!("cleaner stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Callback, CreateGraphRequest, CreateTask, State};
    use crate::testing::test_engine;

    #[tokio::test]
    async fn sweeps_finished_tasks() {
        let (engine, _) = test_engine();
        engine
            .submit(CreateGraphRequest::new().task(CreateTask::new("a").active()))
            .await
            .unwrap();
        engine.wait_idle().await;
        engine.accept("a", Callback::new(0)).await.unwrap();
        engine.wait_idle().await;
        assert_eq!(engine.task("a").unwrap().unwrap().state, State::Successful);

        let cleaner = Cleaner::spawn(engine.clone(), Duration::from_millis(5));
        for _ in 0..100 {
            if engine.task("a").unwrap().is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cleaner.shutdown_and_join().await;

        assert!(engine.task("a").unwrap().is_none());
    }
}

use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::time::{Duration, sleep};
use tracing_subscriber::EnvFilter;

use skein_core::domain::{Callback, CreateGraphRequest, CreateTask, State};
use skein_core::ports::{RemoteError, RemoteWorker};
use skein_core::{Engine, EngineBuilder, EngineConfig, RetryConfig};

/// What the simulated worker was asked to do.
#[derive(Debug)]
enum Call {
    Start { task: String, epoch: u32 },
    Stop { task: String, epoch: u32 },
    Rollback { task: String, epoch: u32 },
}

/// Remote worker stand-in: acknowledges every call right away and answers
/// later through the channel, like a real worker calling back.
struct SimWorker {
    calls: mpsc::UnboundedSender<Call>,
}

impl SimWorker {
    fn send(&self, call: Call) -> Result<(), RemoteError> {
        self.calls
            .send(call)
            .map_err(|e| RemoteError::Transport(format!("worker gone: {e}")))
    }
}

#[async_trait]
impl RemoteWorker for SimWorker {
    async fn start(&self, task: &skein_core::domain::Task) -> Result<(), RemoteError> {
        self.send(Call::Start {
            task: task.name.clone(),
            epoch: task.epoch(),
        })
    }

    async fn stop(&self, task: &skein_core::domain::Task) -> Result<(), RemoteError> {
        self.send(Call::Stop {
            task: task.name.clone(),
            epoch: task.epoch(),
        })
    }

    async fn rollback(&self, task: &skein_core::domain::Task) -> Result<(), RemoteError> {
        self.send(Call::Rollback {
            task: task.name.clone(),
            epoch: task.epoch(),
        })
    }
}

/// worker 側の「完了通知」：少し待ってから accept / fail を返す
async fn callback_loop(engine: Engine, mut calls: mpsc::UnboundedReceiver<Call>, fail_once: HashSet<String>) {
    let failed = Arc::new(Mutex::new(HashSet::new()));
    while let Some(call) = calls.recv().await {
        let engine = engine.clone();
        let fail_once = fail_once.clone();
        let failed = Arc::clone(&failed);
        tokio::spawn(async move {
            sleep(Duration::from_millis(20)).await;
            let result = match call {
                Call::Start { task, epoch } => {
                    let first_failure = fail_once.contains(&task)
                        && failed
                            .lock()
                            .map(|mut f| f.insert(task.clone()))
                            .unwrap_or(false);
                    if first_failure {
                        println!("worker: {task} failed (epoch {epoch})");
                        engine.fail(&task, Callback::new(epoch)).await
                    } else {
                        println!("worker: {task} done (epoch {epoch})");
                        let report = serde_json::json!({ "worker": "sim", "task": task });
                        engine
                            .accept(&task, Callback::new(epoch).with_body(report))
                            .await
                    }
                }
                Call::Stop { task, epoch } => engine.accept(&task, Callback::new(epoch)).await,
                Call::Rollback { task, epoch } => {
                    println!("worker: {task} rolled back (epoch {epoch})");
                    engine.accept(&task, Callback::rollback(epoch)).await
                }
            };
            if let Err(e) = result {
                tracing::warn!(error = %e, "callback rejected");
            }
        });
    }
}

fn load_config() -> Result<EngineConfig, Box<dyn std::error::Error>> {
    match std::env::var("SKEIN_CONFIG") {
        Ok(path) => Ok(EngineConfig::from_json_str(&std::fs::read_to_string(path)?)?),
        Err(_) => Ok(EngineConfig::default()),
    }
}

/// provision <- deploy <- verify, plus an unrelated report job on its own
/// queue. deploy fails once and rolls the chain back to provision.
fn sample_graph() -> CreateGraphRequest {
    CreateGraphRequest {
        correlation_id: Some("demo".into()),
        ..CreateGraphRequest::new()
    }
    .task(
        CreateTask::new("provision")
            .active()
            .rollback_endpoint("rollback/provision"),
    )
    .task(
        CreateTask::new("deploy")
            .active()
            .milestone("provision")
            .rollback_endpoint("rollback/deploy"),
    )
    .task(CreateTask::new("verify").active())
    .task(CreateTask::new("report").active().queue("slow"))
    .edge("deploy", "provision")
    .edge("verify", "deploy")
}

#[derive(Serialize)]
struct Summary {
    task: String,
    state: State,
    epoch: u32,
    triggered_rollbacks: u32,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // (A) engine を組み立てる（worker は channel 越しにコールバック）
    let (tx, rx) = mpsc::unbounded_channel();
    let mut config = load_config()?;
    config.remote_retry.get_or_insert_with(RetryConfig::default);
    let (engine, cleaner) = EngineBuilder::new()
        .config(config)
        .remote_worker(Arc::new(SimWorker { calls: tx }))
        .build()?;
    let fail_once = HashSet::from(["deploy".to_string()]);
    let callbacks = tokio::spawn(callback_loop(engine.clone(), rx, fail_once));

    // (B) グラフを投入
    engine.set_max_concurrency(Some("slow"), 1).await?;
    let created = engine.submit(sample_graph()).await?;
    println!("installed: {created:?}");

    // (C) 全タスクが FINAL になるまで待つ
    for _ in 0..500 {
        let done = created
            .iter()
            .filter_map(|name| engine.task(name).ok().flatten())
            .all(|t| t.state.is_final());
        if done {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    engine.wait_idle().await;

    let summary: Vec<Summary> = created
        .iter()
        .filter_map(|name| engine.task(name).ok().flatten())
        .map(|t| Summary {
            epoch: t.epoch(),
            triggered_rollbacks: t.rollback_meta.trigger_counter,
            state: t.state,
            task: t.name,
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&summary)?);

    if let Some(cleaner) = cleaner {
        cleaner.shutdown_and_join().await;
    }
    callbacks.abort();
    Ok(())
}

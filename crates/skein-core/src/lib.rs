//! skein-core
//!
//! 分散タスクのライフサイクル・オーケストレータ。
//!
//! # モジュール構成
//! - **domain**: タスク、状態、遷移、インストール要求
//! - **ports**: 外部コラボレータの trait（store, remote worker, notifier, resource holder, clock, id）
//! - **impls**: ports の in-memory 実装と retry デコレータ
//! - **store**: versioned map とトランザクション
//! - **jobs**: 遷移が発火する副作用ジョブと、その合成（chain / tree / delegate）
//! - **graph**: グラフのインストールと探索
//! - **controller**: タスクを変更する唯一の入口
//! - **queue**: 同時実行数による入場制御
//! - **rollback**: マイルストーンからのロールバック計画
//! - **engine**: ワイヤリング、ジョブ実行、facade
//! - **app**: EngineBuilder と Cleaner

pub mod app;
pub mod config;
pub mod controller;
pub mod domain;
pub mod engine;
pub mod error;
pub mod graph;
pub mod impls;
pub mod jobs;
pub mod ports;
pub mod queue;
pub mod rollback;
pub mod store;

#[cfg(test)]
mod testing;

pub use app::{BuildError, Cleaner, EngineBuilder};
pub use config::{EngineConfig, RetryConfig};
pub use engine::Engine;
pub use error::{EngineError, ErrorKind, Result};

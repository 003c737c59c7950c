//! App - engine の組み立てと常駐ループ
//!
//! # 主要コンポーネント
//! - **EngineBuilder**: collaborator のワイヤリング（Fail-fast）
//! - **Cleaner**: disposable タスクの定期回収

pub mod builder;
pub mod cleaner;

pub use self::builder::{BuildError, EngineBuilder};
pub use self::cleaner::Cleaner;

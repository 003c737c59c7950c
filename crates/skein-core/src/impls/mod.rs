//! Impls - ports の実装（開発・単一ノード用）

pub mod memory_store;
pub mod resource_holder;
pub mod retrying;

pub use memory_store::InMemoryVersionedStore;
pub use resource_holder::InMemoryResourceHolder;
pub use retrying::{NoopNotifier, RetryingNotifier, RetryingWorker};

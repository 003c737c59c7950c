//! Ports - 外部コラボレータの抽象化
//!
//! engine が外界と話す口はすべてここに trait として置く。
//! 実装は `impls` に（開発用の in-memory 版）。

pub mod clock;
pub mod id_generator;
pub mod remote;
pub mod resource_holder;
pub mod versioned_store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::remote::{Notifier, RemoteError, RemoteWorker};
pub use self::resource_holder::ResourceHolder;
pub use self::versioned_store::{Versioned, VersionedStore};

//! Domain model (tasks, states, transitions, install batches, ids).

pub mod cluster;
pub mod ids;
pub mod response;
pub mod spec;
pub mod state;
pub mod task;
pub mod transition;

pub use cluster::{ClusteredJobReference, ClusteredJobType};
pub use ids::{ClusteredJobId, TransactionId};
pub use response::{Callback, Origin, Verdict};
pub use spec::{CreateGraphRequest, CreateTask, Edge};
pub use state::{Mode, State, StateGroup, StopFlag};
pub use task::{RemoteRequest, RollbackMeta, ServerResponse, Task, TaskConfiguration, TransitionTime};
pub use transition::Transition;

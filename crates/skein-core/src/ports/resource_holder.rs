//! ResourceHolder port - クラスタ内での所有権
//!
//! Membership, hand-off and liveness live outside the engine. The engine only
//! enlists the timed jobs it schedules and asks whether it still owns them
//! before acting.

use crate::domain::{ClusteredJobId, ClusteredJobReference};

pub trait ResourceHolder: Send + Sync {
    /// Everything this node currently holds.
    fn local_resources(&self) -> Vec<ClusteredJobReference>;

    fn register_resource_locally(&self, resource: ClusteredJobReference);

    /// Drop a resource once its job finished. Unknown ids are ignored.
    fn deregister_resource_locally(&self, id: ClusteredJobId);

    fn is_owned(&self, id: ClusteredJobId) -> bool;
}

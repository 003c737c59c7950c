//! JobTree - outcome で分岐するジョブの木
//!
//! Nodes run breadth-first starting at the root. After a node ran, each
//! outgoing edge whose trigger matches its outcome enqueues the child. A
//! node reachable from several parents runs at most once.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;

use super::{Job, Outcome, TransactionPhase, Trigger};
use crate::engine::Engine;
use crate::error::{EngineError, Result};
use crate::store::Transaction;

pub type NodeId = usize;

#[derive(Debug)]
struct TreeEdge {
    from: NodeId,
    to: NodeId,
    trigger: Trigger,
}

#[derive(Debug)]
pub struct JobTree {
    nodes: Vec<Arc<dyn Job>>,
    edges: Vec<TreeEdge>,
    phase: TransactionPhase,
    asynchronous: bool,
}

impl JobTree {
    pub const ROOT: NodeId = 0;

    pub fn new(root: Arc<dyn Job>) -> Self {
        Self {
            phase: root.phase(),
            asynchronous: root.is_async(),
            nodes: vec![root],
            edges: Vec::new(),
        }
    }

    /// Attach `job` under `parent`; returns the new node.
    pub fn add(&mut self, parent: NodeId, trigger: Trigger, job: Arc<dyn Job>) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(job);
        self.edges.push(TreeEdge {
            from: parent,
            to: id,
            trigger,
        });
        id
    }

    /// Extra edge between existing nodes (diamond shapes).
    pub fn link(&mut self, from: NodeId, to: NodeId, trigger: Trigger) {
        self.edges.push(TreeEdge { from, to, trigger });
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[async_trait]
impl Job for JobTree {
    fn phase(&self) -> TransactionPhase {
        self.phase
    }

    fn is_async(&self) -> bool {
        self.asynchronous
    }

    fn task(&self) -> Option<&str> {
        self.nodes.first().and_then(|job| job.task())
    }

    fn name(&self) -> &'static str {
        "job-tree"
    }

    async fn run(&self, engine: &Engine, mut tx: Option<&mut Transaction>) -> Result<()> {
        let mut outcomes: HashMap<NodeId, Outcome> = HashMap::new();
        let mut scheduled: HashSet<NodeId> = HashSet::from([Self::ROOT]);
        let mut frontier: VecDeque<NodeId> = VecDeque::from([Self::ROOT]);
        let mut root_result: Result<()> = Ok(());

        while let Some(node) = frontier.pop_front() {
            let job = self.nodes.get(node).ok_or_else(|| {
                EngineError::Internal(format!("job tree has no node {node}"))
            })?;
            let result = job.run(engine, tx.as_deref_mut()).await;
            if let Err(e) = &result {
                tracing::debug!(job = job.name(), task = job.task(), error = %e, "tree node failed");
            }
            outcomes.insert(node, Outcome::from(&result));
            if node == Self::ROOT {
                root_result = result;
            }

            for edge in self.edges.iter().filter(|e| e.from == node) {
                let outcome = outcomes.get(&edge.from).copied().ok_or_else(|| {
                    EngineError::Internal(format!("node {} has no outcome", edge.from))
                })?;
                if edge.trigger.matches(outcome) && scheduled.insert(edge.to) {
                    frontier.push_back(edge.to);
                }
            }
        }
        root_result
    }
}

//! Graph - タスクグラフの格納と探索

mod container;
mod task_graph;

pub use container::GraphContainer;
pub use task_graph::TaskGraph;

#[cfg(test)]
pub mod memory;
pub mod nodes;
pub mod store;
pub mod writer;

pub use nodes::{AssetNode, HostWriteBatch, NetworkContainerNode, ServiceNode};
pub use store::{GraphStore, Neo4jStore};
pub use writer::GraphWriter;

//! p2pfs node: serves local chunks to peers over TCP and fetches files from them.

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod node;
pub mod registry;
pub mod transport;

pub use bootstrap::{BootstrapClient, BootstrapError};
pub use config::NodeConfig;
pub use error::{NodeError, TransferError};
pub use node::{NodeOptions, NodeState, PeerNode};
pub use registry::{Connection, ConnectionRegistry};

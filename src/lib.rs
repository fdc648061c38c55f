//! Node view coordinator for a sidechain tracking a mainchain-derived chain.
//!
//! The crate wires four persistent subsystems into one coordinator: `history`
//! (ordered block graph with a best-chain pointer), `state` (UTXO rules and
//! withdrawal epochs), `wallet` (owned boxes, forging stake paths and
//! ceased-sidechain-withdrawal evidence) and `mempool`. Each subsystem sits
//! on independently versioned stores provided by `storage`; the coordinator
//! in `node` applies blocks across them in a fixed order and recovers a
//! consistent version after an ungraceful shutdown.
//!
//! Applications typically depend on [`config::NodeConfig`] to bootstrap,
//! [`node::SidechainNodeViewHolder`] and [`node::NodeViewHandle`] to operate
//! the node view, and [`interfaces`] to plug in their own wallet and state
//! extensions.

pub mod config;
pub mod crypto;
pub mod errors;
pub mod events;
pub mod history;
pub mod interfaces;
pub mod mempool;
pub mod merkle;
pub mod node;
pub mod secret;
pub mod secret_store;
pub mod state;
pub mod storage;
pub mod types;
pub mod wallet;

pub use config::{ChainParams, NodeConfig};
pub use errors::{ChainError, ChainResult};
pub use events::NodeViewEvent;
pub use history::{ProgressInfo, SidechainHistory};
pub use mempool::MemoryPool;
pub use node::{NodeView, NodeViewHandle, SidechainNodeViewHolder};
pub use state::SidechainState;
pub use storage::NodeStorages;
pub use wallet::SidechainWallet;

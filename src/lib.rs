//! A two-party, unidirectional Bitcoin micropayment channel.
//!
//! [`client::ClientState`] is the payer's side: it builds the multisig
//! contract and refund, emits payment signatures, and watches for
//! settlement. [`server::ServerState`] is the payee's side: it countersigns
//! the refund, broadcasts the contract, tracks the best payment signature
//! seen, and settles. Both are generic over the [`collaborators::Wallet`],
//! [`collaborators::ChannelStore`], and [`collaborators::Broadcaster`]
//! collaborators a host application supplies.

#[cfg(test)]
mod channel_tests;
pub mod client;
pub mod collaborators;
pub mod contract;
pub mod dust;
pub mod error;
pub mod server;
pub mod store;
pub mod tx;

pub use client::{ClientChannelState, ClientState, IncrementedPayment};
pub use collaborators::{Broadcaster, ChannelStore, FundedTransaction, FundingPolicy, InMemoryChannelStore, Wallet};
pub use contract::ContractBuilder;
pub use error::{Error, IllegalState};
pub use server::{ServerChannelState, ServerState};
pub use store::{ChannelId, StoredClientChannel, StoredServerChannel};

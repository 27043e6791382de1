//! Transport abstraction over the p2p layer
//!
//! The pairing protocol needs three primitives: connect to a peer, open a
//! bidirectional stream on that connection, and finish the write side of a
//! stream. Everything else about the transport (relays, address discovery,
//! NAT traversal, keep-alive) stays behind this seam. [`quic::IrohTransport`]
//! is the production implementation; [`memory::MemoryTransport`] wires peers
//! up in-process.

pub mod cache;
pub mod memory;
pub mod quic;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Result;

pub use ::iroh::{EndpointAddr as NodeAddr, EndpointId as NodeId};

/// Write half of a bidirectional stream.
///
/// Shutting it down ("finishing") signals that no more data will be written;
/// for the QUIC transport this maps directly onto stream finish.
pub type BoxSendStream = Box<dyn AsyncWrite + Send + Unpin>;
pub type BoxRecvStream = Box<dyn AsyncRead + Send + Unpin>;

/// A live multiplexed connection to one peer
#[async_trait]
pub trait Connection: Send + Sync {
	/// Open a fresh bidirectional stream for one message exchange
	async fn open_bi(&self) -> Result<(BoxSendStream, BoxRecvStream)>;

	/// Active liveness check; cached connections can die silently
	fn is_alive(&self) -> bool;
}

/// Connection factory the [`cache::ConnectionCache`] draws from
#[async_trait]
pub trait Transport: Send + Sync {
	async fn connect(&self, addr: NodeAddr) -> Result<Arc<dyn Connection>>;
}

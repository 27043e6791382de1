//! In-memory transport
//!
//! Connects peers living in the same process through duplex pipes. Used by
//! the protocol tests and by embedders that colocate two cores (e.g. a
//! simulator). Stream semantics mirror the QUIC transport: every `open_bi`
//! yields a fresh pipe delivered to the remote peer's stream handler, and
//! shutting down the write half gives the reader EOF like a finished stream.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{BoxRecvStream, BoxSendStream, Connection, NodeAddr, NodeId, Transport};
use crate::error::{NetworkingError, Result};

const STREAM_BUFFER_SIZE: usize = 64 * 1024;

/// Callback invoked with the remote half of every opened stream and the
/// node id of the peer that opened it
pub type StreamHandler = Arc<dyn Fn(BoxSendStream, BoxRecvStream, NodeId) + Send + Sync>;

/// Shared rendezvous point for a set of in-process peers
#[derive(Default)]
pub struct MemoryHub {
	peers: RwLock<HashMap<NodeId, StreamHandler>>,
}

impl MemoryHub {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}
}

/// One peer's endpoint on a [`MemoryHub`]
pub struct MemoryTransport {
	hub: Arc<MemoryHub>,
	local_node_id: NodeId,
}

impl MemoryTransport {
	pub fn new(hub: Arc<MemoryHub>, local_node_id: NodeId) -> Self {
		Self { hub, local_node_id }
	}

	/// Register the handler that accepts streams opened towards this peer
	pub async fn bind(&self, handler: StreamHandler) {
		self.hub
			.peers
			.write()
			.await
			.insert(self.local_node_id, handler);
	}
}

#[async_trait]
impl Transport for MemoryTransport {
	async fn connect(&self, addr: NodeAddr) -> Result<Arc<dyn Connection>> {
		let handler = self
			.hub
			.peers
			.read()
			.await
			.get(&addr.id)
			.cloned()
			.ok_or_else(|| {
				NetworkingError::ConnectionFailed(format!("No such peer: {}", addr.id))
			})?;

		Ok(Arc::new(MemoryConnection {
			handler,
			local_node_id: self.local_node_id,
			alive: AtomicBool::new(true),
		}))
	}
}

struct MemoryConnection {
	handler: StreamHandler,
	local_node_id: NodeId,
	alive: AtomicBool,
}

#[async_trait]
impl Connection for MemoryConnection {
	async fn open_bi(&self) -> Result<(BoxSendStream, BoxRecvStream)> {
		let (local, remote) = tokio::io::duplex(STREAM_BUFFER_SIZE);
		let (local_read, local_write) = tokio::io::split(local);
		let (remote_read, remote_write) = tokio::io::split(remote);

		(self.handler)(
			Box::new(remote_write),
			Box::new(remote_read),
			self.local_node_id,
		);

		Ok((Box::new(local_write), Box::new(local_read)))
	}

	fn is_alive(&self) -> bool {
		self.alive.load(Ordering::SeqCst)
	}
}

//! Peer connection cache
//!
//! Maps a peer node id to a live multiplexed connection. Connections are
//! created lazily on first use, health-checked before reuse and replaced
//! transparently when dead. The pairing logic never tears them down; the
//! transport's own keep-alive owns liveness.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use super::{BoxRecvStream, BoxSendStream, Connection, NodeAddr, NodeId, Transport};
use crate::error::Result;

pub struct ConnectionCache {
	transport: Arc<dyn Transport>,
	connections: RwLock<HashMap<NodeId, Arc<dyn Connection>>>,
}

impl ConnectionCache {
	pub fn new(transport: Arc<dyn Transport>) -> Self {
		Self {
			transport,
			connections: RwLock::new(HashMap::new()),
		}
	}

	/// Reuse the cached connection to this peer if it is still alive,
	/// otherwise establish a new one and cache it
	pub async fn get_or_create(&self, addr: NodeAddr) -> Result<Arc<dyn Connection>> {
		let node_id = addr.id;

		{
			let connections = self.connections.read().await;
			if let Some(conn) = connections.get(&node_id) {
				if conn.is_alive() {
					return Ok(conn.clone());
				}
				debug!(node_id = %node_id, "Cached connection is dead, reconnecting");
			}
		}

		let conn = self.transport.connect(addr).await?;

		let mut connections = self.connections.write().await;
		// Another caller may have connected while we were; keep the live one
		if let Some(existing) = connections.get(&node_id) {
			if existing.is_alive() {
				return Ok(existing.clone());
			}
		}
		connections.insert(node_id, conn.clone());

		Ok(conn)
	}

	/// Open a fresh bidirectional stream on this peer's connection
	pub async fn open_stream(&self, addr: NodeAddr) -> Result<(BoxSendStream, BoxRecvStream)> {
		let conn = self.get_or_create(addr).await?;
		conn.open_bi().await
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::error::NetworkingError;
	use async_trait::async_trait;
	use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

	struct FakeConnection {
		alive: Arc<AtomicBool>,
	}

	#[async_trait]
	impl Connection for FakeConnection {
		async fn open_bi(&self) -> Result<(BoxSendStream, BoxRecvStream)> {
			Err(NetworkingError::Transport("not implemented".to_string()))
		}

		fn is_alive(&self) -> bool {
			self.alive.load(Ordering::SeqCst)
		}
	}

	struct FakeTransport {
		connects: AtomicUsize,
		alive: Arc<AtomicBool>,
	}

	#[async_trait]
	impl Transport for FakeTransport {
		async fn connect(&self, _addr: NodeAddr) -> Result<Arc<dyn Connection>> {
			self.connects.fetch_add(1, Ordering::SeqCst);
			Ok(Arc::new(FakeConnection {
				alive: self.alive.clone(),
			}))
		}
	}

	fn test_addr() -> NodeAddr {
		let identity = crate::identity::NetworkIdentity::generate();
		NodeAddr::new(identity.node_id())
	}

	#[tokio::test]
	async fn reuses_live_connection() {
		let alive = Arc::new(AtomicBool::new(true));
		let transport = Arc::new(FakeTransport {
			connects: AtomicUsize::new(0),
			alive,
		});
		let cache = ConnectionCache::new(transport.clone());
		let addr = test_addr();

		cache.get_or_create(addr.clone()).await.unwrap();
		cache.get_or_create(addr).await.unwrap();

		assert_eq!(transport.connects.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn replaces_dead_connection() {
		let alive = Arc::new(AtomicBool::new(true));
		let transport = Arc::new(FakeTransport {
			connects: AtomicUsize::new(0),
			alive: alive.clone(),
		});
		let cache = ConnectionCache::new(transport.clone());
		let addr = test_addr();

		cache.get_or_create(addr.clone()).await.unwrap();

		// Kill the cached connection; the next lookup must reconnect
		alive.store(false, Ordering::SeqCst);
		cache.get_or_create(addr.clone()).await.unwrap();

		assert_eq!(transport.connects.load(Ordering::SeqCst), 2);
	}
}

//! Iroh-backed transport
//!
//! Wraps an [`iroh::Endpoint`] behind the [`Transport`] seam. Connections are
//! QUIC; every pairing exchange runs on its own bidirectional stream and the
//! connection persists across the whole handshake and beyond.

use std::sync::Arc;

use async_trait::async_trait;
use iroh::endpoint::Connection as QuicConnection;
use iroh::Endpoint;

use super::{BoxRecvStream, BoxSendStream, Connection, NodeAddr, Transport};
use crate::error::{NetworkingError, Result};

/// ALPN identifier for the pairing protocol
pub const PAIRING_ALPN: &[u8] = b"cirrus/pairing/1";

pub struct IrohTransport {
	endpoint: Endpoint,
	alpn: Vec<u8>,
}

impl IrohTransport {
	pub fn new(endpoint: Endpoint) -> Self {
		Self::with_alpn(endpoint, PAIRING_ALPN)
	}

	pub fn with_alpn(endpoint: Endpoint, alpn: impl Into<Vec<u8>>) -> Self {
		Self {
			endpoint,
			alpn: alpn.into(),
		}
	}

	pub fn endpoint(&self) -> &Endpoint {
		&self.endpoint
	}
}

#[async_trait]
impl Transport for IrohTransport {
	async fn connect(&self, addr: NodeAddr) -> Result<Arc<dyn Connection>> {
		let conn = self
			.endpoint
			.connect(addr, &self.alpn)
			.await
			.map_err(|e| NetworkingError::ConnectionFailed(format!("Failed to connect: {}", e)))?;

		Ok(Arc::new(IrohConnection::new(conn)))
	}
}

/// Wrapper used for both dialed and accepted iroh connections
pub struct IrohConnection {
	conn: QuicConnection,
}

impl IrohConnection {
	pub fn new(conn: QuicConnection) -> Self {
		Self { conn }
	}
}

#[async_trait]
impl Connection for IrohConnection {
	async fn open_bi(&self) -> Result<(BoxSendStream, BoxRecvStream)> {
		let (send, recv) = self.conn.open_bi().await.map_err(|e| {
			NetworkingError::ConnectionFailed(format!("Failed to open stream: {}", e))
		})?;

		Ok((Box::new(send), Box::new(recv)))
	}

	fn is_alive(&self) -> bool {
		self.conn.close_reason().is_none()
	}
}

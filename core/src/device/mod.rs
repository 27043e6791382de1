//! Device state shared between the pairing protocol and the registry

mod registry;

pub use registry::DeviceRegistry;

use chrono::{DateTime, Duration, Utc};
use hkdf::Hkdf;
use iroh::{EndpointAddr as NodeAddr, EndpointId as NodeId};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use uuid::Uuid;

use crate::error::{NetworkingError, Result};
use crate::identity::NetworkFingerprint;

/// Session keys older than this must be rotated by re-pairing
const SESSION_KEY_MAX_AGE_DAYS: i64 = 30;

/// Identity a peer advertises about itself during pairing
///
/// Carries no network addresses: address material is owned by the transport
/// layer and only consulted live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
	pub device_id: Uuid,
	pub device_name: String,
	pub device_type: DeviceType,
	pub os_version: String,
	pub app_version: String,
	pub network_fingerprint: NetworkFingerprint,
	pub capabilities: Vec<String>,
	pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceType {
	Desktop,
	Laptop,
	Mobile,
	Tablet,
	Headless,
}

/// Directional keys for device-to-device encryption, expanded from the
/// pairing shared secret
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionKeys {
	pub send_key: Vec<u8>,
	pub receive_key: Vec<u8>,
	pub created_at: DateTime<Utc>,
}

impl SessionKeys {
	/// Expand a shared secret into 32-byte send and receive keys
	pub fn from_shared_secret(shared_secret: &[u8]) -> Result<Self> {
		let hkdf = Hkdf::<Sha256>::new(None, shared_secret);

		let mut send_key = vec![0u8; 32];
		hkdf.expand(b"cirrus-session-send-key-v1", &mut send_key)
			.map_err(|e| NetworkingError::Crypto(format!("Failed to derive send key: {}", e)))?;

		let mut receive_key = vec![0u8; 32];
		hkdf.expand(b"cirrus-session-receive-key-v1", &mut receive_key)
			.map_err(|e| NetworkingError::Crypto(format!("Failed to derive receive key: {}", e)))?;

		Ok(Self {
			send_key,
			receive_key,
			created_at: Utc::now(),
		})
	}

	pub fn is_expired(&self) -> bool {
		Utc::now().signed_duration_since(self.created_at) > Duration::days(SESSION_KEY_MAX_AGE_DAYS)
	}
}

/// Live connection statistics tracked for a connected device
#[derive(Debug, Clone, Default)]
pub struct ConnectionInfo {
	pub latency_ms: Option<u32>,
	pub rx_bytes: u64,
	pub tx_bytes: u64,
}

#[derive(Debug, Clone)]
pub enum DisconnectionReason {
	Graceful,
	Timeout,
	TransportError(String),
}

/// Lifecycle of a device as seen by the registry
#[derive(Debug, Clone)]
pub enum DeviceState {
	/// Seen on the network, nothing agreed yet
	Discovered {
		node_id: NodeId,
		node_addr: NodeAddr,
		discovered_at: DateTime<Utc>,
	},
	/// A pairing session is in flight for this device
	Pairing {
		node_id: NodeId,
		session_id: Uuid,
		node_addr: NodeAddr,
		started_at: DateTime<Utc>,
	},
	/// Pairing completed; keys are held but no live connection
	Paired {
		info: DeviceInfo,
		session_keys: SessionKeys,
		paired_at: DateTime<Utc>,
	},
	Connected {
		info: DeviceInfo,
		session_keys: SessionKeys,
		connection: ConnectionInfo,
		connected_at: DateTime<Utc>,
	},
	Disconnected {
		info: DeviceInfo,
		session_keys: SessionKeys,
		last_seen: DateTime<Utc>,
		reason: DisconnectionReason,
	},
}

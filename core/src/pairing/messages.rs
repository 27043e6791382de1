//! Pairing protocol message definitions

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::device::DeviceInfo;

/// Messages exchanged during the pairing protocol
///
/// Serialized as a tagged union; receivers match exhaustively and treat
/// anything that fails to decode as a protocol failure, never ignoring it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PairingMessage {
	/// Joiner -> Initiator: opens the handshake with the joiner's identity
	PairingRequest {
		session_id: Uuid,
		device_info: DeviceInfo,
		public_key: Vec<u8>,
	},
	/// Initiator -> Joiner: authentication nonce plus the initiator's identity
	Challenge {
		session_id: Uuid,
		challenge: Vec<u8>,
		device_info: DeviceInfo,
	},
	/// Joiner -> Initiator: the nonce signed with the joiner's identity key
	Response {
		session_id: Uuid,
		signature: Vec<u8>,
		device_info: DeviceInfo,
	},
	/// Initiator -> Joiner: outcome of the handshake
	Complete {
		session_id: Uuid,
		success: bool,
		reason: Option<String>,
	},
}

impl PairingMessage {
	pub fn session_id(&self) -> Uuid {
		match self {
			PairingMessage::PairingRequest { session_id, .. }
			| PairingMessage::Challenge { session_id, .. }
			| PairingMessage::Response { session_id, .. }
			| PairingMessage::Complete { session_id, .. } => *session_id,
		}
	}

	pub(crate) fn kind(&self) -> &'static str {
		match self {
			PairingMessage::PairingRequest { .. } => "PairingRequest",
			PairingMessage::Challenge { .. } => "Challenge",
			PairingMessage::Response { .. } => "Response",
			PairingMessage::Complete { .. } => "Complete",
		}
	}
}

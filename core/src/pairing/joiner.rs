//! Joiner-side ("Bob") handshake steps

use iroh::{EndpointAddr as NodeAddr, EndpointId as NodeId};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
	messages::PairingMessage, security::PairingSecurity, types::PairingState,
	PairingProtocolHandler,
};
use crate::device::{ConnectionInfo, DeviceInfo, SessionKeys};
use crate::error::{NetworkingError, Result};

impl PairingProtocolHandler {
	/// Sign the initiator's challenge and answer with our identity.
	///
	/// The initiator's device info is recorded but not trusted yet: no key
	/// derivation, no registry writes and nothing marked connected until the
	/// initiator has verified the response and confirmed. Committing here
	/// would let this side consider pairing done while the initiator may
	/// still reject it.
	pub(crate) async fn handle_pairing_challenge(
		&self,
		session_id: Uuid,
		challenge: Vec<u8>,
		initiator_device_info: DeviceInfo,
	) -> Result<PairingMessage> {
		PairingSecurity::validate_challenge(&challenge)?;

		let signature = self.identity.sign(&challenge);

		self.sessions
			.update(session_id, |session| {
				if !matches!(session.state, PairingState::Scanning) {
					return Err(NetworkingError::Protocol(format!(
						"Unexpected challenge for session {} in state {}",
						session_id, session.state
					)));
				}
				session.state = PairingState::ResponseSent;
				session.remote_device_id = Some(initiator_device_info.device_id);
				session.remote_device_info = Some(initiator_device_info);
				Ok(())
			})
			.await?;

		debug!(session_id = %session_id, "Signed challenge, awaiting completion");

		Ok(PairingMessage::Response {
			session_id,
			signature,
			device_info: self.device_info(),
		})
	}

	/// Handle the initiator's completion verdict.
	///
	/// Only on a successful completion does the joiner derive the session
	/// key, commit the previously stored initiator identity to the registry
	/// and reach `Completed` - never earlier. A failed completion marks the
	/// session failed without touching the registry.
	pub(crate) async fn handle_completion(
		&self,
		session_id: Uuid,
		success: bool,
		reason: Option<String>,
		remote_node_id: NodeId,
	) -> Result<()> {
		if !success {
			let reason = reason.unwrap_or_else(|| "Pairing failed".to_string());
			warn!(
				session_id = %session_id,
				reason = %reason,
				"Pairing rejected by initiator"
			);
			self.sessions.fail(session_id, reason).await;
			return Ok(());
		}

		let initiator_info = {
			let session = self.sessions.get(session_id).await.ok_or_else(|| {
				NetworkingError::Protocol(format!("Session {} not found", session_id))
			})?;

			if !matches!(session.state, PairingState::ResponseSent) {
				return Err(NetworkingError::Protocol(format!(
					"Unexpected completion for session {} in state {}",
					session_id, session.state
				)));
			}

			session.remote_device_info.clone().ok_or_else(|| {
				NetworkingError::Protocol(
					"Completion received without a prior challenge exchange".to_string(),
				)
			})?
		};

		// The initiator has confirmed; only now derive the key and commit
		let shared_secret = self.generate_shared_secret(session_id).await?;
		let session_keys = SessionKeys::from_shared_secret(&shared_secret)?;

		let node_id = initiator_info
			.network_fingerprint
			.node_id
			.parse::<NodeId>()
			.map_err(|e| {
				NetworkingError::Protocol(format!("Invalid node id in device info: {}", e))
			})?;
		if node_id != remote_node_id {
			return Err(NetworkingError::Protocol(
				"Completion sender does not match the paired device".to_string(),
			));
		}

		{
			let mut registry = self.device_registry.write().await;
			registry.start_pairing(
				initiator_info.device_id,
				node_id,
				session_id,
				NodeAddr::new(node_id),
			)?;
			registry.complete_pairing(
				initiator_info.device_id,
				initiator_info.clone(),
				session_keys,
			)?;
			registry.mark_connected(initiator_info.device_id, ConnectionInfo::default())?;
		}

		self.sessions
			.update(session_id, |session| {
				if !matches!(session.state, PairingState::ResponseSent) {
					return Err(NetworkingError::Protocol(format!(
						"Session {} changed state during completion",
						session_id
					)));
				}
				session.state = PairingState::Completed;
				session.shared_secret = Some(shared_secret.clone());
				Ok(())
			})
			.await?;

		info!(
			session_id = %session_id,
			device = %initiator_info.device_name,
			"Pairing completed on joiner side"
		);

		Ok(())
	}
}

//! Initiator-side ("Alice") handshake steps

use iroh::{EndpointAddr as NodeAddr, EndpointId as NodeId};
use tracing::{info, warn};
use uuid::Uuid;

use super::{
	messages::PairingMessage,
	security::{ChallengeGuard, PairingSecurity},
	types::PairingState,
	PairingProtocolHandler,
};
use crate::device::{ConnectionInfo, DeviceInfo, SessionKeys};
use crate::error::{NetworkingError, Result};

impl PairingProtocolHandler {
	/// Handle an incoming pairing request and answer it with a challenge.
	///
	/// The session must exist (created when the code was generated) and still
	/// be in `Scanning`; a second request for the same session is rejected
	/// rather than silently restarting the exchange.
	pub(crate) async fn handle_pairing_request(
		&self,
		remote_node_id: NodeId,
		session_id: Uuid,
		device_info: DeviceInfo,
		public_key: Vec<u8>,
	) -> Result<PairingMessage> {
		PairingSecurity::validate_public_key(&public_key)?;

		info!(
			session_id = %session_id,
			device = %device_info.device_name,
			node = %remote_node_id,
			"Received pairing request"
		);

		let challenge = ChallengeGuard::generate();

		self.sessions
			.update(session_id, |session| {
				if !matches!(session.state, PairingState::Scanning) {
					return Err(NetworkingError::Protocol(format!(
						"Unexpected pairing request for session {} in state {}",
						session_id, session.state
					)));
				}
				session.state = PairingState::ChallengeSent {
					challenge: challenge.clone(),
				};
				session.remote_device_id = Some(device_info.device_id);
				session.remote_device_info = Some(device_info);
				session.remote_public_key = Some(public_key);
				Ok(())
			})
			.await?;

		Ok(PairingMessage::Challenge {
			session_id,
			challenge,
			device_info: self.device_info(),
		})
	}

	/// Verify the joiner's signed response and finish the initiator side.
	///
	/// On a valid signature the registry is committed and the session reaches
	/// `Completed` before the success confirmation is handed back for
	/// sending: whenever the joiner later completes, this side already has.
	/// An invalid signature fails the session and is still answered with a
	/// failed completion so the joiner does not hang.
	pub(crate) async fn handle_pairing_response(
		&self,
		remote_node_id: NodeId,
		session_id: Uuid,
		signature: Vec<u8>,
		device_info: DeviceInfo,
	) -> Result<PairingMessage> {
		let session = self
			.sessions
			.get(session_id)
			.await
			.ok_or_else(|| NetworkingError::Protocol(format!("Session {} not found", session_id)))?;

		let challenge = match &session.state {
			PairingState::ChallengeSent { challenge } => challenge.clone(),
			other => {
				return Err(NetworkingError::Protocol(format!(
					"Unexpected response for session {} in state {}",
					session_id, other
				)));
			}
		};

		let public_key = session.remote_public_key.clone().ok_or_else(|| {
			NetworkingError::Protocol("No public key recorded for session".to_string())
		})?;

		if session.remote_device_id != Some(device_info.device_id) {
			return Err(NetworkingError::Protocol(
				"Response device id does not match the pairing request".to_string(),
			));
		}

		PairingSecurity::validate_signature(&signature)?;

		// Consume the nonce first: a replayed or expired challenge dies here
		// regardless of how valid the signature looks
		self.challenges.verify_and_consume(&challenge)?;

		let signature_valid =
			PairingSecurity::verify_challenge_response(&public_key, &challenge, &signature)?;

		if !signature_valid {
			warn!(
				session_id = %session_id,
				node = %remote_node_id,
				"Invalid challenge signature"
			);
			self.sessions.fail(session_id, "Invalid signature").await;

			// The rejection must reach the joiner, not be silently dropped
			return Ok(PairingMessage::Complete {
				session_id,
				success: false,
				reason: Some("Challenge signature verification failed".to_string()),
			});
		}

		let node_id = device_info
			.network_fingerprint
			.node_id
			.parse::<NodeId>()
			.map_err(|e| {
				NetworkingError::Protocol(format!("Invalid node id in device info: {}", e))
			})?;
		if node_id != remote_node_id {
			return Err(NetworkingError::Protocol(
				"Device node id does not match the connection".to_string(),
			));
		}

		let shared_secret = self.generate_shared_secret(session_id).await?;
		let session_keys = SessionKeys::from_shared_secret(&shared_secret)?;

		// Commit locally before any confirmation leaves this device
		{
			let mut registry = self.device_registry.write().await;
			registry.start_pairing(
				device_info.device_id,
				node_id,
				session_id,
				NodeAddr::new(node_id),
			)?;
			registry.complete_pairing(device_info.device_id, device_info.clone(), session_keys)?;
			registry.mark_connected(device_info.device_id, ConnectionInfo::default())?;
		}

		self.sessions
			.update(session_id, |session| {
				if !matches!(session.state, PairingState::ChallengeSent { .. }) {
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
			device = %device_info.device_name,
			"Pairing completed on initiator side"
		);

		Ok(PairingMessage::Complete {
			session_id,
			success: true,
			reason: None,
		})
	}
}

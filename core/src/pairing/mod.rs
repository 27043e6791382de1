//! Pairing protocol handler
//!
//! Drives the challenge-response handshake between an initiator and a joiner.
//! Session state lives in the [`store::SessionStore`] between steps; each
//! inbound message is a discrete transition validated against that state, so
//! out-of-order or duplicate messages are rejected instead of silently
//! overwriting anything.

mod initiator;
mod joiner;
pub mod messages;
pub mod persistence;
pub mod security;
pub mod store;
pub mod types;

pub use messages::PairingMessage;
pub use security::{AuthError, ChallengeGuard, PairingSecurity};
pub use store::SessionStore;
pub use types::{PairingCode, PairingSession, PairingState};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use iroh::{EndpointAddr as NodeAddr, EndpointId as NodeId};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::device::{DeviceInfo, DeviceRegistry};
use crate::error::{NetworkingError, Result};
use crate::identity::NetworkIdentity;
use crate::transport::{cache::ConnectionCache, BoxRecvStream, BoxSendStream, Connection, Transport};
use persistence::PairingPersistence;

/// Maximum size of a single pairing message on the wire (1 MiB).
/// Declared lengths above this are rejected before any buffer is allocated.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Write one length-prefixed pairing message
pub async fn write_message<W: AsyncWrite + Unpin>(
	send: &mut W,
	message: &PairingMessage,
) -> Result<()> {
	let data = serde_json::to_vec(message).map_err(NetworkingError::Serialization)?;

	send.write_all(&(data.len() as u32).to_be_bytes())
		.await
		.map_err(|e| NetworkingError::Transport(format!("Failed to write length: {}", e)))?;
	send.write_all(&data)
		.await
		.map_err(|e| NetworkingError::Transport(format!("Failed to write message: {}", e)))?;
	send.flush()
		.await
		.map_err(|e| NetworkingError::Transport(format!("Failed to flush stream: {}", e)))?;

	Ok(())
}

/// Read one length-prefixed pairing message, bounding the allocation
pub async fn read_message<R: AsyncRead + Unpin>(recv: &mut R) -> Result<PairingMessage> {
	let mut len_buf = [0u8; 4];
	recv.read_exact(&mut len_buf)
		.await
		.map_err(|e| NetworkingError::Transport(format!("Failed to read length: {}", e)))?;

	let msg_len = u32::from_be_bytes(len_buf) as usize;
	if msg_len > MAX_MESSAGE_SIZE {
		return Err(NetworkingError::Protocol(format!(
			"Message too large: {} bytes (max: {} bytes)",
			msg_len, MAX_MESSAGE_SIZE
		)));
	}

	let mut msg_buf = vec![0u8; msg_len];
	recv.read_exact(&mut msg_buf)
		.await
		.map_err(|e| NetworkingError::Transport(format!("Failed to read message: {}", e)))?;

	serde_json::from_slice(&msg_buf).map_err(NetworkingError::Serialization)
}

/// Pairing protocol handler
///
/// Owns the in-flight session store and challenge guard; both are internally
/// synchronized and shared by reference with the role-specific handshake
/// steps. The device registry is an external collaborator the handler only
/// requests transitions on.
pub struct PairingProtocolHandler {
	/// Network identity for signing challenges
	identity: NetworkIdentity,

	/// Local device identity advertised to peers
	local_device: DeviceInfo,

	/// Device registry for committed pairing state
	device_registry: Arc<RwLock<DeviceRegistry>>,

	/// Active pairing sessions
	sessions: SessionStore,

	/// Pairing codes for active sessions (session id -> code)
	pairing_codes: RwLock<HashMap<Uuid, PairingCode>>,

	/// Replay protection for issued challenges
	challenges: ChallengeGuard,

	/// Cached connections to remote peers
	connections: ConnectionCache,

	/// Optional session snapshotting across restarts
	persistence: Option<PairingPersistence>,
}

impl PairingProtocolHandler {
	pub fn new(
		identity: NetworkIdentity,
		local_device: DeviceInfo,
		device_registry: Arc<RwLock<DeviceRegistry>>,
		transport: Arc<dyn Transport>,
	) -> Self {
		Self {
			identity,
			local_device,
			device_registry,
			sessions: SessionStore::new(),
			pairing_codes: RwLock::new(HashMap::new()),
			challenges: ChallengeGuard::new(),
			connections: ConnectionCache::new(transport),
			persistence: None,
		}
	}

	pub fn with_persistence(
		identity: NetworkIdentity,
		local_device: DeviceInfo,
		device_registry: Arc<RwLock<DeviceRegistry>>,
		transport: Arc<dyn Transport>,
		data_dir: PathBuf,
	) -> Self {
		let mut handler = Self::new(identity, local_device, device_registry, transport);
		handler.persistence = Some(PairingPersistence::new(data_dir));
		handler
	}

	/// Restore persisted sessions (call once after construction)
	pub async fn load_persisted_sessions(&self) -> Result<usize> {
		let Some(persistence) = &self.persistence else {
			return Ok(0);
		};

		let sessions = persistence.load_sessions().await?;
		let count = sessions.len();
		if count > 0 {
			self.sessions.replace_all(sessions).await;
			info!(count, "Loaded persisted pairing sessions");
		}

		Ok(count)
	}

	pub fn local_node_id(&self) -> NodeId {
		self.identity.node_id()
	}

	/// Local device info with a fresh fingerprint and timestamp
	pub fn device_info(&self) -> DeviceInfo {
		let mut info = self.local_device.clone();
		info.network_fingerprint = self.identity.network_fingerprint();
		info.last_seen = Utc::now();
		info
	}

	/// Start a new pairing session as initiator.
	///
	/// Returns the pairing code to share with the joiner (words or QR); the
	/// session id is derived from it on both sides.
	pub async fn start_pairing_session(&self) -> Result<PairingCode> {
		let pairing_code = PairingCode::generate()?.with_node_id(self.identity.node_id());
		let session_id = pairing_code.session_id();

		self.sessions.create(PairingSession::new(session_id)).await?;
		self.pairing_codes
			.write()
			.await
			.insert(session_id, pairing_code.clone());
		self.save_sessions_to_persistence().await?;

		info!(session_id = %session_id, "Started pairing session");
		Ok(pairing_code)
	}

	/// Join an initiator's session from a scanned or typed pairing code
	pub async fn join_pairing_session(&self, pairing_code: PairingCode) -> Result<Uuid> {
		if pairing_code.is_expired() {
			return Err(NetworkingError::Expired(
				"Pairing code has expired. Request a new code from the initiator.".to_string(),
			));
		}

		let session_id = pairing_code.session_id();
		self.sessions.create(PairingSession::new(session_id)).await?;
		self.pairing_codes
			.write()
			.await
			.insert(session_id, pairing_code);
		self.save_sessions_to_persistence().await?;

		info!(session_id = %session_id, "Joined pairing session");
		Ok(session_id)
	}

	/// Run the joiner side of the handshake against the initiator at `addr`.
	///
	/// Blocks until the initiator confirms or rejects; on success both sides
	/// have committed the pairing to their registries.
	pub async fn pair_with(&self, addr: NodeAddr, pairing_code: PairingCode) -> Result<Uuid> {
		let session_id = self.join_pairing_session(pairing_code).await?;
		let initiator_node = addr.id;

		let conn = match self.connections.get_or_create(addr).await {
			Ok(conn) => conn,
			Err(e) => {
				self.sessions.fail(session_id, e.to_string()).await;
				return Err(e);
			}
		};

		let request = PairingMessage::PairingRequest {
			session_id,
			device_info: self.device_info(),
			public_key: self.identity.public_key_bytes().to_vec(),
		};

		let reply = self
			.fail_on_error(session_id, self.exchange(conn.as_ref(), &request).await)
			.await?;

		let response = {
			let result = match reply {
				PairingMessage::Challenge {
					session_id: reply_session,
					challenge,
					device_info,
				} if reply_session == session_id => {
					self.handle_pairing_challenge(reply_session, challenge, device_info)
						.await
				}
				PairingMessage::Complete {
					success: false,
					reason,
					..
				} => Err(NetworkingError::Protocol(format!(
					"Pairing rejected by initiator: {}",
					reason.unwrap_or_else(|| "no reason given".to_string())
				))),
				other => Err(NetworkingError::Protocol(format!(
					"Expected Challenge, got {}",
					other.kind()
				))),
			};
			self.fail_on_error(session_id, result).await?
		};

		let completion = self
			.fail_on_error(session_id, self.exchange(conn.as_ref(), &response).await)
			.await?;

		match completion {
			PairingMessage::Complete {
				session_id: complete_session,
				success,
				reason,
			} if complete_session == session_id => {
				self.handle_completion(session_id, success, reason.clone(), initiator_node)
					.await?;
				if !success {
					return Err(NetworkingError::Protocol(format!(
						"Pairing rejected by initiator: {}",
						reason.unwrap_or_else(|| "no reason given".to_string())
					)));
				}
				Ok(session_id)
			}
			other => {
				let err = NetworkingError::Protocol(format!(
					"Expected Complete, got {}",
					other.kind()
				));
				self.sessions.fail(session_id, err.to_string()).await;
				Err(err)
			}
		}
	}

	/// One request/response exchange on a fresh bidirectional stream
	async fn exchange(
		&self,
		conn: &dyn Connection,
		message: &PairingMessage,
	) -> Result<PairingMessage> {
		let (mut send, mut recv) = conn.open_bi().await?;

		write_message(&mut send, message).await?;
		// Finish the write side after each message; the connection persists
		send.shutdown()
			.await
			.map_err(|e| NetworkingError::Transport(format!("Failed to finish stream: {}", e)))?;

		read_message(&mut recv).await
	}

	async fn fail_on_error<T>(&self, session_id: Uuid, result: Result<T>) -> Result<T> {
		if let Err(e) = &result {
			self.sessions.fail(session_id, e.to_string()).await;
		}
		result
	}

	/// Handle one inbound stream opened by a remote peer.
	///
	/// Reads length-prefixed messages, dispatches them against the session
	/// state and writes back whatever reply the transition produced. Errors
	/// fail the session and are reported to the peer as a failed completion
	/// so it does not hang waiting.
	pub async fn handle_stream(
		&self,
		mut send: BoxSendStream,
		mut recv: BoxRecvStream,
		remote_node_id: NodeId,
	) -> Result<()> {
		loop {
			let message = match read_message(&mut recv).await {
				Ok(message) => message,
				// Peer closed the stream; normal end of an exchange
				Err(NetworkingError::Transport(_)) => break,
				Err(e) => return Err(e),
			};

			debug!(
				kind = message.kind(),
				node = %remote_node_id,
				"Received pairing message"
			);

			let session_id = message.session_id();
			let expects_reply = !matches!(message, PairingMessage::Complete { .. });

			match self.handle_pairing_message(message, remote_node_id).await {
				Ok(Some(reply)) => {
					let is_completion = matches!(reply, PairingMessage::Complete { .. });
					// A failed write here must surface to the caller: if the
					// success confirmation is lost the joiner never commits,
					// and nobody would know
					write_message(&mut send, &reply).await?;
					if is_completion {
						let _ = send.shutdown().await;
						break;
					}
				}
				Ok(None) => break,
				Err(e) => {
					self.sessions.fail(session_id, e.to_string()).await;
					if expects_reply {
						let failure = PairingMessage::Complete {
							session_id,
							success: false,
							reason: Some(e.to_string()),
						};
						if let Err(write_err) = write_message(&mut send, &failure).await {
							warn!(error = %write_err, "Failed to report pairing failure to peer");
						}
						let _ = send.shutdown().await;
					}
					return Err(e);
				}
			}
		}

		Ok(())
	}

	/// Dispatch one pairing message against the current session state.
	///
	/// Returns the reply to send back on the same stream, if any.
	pub async fn handle_pairing_message(
		&self,
		message: PairingMessage,
		remote_node_id: NodeId,
	) -> Result<Option<PairingMessage>> {
		match message {
			PairingMessage::PairingRequest {
				session_id,
				device_info,
				public_key,
			} => self
				.handle_pairing_request(remote_node_id, session_id, device_info, public_key)
				.await
				.map(Some),
			PairingMessage::Challenge {
				session_id,
				challenge,
				device_info,
			} => self
				.handle_pairing_challenge(session_id, challenge, device_info)
				.await
				.map(Some),
			PairingMessage::Response {
				session_id,
				signature,
				device_info,
			} => self
				.handle_pairing_response(remote_node_id, session_id, signature, device_info)
				.await
				.map(Some),
			PairingMessage::Complete {
				session_id,
				success,
				reason,
			} => {
				self.handle_completion(session_id, success, reason, remote_node_id)
					.await?;
				Ok(None)
			}
		}
	}

	pub async fn get_session(&self, session_id: Uuid) -> Option<PairingSession> {
		self.sessions.get(session_id).await
	}

	pub async fn get_active_sessions(&self) -> Vec<PairingSession> {
		self.sessions.all().await
	}

	/// Cancel a pairing session and forget its code
	pub async fn cancel_session(&self, session_id: Uuid) -> Result<()> {
		self.sessions.remove(session_id).await;
		self.pairing_codes.write().await.remove(&session_id);
		self.save_sessions_to_persistence().await?;
		Ok(())
	}

	/// Remove sessions (and their codes) past the pairing TTL
	pub async fn cleanup_expired_sessions(&self) -> Result<usize> {
		let purged = self.sessions.purge_expired().await;

		if purged > 0 {
			let live: Vec<Uuid> = self.sessions.all().await.iter().map(|s| s.id).collect();
			self.pairing_codes
				.write()
				.await
				.retain(|session_id, _| live.contains(session_id));
			self.save_sessions_to_persistence().await?;
			info!(purged, "Cleaned up expired pairing sessions");
		}

		Ok(purged)
	}

	/// Spawn the periodic sweep for expired sessions
	pub fn start_cleanup_task(handler: Arc<Self>) {
		tokio::spawn(async move {
			let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(60));

			loop {
				interval.tick().await;
				if let Err(e) = handler.cleanup_expired_sessions().await {
					warn!(error = %e, "Error during session cleanup");
				}
			}
		});
	}

	/// Derive this session's shared secret from its pairing code
	pub(crate) async fn generate_shared_secret(&self, session_id: Uuid) -> Result<Vec<u8>> {
		let codes = self.pairing_codes.read().await;
		let code = codes.get(&session_id).ok_or_else(|| {
			NetworkingError::Protocol(format!("No pairing code found for session {}", session_id))
		})?;

		Ok(security::derive_session_key(session_id, code.secret()))
	}

	async fn save_sessions_to_persistence(&self) -> Result<()> {
		if let Some(persistence) = &self.persistence {
			let sessions = self.sessions.snapshot().await;
			persistence.save_sessions(&sessions).await?;
		}
		Ok(())
	}
}

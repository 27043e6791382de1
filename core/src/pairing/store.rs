//! Concurrent store of in-flight pairing sessions
//!
//! The single source of truth for protocol state between handshake steps.
//! Every operation runs under one exclusive lock; in particular `create` is
//! an atomic check-and-insert so two concurrent creates for the same id can
//! never both succeed.

use std::collections::HashMap;

use chrono::{Duration, Utc};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use super::types::{PairingSession, PairingState, PAIRING_TTL_MINUTES};
use crate::error::{NetworkingError, Result};

#[derive(Default)]
pub struct SessionStore {
	sessions: RwLock<HashMap<Uuid, PairingSession>>,
}

impl SessionStore {
	pub fn new() -> Self {
		Self::default()
	}

	/// Insert a new session, failing with `Conflict` if the id exists.
	///
	/// Check and insert happen under one write lock; there is no separate
	/// read-then-write window for a second caller to slip through.
	pub async fn create(&self, session: PairingSession) -> Result<()> {
		let mut sessions = self.sessions.write().await;
		if sessions.contains_key(&session.id) {
			return Err(NetworkingError::Conflict(session.id));
		}
		sessions.insert(session.id, session);
		Ok(())
	}

	pub async fn get(&self, session_id: Uuid) -> Option<PairingSession> {
		self.sessions.read().await.get(&session_id).cloned()
	}

	/// Run a mutation against the live record under the store lock.
	///
	/// State transitions are validated by the caller inside the closure; the
	/// store only guarantees exclusive access.
	pub async fn update<T>(
		&self,
		session_id: Uuid,
		f: impl FnOnce(&mut PairingSession) -> Result<T>,
	) -> Result<T> {
		let mut sessions = self.sessions.write().await;
		let session = sessions.get_mut(&session_id).ok_or_else(|| {
			NetworkingError::Protocol(format!("Session {} not found", session_id))
		})?;
		f(session)
	}

	/// Transition a session to `Failed` unless it already reached a terminal
	/// state; terminal states never regress
	pub async fn fail(&self, session_id: Uuid, reason: impl Into<String>) {
		let mut sessions = self.sessions.write().await;
		if let Some(session) = sessions.get_mut(&session_id) {
			if !session.state.is_terminal() {
				session.state = PairingState::Failed {
					reason: reason.into(),
				};
			}
		}
	}

	pub async fn remove(&self, session_id: Uuid) -> Option<PairingSession> {
		self.sessions.write().await.remove(&session_id)
	}

	pub async fn all(&self) -> Vec<PairingSession> {
		self.sessions.read().await.values().cloned().collect()
	}

	pub async fn snapshot(&self) -> HashMap<Uuid, PairingSession> {
		self.sessions.read().await.clone()
	}

	/// Replace the whole store contents (used when restoring persisted
	/// sessions on startup)
	pub async fn replace_all(&self, sessions: HashMap<Uuid, PairingSession>) {
		*self.sessions.write().await = sessions;
	}

	/// Remove sessions older than the pairing TTL; returns how many went
	pub async fn purge_expired(&self) -> usize {
		let cutoff = Utc::now() - Duration::minutes(PAIRING_TTL_MINUTES);
		let mut sessions = self.sessions.write().await;
		let before = sessions.len();
		sessions.retain(|_, session| session.created_at > cutoff);
		let purged = before - sessions.len();
		if purged > 0 {
			debug!(purged, "Purged expired pairing sessions");
		}
		purged
	}
}

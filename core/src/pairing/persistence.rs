//! Session persistence for the pairing protocol
//!
//! Sessions are snapshotted to a JSON file so an in-flight handshake is not
//! lost on process restart; each inbound message is a discrete transition
//! against the restored state, not an in-memory coroutine.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::warn;
use uuid::Uuid;

use super::types::{PairingSession, PairingState};
use crate::error::{NetworkingError, Result};

/// Persisted pairing sessions data
#[derive(Debug, Serialize, Deserialize)]
struct PersistedPairingSessions {
	sessions: HashMap<Uuid, PairingSession>,
	last_saved: DateTime<Utc>,
}

/// Session persistence manager
pub struct PairingPersistence {
	sessions_file: PathBuf,
}

impl PairingPersistence {
	pub fn new(data_dir: impl AsRef<Path>) -> Self {
		let sessions_file = data_dir
			.as_ref()
			.join("networking")
			.join("pairing_sessions.json");

		Self { sessions_file }
	}

	/// Save active sessions to disk, skipping failed ones
	pub async fn save_sessions(&self, sessions: &HashMap<Uuid, PairingSession>) -> Result<()> {
		if let Some(parent) = self.sessions_file.parent() {
			fs::create_dir_all(parent).await.map_err(NetworkingError::Io)?;
		}

		let persisted = PersistedPairingSessions {
			sessions: sessions
				.iter()
				.filter(|(_, session)| !matches!(session.state, PairingState::Failed { .. }))
				.map(|(id, session)| (*id, session.clone()))
				.collect(),
			last_saved: Utc::now(),
		};

		// Write to a temporary file first, then rename for an atomic swap
		let temp_file = self.sessions_file.with_extension("tmp");
		let json_data =
			serde_json::to_string_pretty(&persisted).map_err(NetworkingError::Serialization)?;

		fs::write(&temp_file, json_data)
			.await
			.map_err(NetworkingError::Io)?;
		fs::rename(&temp_file, &self.sessions_file)
			.await
			.map_err(NetworkingError::Io)?;

		Ok(())
	}

	/// Load sessions from disk, dropping ones past the pairing TTL
	pub async fn load_sessions(&self) -> Result<HashMap<Uuid, PairingSession>> {
		if !self.sessions_file.exists() {
			return Ok(HashMap::new());
		}

		let json_data = match fs::read_to_string(&self.sessions_file).await {
			Ok(data) => data,
			Err(e) => {
				warn!(error = %e, "Failed to read pairing sessions file");
				return Ok(HashMap::new());
			}
		};

		if json_data.trim().is_empty() {
			return Ok(HashMap::new());
		}

		let persisted: PersistedPairingSessions = match serde_json::from_str(&json_data) {
			Ok(p) => p,
			Err(e) => {
				warn!(error = %e, "Pairing sessions file is corrupted, starting fresh");
				let backup_path = self.sessions_file.with_extension("json.corrupted");
				let _ = fs::rename(&self.sessions_file, &backup_path).await;
				return Ok(HashMap::new());
			}
		};

		Ok(persisted
			.sessions
			.into_iter()
			.filter(|(_, session)| !session.is_expired())
			.collect())
	}

	/// Delete all persisted sessions
	pub async fn clear_all_sessions(&self) -> Result<()> {
		if self.sessions_file.exists() {
			fs::remove_file(&self.sessions_file)
				.await
				.map_err(NetworkingError::Io)?;
		}
		Ok(())
	}

	pub fn sessions_file_path(&self) -> &Path {
		&self.sessions_file
	}
}

//! Pairing protocol types and state definitions

use chrono::{DateTime, Duration, Utc};
use iroh::EndpointId as NodeId;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::device::DeviceInfo;
use crate::error::{NetworkingError, Result};

/// Pairing codes expire after this many minutes; sessions use the same
/// window so "code expired" and "session timed out" fail identically
pub const PAIRING_TTL_MINUTES: i64 = 5;

/// Human-readable pairing code using BIP39 mnemonic words
#[derive(Debug, Clone)]
pub struct PairingCode {
	/// 256-bit cryptographic secret
	secret: [u8; 32],

	/// 12 words from the BIP39 wordlist for user-friendly sharing
	words: [String; 12],

	/// Session id derived from the secret
	session_id: Uuid,

	/// Expiration timestamp
	expires_at: DateTime<Utc>,

	/// Initiator's node id for remote discovery (optional)
	node_id: Option<NodeId>,
}

impl PairingCode {
	/// Generate a new pairing code from the OS random source
	pub fn generate() -> Result<Self> {
		use rand::RngCore;

		let mut secret = [0u8; 32];
		rand::thread_rng().fill_bytes(&mut secret);

		let words = Self::encode_to_bip39_words(&secret)?;
		let session_id = Self::derive_session_id(&secret);

		Ok(PairingCode {
			secret,
			words,
			session_id,
			expires_at: Utc::now() + Duration::minutes(PAIRING_TTL_MINUTES),
			node_id: None,
		})
	}

	/// Attach the initiator's node id so remote joiners can dial it
	pub fn with_node_id(mut self, node_id: NodeId) -> Self {
		self.node_id = Some(node_id);
		self
	}

	/// Parse a pairing code from a whitespace-separated mnemonic string
	pub fn from_string(code: &str) -> Result<Self> {
		let trimmed = code.trim();
		if trimmed.is_empty() {
			return Err(NetworkingError::Protocol(
				"Pairing code cannot be empty".to_string(),
			));
		}

		let words: Vec<String> = trimmed
			.split_whitespace()
			.map(|s| s.to_lowercase())
			.collect();

		if words.len() != 12 {
			return Err(NetworkingError::Protocol(format!(
				"Invalid pairing code format - expected 12 words but got {}",
				words.len()
			)));
		}

		let words_array: [String; 12] = words
			.try_into()
			.map_err(|_| NetworkingError::Protocol("Failed to convert words to array".to_string()))?;

		Self::from_words(&words_array)
	}

	/// Create a pairing code from BIP39 words
	pub fn from_words(words: &[String; 12]) -> Result<Self> {
		let secret = Self::decode_from_bip39_words(words)?;

		// Both the initiator (who generated) and the joiner (who parsed)
		// derive the same session id from the secret
		let session_id = Self::derive_session_id(&secret);

		Ok(PairingCode {
			secret,
			words: words.clone(),
			session_id,
			expires_at: Utc::now() + Duration::minutes(PAIRING_TTL_MINUTES),
			node_id: None,
		})
	}

	/// Parse a pairing code from QR payload JSON (for remote pairing)
	pub fn from_qr_json(json: &str) -> Result<Self> {
		let data: serde_json::Value = serde_json::from_str(json)
			.map_err(|e| NetworkingError::Protocol(format!("Failed to parse QR JSON: {}", e)))?;

		let words_str = data
			.get("words")
			.and_then(|v| v.as_str())
			.ok_or_else(|| NetworkingError::Protocol("Missing words in QR code".to_string()))?;

		let mut code = Self::from_string(words_str)?;

		if let Some(node_id_str) = data.get("node_id").and_then(|v| v.as_str()) {
			let node_id = node_id_str.parse::<NodeId>().map_err(|e| {
				NetworkingError::Protocol(format!("Invalid node id in QR code: {}", e))
			})?;
			code.node_id = Some(node_id);
		}

		Ok(code)
	}

	/// Convert to QR payload JSON (for remote pairing)
	pub fn to_qr_json(&self) -> String {
		serde_json::json!({
			"version": 1,
			"words": self.to_string(),
			"node_id": self.node_id.map(|id| id.to_string()),
		})
		.to_string()
	}

	pub fn session_id(&self) -> Uuid {
		self.session_id
	}

	pub fn secret(&self) -> &[u8; 32] {
		&self.secret
	}

	pub fn node_id(&self) -> Option<NodeId> {
		self.node_id
	}

	pub fn is_expired(&self) -> bool {
		Utc::now() > self.expires_at
	}

	/// Encode the secret's leading entropy as a 12-word mnemonic
	fn encode_to_bip39_words(secret: &[u8; 32]) -> Result<[String; 12]> {
		use bip39::Mnemonic;

		// 12 words carry 128 bits of entropy: the first 16 secret bytes
		let entropy = &secret[..16];

		let mnemonic = Mnemonic::from_entropy(entropy)
			.map_err(|e| NetworkingError::Protocol(format!("BIP39 generation failed: {}", e)))?;

		let word_list: Vec<&str> = mnemonic.words().collect();
		if word_list.len() != 12 {
			return Err(NetworkingError::Protocol(format!(
				"Expected 12 words, got {}",
				word_list.len()
			)));
		}

		let words: Vec<String> = word_list.into_iter().map(String::from).collect();
		words
			.try_into()
			.map_err(|_| NetworkingError::Protocol("Failed to convert words to array".to_string()))
	}

	/// Decode BIP39 words back to the full 32-byte secret
	fn decode_from_bip39_words(words: &[String; 12]) -> Result<[u8; 32]> {
		use bip39::{Language, Mnemonic};

		let mnemonic_str = words.join(" ");

		let mnemonic = Mnemonic::parse_in(Language::English, &mnemonic_str)
			.map_err(|e| NetworkingError::Protocol(format!("Invalid BIP39 mnemonic: {}", e)))?;

		let entropy = mnemonic.to_entropy();
		if entropy.len() != 16 {
			return Err(NetworkingError::Protocol(format!(
				"Expected 16 bytes of entropy, got {}",
				entropy.len()
			)));
		}

		// Only 16 bytes survive the mnemonic round-trip; the rest is derived
		// deterministically so both sides reconstruct the same secret
		let mut full_secret = [0u8; 32];
		full_secret[..16].copy_from_slice(&entropy);

		let mut hasher = blake3::Hasher::new();
		hasher.update(b"cirrus-pairing-entropy-extension-v1");
		hasher.update(&entropy);
		let derived = hasher.finalize();
		full_secret[16..].copy_from_slice(&derived.as_bytes()[..16]);

		Ok(full_secret)
	}

	/// Derive the session id from the entropy that survives the BIP39
	/// round-trip
	fn derive_session_id(secret: &[u8; 32]) -> Uuid {
		let hash = blake3::hash(&secret[..16]);
		let mut uuid_bytes = [0u8; 16];
		uuid_bytes.copy_from_slice(&hash.as_bytes()[..16]);
		Uuid::from_bytes(uuid_bytes)
	}
}

impl std::fmt::Display for PairingCode {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.words.join(" "))
	}
}

/// State of a pairing session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingSession {
	pub id: Uuid,
	pub state: PairingState,
	pub remote_device_id: Option<Uuid>,
	pub remote_device_info: Option<DeviceInfo>,
	pub remote_public_key: Option<Vec<u8>>,
	pub shared_secret: Option<Vec<u8>>,
	pub created_at: DateTime<Utc>,
}

impl PairingSession {
	pub fn new(id: Uuid) -> Self {
		Self {
			id,
			state: PairingState::Scanning,
			remote_device_id: None,
			remote_device_info: None,
			remote_public_key: None,
			shared_secret: None,
			created_at: Utc::now(),
		}
	}

	pub fn is_expired(&self) -> bool {
		Utc::now().signed_duration_since(self.created_at) > Duration::minutes(PAIRING_TTL_MINUTES)
	}
}

impl std::fmt::Display for PairingSession {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(
			f,
			"PairingSession {{ id: {}, state: {}, remote_device_id: {:?}, shared_secret: {}, created_at: {} }}",
			self.id,
			self.state,
			self.remote_device_id,
			self.shared_secret.as_ref().map(|_| "[PRESENT]").unwrap_or("None"),
			self.created_at
		)
	}
}

/// States of the pairing process
///
/// Transitions only move forward; `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PairingState {
	/// Waiting for the counterpart to show up
	Scanning,
	/// Initiator sent its challenge and awaits the signed response
	ChallengeSent { challenge: Vec<u8> },
	/// Joiner answered the challenge and awaits completion confirmation
	ResponseSent,
	Completed,
	Failed { reason: String },
}

impl PairingState {
	pub fn is_terminal(&self) -> bool {
		matches!(self, PairingState::Completed | PairingState::Failed { .. })
	}
}

impl std::fmt::Display for PairingState {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			PairingState::ChallengeSent { challenge } => {
				write!(f, "ChallengeSent {{ challenge: {} bytes }}", challenge.len())
			}
			_ => write!(f, "{:?}", self),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn code_roundtrips_through_words() {
		let code = PairingCode::generate().unwrap();
		let parsed = PairingCode::from_string(&code.to_string()).unwrap();

		assert_eq!(code.secret(), parsed.secret());
		assert_eq!(code.session_id(), parsed.session_id());
	}

	#[test]
	fn code_roundtrips_through_qr_json() {
		let identity = crate::identity::NetworkIdentity::generate();
		let code = PairingCode::generate().unwrap().with_node_id(identity.node_id());
		let parsed = PairingCode::from_qr_json(&code.to_qr_json()).unwrap();

		assert_eq!(code.session_id(), parsed.session_id());
		assert_eq!(parsed.node_id(), Some(identity.node_id()));
	}

	#[test]
	fn rejects_wrong_word_count() {
		assert!(PairingCode::from_string("only three words").is_err());
		assert!(PairingCode::from_string("").is_err());
	}

	#[test]
	fn distinct_codes_have_distinct_session_ids() {
		let a = PairingCode::generate().unwrap();
		let b = PairingCode::generate().unwrap();

		assert_ne!(a.session_id(), b.session_id());
	}

	#[test]
	fn fresh_session_is_not_expired() {
		let session = PairingSession::new(Uuid::new_v4());

		assert!(!session.is_expired());
		assert!(!session.state.is_terminal());
		assert!(session.shared_secret.is_none());
	}

	#[test]
	fn terminal_states() {
		assert!(PairingState::Completed.is_terminal());
		assert!(PairingState::Failed {
			reason: "nope".to_string()
		}
		.is_terminal());
		assert!(!PairingState::ResponseSent.is_terminal());
	}

	#[test]
	fn display_redacts_shared_secret() {
		let mut session = PairingSession::new(Uuid::new_v4());
		session.shared_secret = Some(vec![1, 2, 3]);

		let rendered = session.to_string();
		assert!(rendered.contains("[PRESENT]"));
		assert!(!rendered.contains("1, 2, 3"));
	}
}

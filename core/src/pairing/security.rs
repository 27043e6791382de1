//! Challenge generation, replay protection and signature checks

use std::collections::HashMap;

use chrono::{DateTime, Duration, TimeZone, Utc};
use parking_lot::Mutex;
use thiserror::Error;
use uuid::Uuid;

use crate::error::{NetworkingError, Result};
use crate::identity;

/// Random prefix of a challenge
const CHALLENGE_NONCE_LEN: usize = 32;

/// Nonce plus the 8-byte big-endian issuance timestamp (unix millis)
pub const CHALLENGE_LEN: usize = CHALLENGE_NONCE_LEN + 8;

/// Challenges older than this are rejected outright
const CHALLENGE_TTL_MINUTES: i64 = 5;

/// Consumed challenges are remembered for this long to catch replays;
/// must stay longer than the challenge validity window
const CONSUMED_RETENTION_MINUTES: i64 = 10;

/// Ed25519 signature length
const SIGNATURE_LEN: usize = 64;

/// Ed25519 public key length
const PUBLIC_KEY_LEN: usize = 32;

/// Domain-separation label for session-key derivation. Changing it
/// invalidates every existing pairing.
const SESSION_KEY_CONTEXT: &str = "cirrus-pairing-session-key-v1";

/// Challenge verification failures
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
	#[error("Malformed challenge: expected {expected} bytes, got {actual}")]
	MalformedChallenge { expected: usize, actual: usize },

	#[error("Challenge issued outside the validity window")]
	ExpiredChallenge,

	#[error("Challenge has already been consumed")]
	ReplayedChallenge,
}

impl From<AuthError> for NetworkingError {
	fn from(err: AuthError) -> Self {
		match err {
			AuthError::ExpiredChallenge => NetworkingError::Expired(err.to_string()),
			AuthError::MalformedChallenge { .. } | AuthError::ReplayedChallenge => {
				NetworkingError::Crypto(err.to_string())
			}
		}
	}
}

/// Issues time-stamped challenges and rejects replayed or expired ones
#[derive(Default)]
pub struct ChallengeGuard {
	/// Consumed challenge values with their consumption time
	consumed: Mutex<HashMap<Vec<u8>, DateTime<Utc>>>,
}

impl ChallengeGuard {
	pub fn new() -> Self {
		Self::default()
	}

	/// 32 random bytes followed by the issuance timestamp
	pub fn generate() -> Vec<u8> {
		use rand::RngCore;

		let mut challenge = vec![0u8; CHALLENGE_NONCE_LEN];
		rand::thread_rng().fill_bytes(&mut challenge);
		challenge.extend_from_slice(&Utc::now().timestamp_millis().to_be_bytes());
		challenge
	}

	/// Accept a challenge value at most once, inside its validity window.
	///
	/// The consumption check and the record are a single critical section:
	/// two concurrent callers with the same value cannot both pass.
	pub fn verify_and_consume(&self, challenge: &[u8]) -> std::result::Result<(), AuthError> {
		if challenge.len() != CHALLENGE_LEN {
			return Err(AuthError::MalformedChallenge {
				expected: CHALLENGE_LEN,
				actual: challenge.len(),
			});
		}

		let mut ts_bytes = [0u8; 8];
		ts_bytes.copy_from_slice(&challenge[CHALLENGE_NONCE_LEN..]);
		let issued_at = Utc
			.timestamp_millis_opt(i64::from_be_bytes(ts_bytes))
			.single()
			.ok_or(AuthError::ExpiredChallenge)?;

		let now = Utc::now();
		if now.signed_duration_since(issued_at) > Duration::minutes(CHALLENGE_TTL_MINUTES) {
			return Err(AuthError::ExpiredChallenge);
		}

		let mut consumed = self.consumed.lock();
		if consumed.contains_key(challenge) {
			return Err(AuthError::ReplayedChallenge);
		}
		consumed.insert(challenge.to_vec(), now);

		// Evict entries past the retention window to bound memory
		let cutoff = now - Duration::minutes(CONSUMED_RETENTION_MINUTES);
		consumed.retain(|_, consumed_at| *consumed_at > cutoff);

		Ok(())
	}
}

/// Input validation and signature checks for the handshake
pub struct PairingSecurity;

impl PairingSecurity {
	pub fn validate_challenge(challenge: &[u8]) -> Result<()> {
		if challenge.len() != CHALLENGE_LEN {
			return Err(NetworkingError::Crypto(format!(
				"Invalid challenge length: expected {}, got {}",
				CHALLENGE_LEN,
				challenge.len()
			)));
		}
		Ok(())
	}

	pub fn validate_signature(signature: &[u8]) -> Result<()> {
		if signature.len() != SIGNATURE_LEN {
			return Err(NetworkingError::Crypto(format!(
				"Invalid signature length: expected {}, got {}",
				SIGNATURE_LEN,
				signature.len()
			)));
		}
		Ok(())
	}

	pub fn validate_public_key(public_key: &[u8]) -> Result<()> {
		if public_key.len() != PUBLIC_KEY_LEN {
			return Err(NetworkingError::Crypto(format!(
				"Invalid public key length: expected {}, got {}",
				PUBLIC_KEY_LEN,
				public_key.len()
			)));
		}
		Ok(())
	}

	/// Verify the joiner's signature over the original challenge bytes
	pub fn verify_challenge_response(
		public_key: &[u8],
		challenge: &[u8],
		signature: &[u8],
	) -> Result<bool> {
		Self::validate_public_key(public_key)?;
		Self::validate_signature(signature)?;
		identity::verify(public_key, challenge, signature)
	}
}

/// Derive the symmetric session key for one pairing session.
///
/// Folds a fixed protocol label, the session id and the pairing-code secret
/// through BLAKE3 in derive-key mode. The code secret is never used directly:
/// the key is bound to this session, not to the human-shared code.
pub fn derive_session_key(session_id: Uuid, code_secret: &[u8]) -> Vec<u8> {
	let mut hasher = blake3::Hasher::new_derive_key(SESSION_KEY_CONTEXT);
	hasher.update(session_id.as_bytes());
	hasher.update(code_secret);
	hasher.finalize().as_bytes().to_vec()
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::identity::NetworkIdentity;

	fn challenge_with_age(minutes: i64) -> Vec<u8> {
		let mut challenge = vec![7u8; CHALLENGE_NONCE_LEN];
		let issued = Utc::now() - Duration::minutes(minutes);
		challenge.extend_from_slice(&issued.timestamp_millis().to_be_bytes());
		challenge
	}

	#[test]
	fn generated_challenges_are_unique_and_sized() {
		let a = ChallengeGuard::generate();
		let b = ChallengeGuard::generate();

		assert_eq!(a.len(), CHALLENGE_LEN);
		assert_eq!(b.len(), CHALLENGE_LEN);
		assert_ne!(a[..CHALLENGE_NONCE_LEN], b[..CHALLENGE_NONCE_LEN]);
	}

	#[test]
	fn challenge_is_consumed_exactly_once() {
		let guard = ChallengeGuard::new();
		let challenge = ChallengeGuard::generate();

		assert_eq!(guard.verify_and_consume(&challenge), Ok(()));
		assert_eq!(
			guard.verify_and_consume(&challenge),
			Err(AuthError::ReplayedChallenge)
		);
	}

	#[test]
	fn expired_challenge_is_rejected() {
		let guard = ChallengeGuard::new();
		let challenge = challenge_with_age(6);

		assert_eq!(
			guard.verify_and_consume(&challenge),
			Err(AuthError::ExpiredChallenge)
		);
	}

	#[test]
	fn challenge_within_window_is_accepted() {
		let guard = ChallengeGuard::new();
		let challenge = challenge_with_age(4);

		assert_eq!(guard.verify_and_consume(&challenge), Ok(()));
	}

	#[test]
	fn malformed_challenge_is_rejected() {
		let guard = ChallengeGuard::new();

		assert_eq!(
			guard.verify_and_consume(&[1u8; 16]),
			Err(AuthError::MalformedChallenge {
				expected: CHALLENGE_LEN,
				actual: 16
			})
		);
	}

	#[test]
	fn signature_verification_roundtrip() {
		let identity = NetworkIdentity::generate();
		let challenge = ChallengeGuard::generate();
		let signature = identity.sign(&challenge);

		assert!(PairingSecurity::verify_challenge_response(
			&identity.public_key_bytes(),
			&challenge,
			&signature
		)
		.unwrap());

		let other = NetworkIdentity::generate();
		assert!(!PairingSecurity::verify_challenge_response(
			&other.public_key_bytes(),
			&challenge,
			&signature
		)
		.unwrap());
	}

	#[test]
	fn session_key_is_deterministic() {
		let session_id = Uuid::new_v4();
		let secret = [3u8; 32];

		assert_eq!(
			derive_session_key(session_id, &secret),
			derive_session_key(session_id, &secret)
		);
	}

	#[test]
	fn session_key_is_domain_separated() {
		let secret = [3u8; 32];
		let a = derive_session_key(Uuid::new_v4(), &secret);
		let b = derive_session_key(Uuid::new_v4(), &secret);

		// Same code, different sessions: the keys must differ
		assert_ne!(a, b);
		// And the key is never the raw code secret
		assert_ne!(a, secret.to_vec());
	}
}

//! Network identity used to authenticate pairing exchanges
//!
//! Each device holds an Ed25519 keypair whose public half doubles as its
//! transport node id. Challenges are signed with this key and verified by the
//! counterpart during the handshake.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use iroh::EndpointId as NodeId;
use serde::{Deserialize, Serialize};

use crate::error::{NetworkingError, Result};

/// Stable identity fingerprint advertised to peers in [`DeviceInfo`]
///
/// [`DeviceInfo`]: crate::device::DeviceInfo
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkFingerprint {
	/// Transport node id (the Ed25519 public key) as a string
	pub node_id: String,
	/// BLAKE3 hash of the public key, hex encoded
	pub public_key_hash: String,
}

/// Device keypair for signing pairing challenges
pub struct NetworkIdentity {
	signing_key: SigningKey,
	node_id: NodeId,
}

impl NetworkIdentity {
	/// Generate a fresh identity from a cryptographically secure source
	pub fn generate() -> Self {
		use rand::RngCore;

		let mut secret = [0u8; 32];
		rand::thread_rng().fill_bytes(&mut secret);
		Self::from_signing_key(SigningKey::from_bytes(&secret))
	}

	/// Restore an identity from a persisted 32-byte secret key
	pub fn from_secret_bytes(bytes: &[u8; 32]) -> Self {
		Self::from_signing_key(SigningKey::from_bytes(bytes))
	}

	fn from_signing_key(signing_key: SigningKey) -> Self {
		// An Ed25519 verifying key is always a valid node id
		let node_id = NodeId::from_bytes(&signing_key.verifying_key().to_bytes())
			.expect("verifying key is a valid node id");
		Self {
			signing_key,
			node_id,
		}
	}

	pub fn node_id(&self) -> NodeId {
		self.node_id
	}

	pub fn public_key_bytes(&self) -> [u8; 32] {
		self.signing_key.verifying_key().to_bytes()
	}

	/// Sign arbitrary bytes with the identity key
	pub fn sign(&self, data: &[u8]) -> Vec<u8> {
		self.signing_key.sign(data).to_bytes().to_vec()
	}

	pub fn network_fingerprint(&self) -> NetworkFingerprint {
		let public_key = self.public_key_bytes();
		NetworkFingerprint {
			node_id: self.node_id.to_string(),
			public_key_hash: hex::encode(blake3::hash(&public_key).as_bytes()),
		}
	}
}

/// Verify `signature` over `data` against a raw 32-byte Ed25519 public key
///
/// Returns `Ok(false)` for a well-formed but invalid signature; malformed key
/// or signature material is an error.
pub fn verify(public_key: &[u8], data: &[u8], signature: &[u8]) -> Result<bool> {
	let key_bytes: &[u8; 32] = public_key
		.try_into()
		.map_err(|_| NetworkingError::Crypto("Invalid public key length".to_string()))?;

	let verifying_key = VerifyingKey::from_bytes(key_bytes)
		.map_err(|e| NetworkingError::Crypto(format!("Invalid public key: {}", e)))?;

	let signature = Signature::from_slice(signature)
		.map_err(|e| NetworkingError::Crypto(format!("Invalid signature: {}", e)))?;

	Ok(verifying_key.verify(data, &signature).is_ok())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn sign_and_verify_roundtrip() {
		let identity = NetworkIdentity::generate();
		let signature = identity.sign(b"challenge bytes");

		assert!(verify(&identity.public_key_bytes(), b"challenge bytes", &signature).unwrap());
		assert!(!verify(&identity.public_key_bytes(), b"other bytes", &signature).unwrap());
	}

	#[test]
	fn verify_rejects_malformed_material() {
		let identity = NetworkIdentity::generate();
		let signature = identity.sign(b"data");

		assert!(verify(&[0u8; 16], b"data", &signature).is_err());
		assert!(verify(&identity.public_key_bytes(), b"data", &[0u8; 10]).is_err());
	}

	#[test]
	fn fingerprint_matches_node_id() {
		let identity = NetworkIdentity::generate();
		let fingerprint = identity.network_fingerprint();

		assert_eq!(fingerprint.node_id, identity.node_id().to_string());
		assert_eq!(fingerprint.public_key_hash.len(), 64);
	}

	#[test]
	fn restored_identity_keeps_node_id() {
		let identity = NetworkIdentity::generate();
		let restored = NetworkIdentity::from_secret_bytes(&identity.signing_key.to_bytes());

		assert_eq!(identity.node_id(), restored.node_id());
	}
}

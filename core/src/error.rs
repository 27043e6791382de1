//! Error types for the pairing core

use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by the pairing protocol and its collaborators
#[derive(Debug, Error)]
pub enum NetworkingError {
	/// Structural protocol violation (wrong state for a message, missing
	/// prior state, oversized frame). Terminal for the session.
	#[error("Protocol error: {0}")]
	Protocol(String),

	/// Signature verification failure or malformed cryptographic material
	#[error("Crypto error: {0}")]
	Crypto(String),

	/// Session id collision on creation; the session is already being paired
	#[error("Pairing session {0} already exists")]
	Conflict(Uuid),

	/// Challenge or session past its validity window; pairing must restart
	#[error("Expired: {0}")]
	Expired(String),

	#[error("Serialization error: {0}")]
	Serialization(#[from] serde_json::Error),

	#[error("Transport error: {0}")]
	Transport(String),

	#[error("Connection failed: {0}")]
	ConnectionFailed(String),

	#[error("Device not found: {0}")]
	DeviceNotFound(Uuid),

	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, NetworkingError>;

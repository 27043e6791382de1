//! Device-pairing protocol core for Cirrus
//!
//! Implements the challenge-response handshake that two devices run to
//! establish a shared session key and register each other in the device
//! registry. The initiator ("Alice") is the device that generated the pairing
//! code; the joiner ("Bob") is the device that scanned it.
//!
//! The handshake runs over a persistent multiplexed connection (see
//! [`transport`]), one fresh bidirectional stream per message exchange:
//!
//! ```text
//! Joiner                          Initiator
//!   | -- PairingRequest ------------> |
//!   | <------------------- Challenge |
//!   | -- Response ------------------> |  (verify signature, commit registry)
//!   | <-------------------- Complete |  (only now does the joiner commit)
//! ```
//!
//! The initiator commits its registry state before confirming, and the joiner
//! commits only after receiving that confirmation. Whenever the joiner
//! reaches `Completed`, the initiator already has - the two sides can never
//! disagree about a successful pairing.

pub mod device;
pub mod error;
pub mod identity;
pub mod pairing;
pub mod transport;

pub use error::{NetworkingError, Result};
pub use pairing::{PairingCode, PairingMessage, PairingProtocolHandler, PairingSession, PairingState};

//! Device registry for centralized state management
//!
//! The durable store of known devices and their connection state. The pairing
//! protocol only requests transitions on it (`start_pairing` →
//! `complete_pairing` → `mark_connected`); it never mutates records directly.

use std::collections::HashMap;

use chrono::Utc;
use iroh::{EndpointAddr as NodeAddr, EndpointId as NodeId};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{ConnectionInfo, DeviceInfo, DeviceState, DisconnectionReason, SessionKeys};
use crate::error::{NetworkingError, Result};

/// Central registry for all device state and connections
#[derive(Default)]
pub struct DeviceRegistry {
	/// Map of device id to current state
	devices: HashMap<Uuid, DeviceState>,

	/// Map of node id to device id for quick lookup
	node_to_device: HashMap<NodeId, Uuid>,

	/// Map of pairing session id to device id
	session_to_device: HashMap<Uuid, Uuid>,
}

impl DeviceRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Record a device seen on the network before any pairing
	pub fn add_discovered_node(&mut self, device_id: Uuid, node_id: NodeId, node_addr: NodeAddr) {
		let state = DeviceState::Discovered {
			node_id,
			node_addr,
			discovered_at: Utc::now(),
		};

		self.devices.insert(device_id, state);
		self.node_to_device.insert(node_id, device_id);
	}

	/// Register a pairing in progress for a device
	pub fn start_pairing(
		&mut self,
		device_id: Uuid,
		node_id: NodeId,
		session_id: Uuid,
		node_addr: NodeAddr,
	) -> Result<()> {
		let state = DeviceState::Pairing {
			node_id,
			session_id,
			node_addr,
			started_at: Utc::now(),
		};

		self.devices.insert(device_id, state);
		self.node_to_device.insert(node_id, device_id);
		self.session_to_device.insert(session_id, device_id);

		Ok(())
	}

	/// Commit a completed pairing with the derived session keys
	pub fn complete_pairing(
		&mut self,
		device_id: Uuid,
		info: DeviceInfo,
		session_keys: SessionKeys,
	) -> Result<()> {
		let node_id = info
			.network_fingerprint
			.node_id
			.parse::<NodeId>()
			.map_err(|e| {
				NetworkingError::Protocol(format!("Invalid node id in network fingerprint: {}", e))
			})?;

		// Record the mapping so the device can be found for messaging
		self.node_to_device.insert(node_id, device_id);

		let state = DeviceState::Paired {
			info: info.clone(),
			session_keys,
			paired_at: Utc::now(),
		};
		self.devices.insert(device_id, state);

		info!(
			device = %info.device_name,
			device_id = %device_id,
			"Paired device"
		);

		Ok(())
	}

	/// Mark a paired device as connected
	pub fn mark_connected(&mut self, device_id: Uuid, connection: ConnectionInfo) -> Result<()> {
		let current_state = self
			.devices
			.get(&device_id)
			.ok_or(NetworkingError::DeviceNotFound(device_id))?;

		let (info, session_keys) = match current_state {
			DeviceState::Paired {
				info, session_keys, ..
			}
			| DeviceState::Disconnected {
				info, session_keys, ..
			} => (info.clone(), session_keys.clone()),
			DeviceState::Connected { .. } => {
				debug!(device_id = %device_id, "Device already connected");
				return Ok(());
			}
			DeviceState::Discovered { .. } | DeviceState::Pairing { .. } => {
				return Err(NetworkingError::Protocol(
					"Cannot connect to unpaired device".to_string(),
				));
			}
		};

		let state = DeviceState::Connected {
			info,
			session_keys,
			connection,
			connected_at: Utc::now(),
		};
		self.devices.insert(device_id, state);

		Ok(())
	}

	/// Mark a connected device as disconnected, keeping its keys
	pub fn mark_disconnected(
		&mut self,
		device_id: Uuid,
		reason: DisconnectionReason,
	) -> Result<()> {
		let current_state = self
			.devices
			.get(&device_id)
			.ok_or(NetworkingError::DeviceNotFound(device_id))?;

		let (info, session_keys) = match current_state {
			DeviceState::Connected {
				info, session_keys, ..
			}
			| DeviceState::Paired {
				info, session_keys, ..
			} => (info.clone(), session_keys.clone()),
			_ => {
				return Err(NetworkingError::Protocol(
					"Cannot disconnect device that isn't connected".to_string(),
				));
			}
		};

		let state = DeviceState::Disconnected {
			info,
			session_keys,
			last_seen: Utc::now(),
			reason,
		};
		self.devices.insert(device_id, state);

		Ok(())
	}

	pub fn get_device_state(&self, device_id: Uuid) -> Option<&DeviceState> {
		self.devices.get(&device_id)
	}

	pub fn get_device_by_node(&self, node_id: NodeId) -> Option<Uuid> {
		self.node_to_device.get(&node_id).copied()
	}

	pub fn get_device_by_session(&self, session_id: Uuid) -> Option<Uuid> {
		self.session_to_device.get(&session_id).copied()
	}

	pub fn get_node_id_for_device(&self, device_id: Uuid) -> Option<NodeId> {
		self.node_to_device
			.iter()
			.find(|(_, dev_id)| **dev_id == device_id)
			.map(|(node_id, _)| *node_id)
	}

	/// Session keys for a device, in any state that holds them
	pub fn get_session_keys(&self, device_id: Uuid) -> Option<SessionKeys> {
		match self.devices.get(&device_id) {
			Some(DeviceState::Paired { session_keys, .. })
			| Some(DeviceState::Connected { session_keys, .. })
			| Some(DeviceState::Disconnected { session_keys, .. }) => Some(session_keys.clone()),
			_ => None,
		}
	}

	pub fn get_all_devices(&self) -> Vec<(Uuid, DeviceState)> {
		self.devices
			.iter()
			.map(|(id, state)| (*id, state.clone()))
			.collect()
	}

	pub fn get_connected_devices(&self) -> Vec<DeviceInfo> {
		self.devices
			.values()
			.filter_map(|state| match state {
				DeviceState::Connected { info, .. } => Some(info.clone()),
				_ => None,
			})
			.collect()
	}

	/// All paired devices, including currently disconnected ones
	pub fn get_paired_devices(&self) -> Vec<DeviceInfo> {
		self.devices
			.values()
			.filter_map(|state| match state {
				DeviceState::Paired { info, .. }
				| DeviceState::Connected { info, .. }
				| DeviceState::Disconnected { info, .. } => Some(info.clone()),
				_ => None,
			})
			.collect()
	}

	/// Remove a device and all lookup mappings pointing at it
	pub fn remove_device(&mut self, device_id: Uuid) -> Result<()> {
		if let Some(state) = self.devices.remove(&device_id) {
			match &state {
				DeviceState::Discovered { node_id, .. } | DeviceState::Pairing { node_id, .. } => {
					self.node_to_device.remove(node_id);
				}
				DeviceState::Paired { info, .. }
				| DeviceState::Connected { info, .. }
				| DeviceState::Disconnected { info, .. } => {
					if let Ok(node_id) = info.network_fingerprint.node_id.parse::<NodeId>() {
						self.node_to_device.remove(&node_id);
					}
				}
			}

			if let DeviceState::Pairing { session_id, .. } = &state {
				self.session_to_device.remove(session_id);
			}
		}

		Ok(())
	}

	/// Drop abandoned pairing entries and long-disconnected devices
	pub fn cleanup_expired(&mut self) {
		let now = Utc::now();
		let mut to_remove = Vec::new();
		let mut session_mappings_to_remove = Vec::new();

		for (device_id, state) in &self.devices {
			match state {
				DeviceState::Pairing {
					started_at,
					session_id,
					..
				} => {
					if now.signed_duration_since(*started_at).num_minutes() > 10 {
						to_remove.push(*device_id);
						session_mappings_to_remove.push(*session_id);
					}
				}
				DeviceState::Disconnected { last_seen, .. } => {
					if now.signed_duration_since(*last_seen).num_days() > 7 {
						to_remove.push(*device_id);
					}
				}
				DeviceState::Paired { .. } | DeviceState::Connected { .. } => {
					// Pairing finished; the session mapping is no longer needed
					for (session_id, dev_id) in &self.session_to_device {
						if dev_id == device_id {
							session_mappings_to_remove.push(*session_id);
						}
					}
				}
				_ => {}
			}
		}

		for device_id in to_remove {
			if let Err(e) = self.remove_device(device_id) {
				warn!(device_id = %device_id, error = %e, "Failed to remove expired device");
			}
		}

		for session_id in session_mappings_to_remove {
			self.session_to_device.remove(&session_id);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::device::DeviceType;
	use crate::identity::NetworkIdentity;
	use chrono::Duration;

	fn test_device(identity: &NetworkIdentity) -> DeviceInfo {
		DeviceInfo {
			device_id: Uuid::new_v4(),
			device_name: "Test Device".to_string(),
			device_type: DeviceType::Desktop,
			os_version: "linux".to_string(),
			app_version: "0.3.0".to_string(),
			network_fingerprint: identity.network_fingerprint(),
			capabilities: vec![],
			last_seen: Utc::now(),
		}
	}

	#[test]
	fn pairing_lifecycle() {
		let identity = NetworkIdentity::generate();
		let info = test_device(&identity);
		let device_id = info.device_id;
		let session_id = Uuid::new_v4();
		let node_id = identity.node_id();

		let mut registry = DeviceRegistry::new();
		registry
			.start_pairing(device_id, node_id, session_id, NodeAddr::new(node_id))
			.unwrap();
		assert!(matches!(
			registry.get_device_state(device_id),
			Some(DeviceState::Pairing { .. })
		));
		assert_eq!(registry.get_device_by_session(session_id), Some(device_id));

		let keys = SessionKeys::from_shared_secret(&[9u8; 32]).unwrap();
		registry.complete_pairing(device_id, info, keys).unwrap();
		assert!(matches!(
			registry.get_device_state(device_id),
			Some(DeviceState::Paired { .. })
		));
		assert!(registry.get_session_keys(device_id).is_some());

		registry
			.mark_connected(device_id, ConnectionInfo::default())
			.unwrap();
		assert!(matches!(
			registry.get_device_state(device_id),
			Some(DeviceState::Connected { .. })
		));
		assert_eq!(registry.get_device_by_node(node_id), Some(device_id));
		assert_eq!(registry.get_node_id_for_device(device_id), Some(node_id));
		assert_eq!(registry.get_connected_devices().len(), 1);

		registry
			.mark_disconnected(device_id, DisconnectionReason::Graceful)
			.unwrap();
		assert!(matches!(
			registry.get_device_state(device_id),
			Some(DeviceState::Disconnected { .. })
		));
		// Keys survive the disconnect
		assert!(registry.get_session_keys(device_id).is_some());
	}

	#[test]
	fn cannot_connect_unpaired_device() {
		let identity = NetworkIdentity::generate();
		let device_id = Uuid::new_v4();
		let node_id = identity.node_id();

		let mut registry = DeviceRegistry::new();
		registry.add_discovered_node(device_id, node_id, NodeAddr::new(node_id));
		assert!(registry
			.mark_connected(device_id, ConnectionInfo::default())
			.is_err());

		registry
			.start_pairing(device_id, node_id, Uuid::new_v4(), NodeAddr::new(node_id))
			.unwrap();
		assert!(registry
			.mark_connected(device_id, ConnectionInfo::default())
			.is_err());
	}

	#[test]
	fn cleanup_removes_stale_pairing() {
		let identity = NetworkIdentity::generate();
		let device_id = Uuid::new_v4();
		let session_id = Uuid::new_v4();
		let node_id = identity.node_id();

		let mut registry = DeviceRegistry::new();
		registry
			.start_pairing(device_id, node_id, session_id, NodeAddr::new(node_id))
			.unwrap();

		// Back-date the pairing entry past the 10 minute window
		if let Some(DeviceState::Pairing { started_at, .. }) = registry.devices.get_mut(&device_id)
		{
			*started_at = Utc::now() - Duration::minutes(11);
		}

		registry.cleanup_expired();
		assert!(registry.get_device_state(device_id).is_none());
		assert_eq!(registry.get_device_by_session(session_id), None);
	}
}

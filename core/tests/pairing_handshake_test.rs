//! End-to-end pairing handshake tests
//!
//! Runs both roles against each other over the in-memory transport, with the
//! initiator serving inbound streams the way the production accept loop does.

use std::sync::Arc;

use chrono::Utc;
use pretty_assertions::assert_eq;
use tokio::sync::RwLock;
use uuid::Uuid;

use cirrus_pairing::device::{DeviceInfo, DeviceRegistry, DeviceState, DeviceType};
use cirrus_pairing::identity::NetworkIdentity;
use cirrus_pairing::pairing::{PairingCode, PairingState};
use cirrus_pairing::transport::memory::{MemoryHub, MemoryTransport};
use cirrus_pairing::transport::{NodeAddr, NodeId};
use cirrus_pairing::PairingProtocolHandler;

struct TestPeer {
	handler: Arc<PairingProtocolHandler>,
	registry: Arc<RwLock<DeviceRegistry>>,
	transport: Arc<MemoryTransport>,
	node_id: NodeId,
	device_id: Uuid,
}

fn make_peer(hub: &Arc<MemoryHub>, name: &str) -> TestPeer {
	let identity = NetworkIdentity::generate();
	let node_id = identity.node_id();
	let device_id = Uuid::new_v4();

	let local_device = DeviceInfo {
		device_id,
		device_name: name.to_string(),
		device_type: DeviceType::Laptop,
		os_version: "linux".to_string(),
		app_version: "0.3.0".to_string(),
		network_fingerprint: identity.network_fingerprint(),
		capabilities: vec!["sync".to_string()],
		last_seen: Utc::now(),
	};

	let registry = Arc::new(RwLock::new(DeviceRegistry::new()));
	let transport = Arc::new(MemoryTransport::new(hub.clone(), node_id));
	let handler = Arc::new(PairingProtocolHandler::new(
		identity,
		local_device,
		registry.clone(),
		transport.clone(),
	));

	TestPeer {
		handler,
		registry,
		transport,
		node_id,
		device_id,
	}
}

/// Serve inbound streams for this peer, like the production accept loop
async fn serve(peer: &TestPeer) {
	let handler = peer.handler.clone();
	peer.transport
		.bind(Arc::new(move |send, recv, remote_node_id| {
			let handler = handler.clone();
			tokio::spawn(async move {
				// Handshake failures surface through session state
				let _ = handler.handle_stream(send, recv, remote_node_id).await;
			});
		}))
		.await;
}

#[tokio::test]
async fn full_handshake_completes_both_sides() {
	let hub = MemoryHub::new();
	let initiator = make_peer(&hub, "Alice's Desktop");
	let joiner = make_peer(&hub, "Bob's Laptop");
	serve(&initiator).await;

	let code = initiator.handler.start_pairing_session().await.unwrap();
	let session_id = code.session_id();

	// The joiner re-parses the code from its word form, like a real user
	let joiner_code = PairingCode::from_string(&code.to_string()).unwrap();
	let paired_session = joiner
		.handler
		.pair_with(NodeAddr::new(initiator.node_id), joiner_code)
		.await
		.unwrap();
	assert_eq!(paired_session, session_id);

	// Both sides reached Completed with the same derived secret
	let initiator_session = initiator.handler.get_session(session_id).await.unwrap();
	let joiner_session = joiner.handler.get_session(session_id).await.unwrap();
	assert!(matches!(initiator_session.state, PairingState::Completed));
	assert!(matches!(joiner_session.state, PairingState::Completed));
	assert!(initiator_session.shared_secret.is_some());
	assert_eq!(
		initiator_session.shared_secret,
		joiner_session.shared_secret
	);

	// Each registry shows the counterpart connected, with session keys
	{
		let registry = initiator.registry.read().await;
		assert!(matches!(
			registry.get_device_state(joiner.device_id),
			Some(DeviceState::Connected { .. })
		));
		assert!(registry.get_session_keys(joiner.device_id).is_some());
		assert_eq!(
			registry.get_device_by_node(joiner.node_id),
			Some(joiner.device_id)
		);
	}
	{
		let registry = joiner.registry.read().await;
		assert!(matches!(
			registry.get_device_state(initiator.device_id),
			Some(DeviceState::Connected { .. })
		));
		assert!(registry.get_session_keys(initiator.device_id).is_some());
	}
}

#[tokio::test]
async fn mismatched_code_is_rejected_and_nothing_commits() {
	let hub = MemoryHub::new();
	let initiator = make_peer(&hub, "Alice's Desktop");
	let joiner = make_peer(&hub, "Bob's Laptop");
	serve(&initiator).await;

	// The initiator advertises one code, the joiner types in another; the
	// session ids diverge so the initiator has no session for the request
	initiator.handler.start_pairing_session().await.unwrap();
	let wrong_code = PairingCode::generate().unwrap();
	let wrong_session = wrong_code.session_id();

	let result = joiner
		.handler
		.pair_with(NodeAddr::new(initiator.node_id), wrong_code)
		.await;
	assert!(result.is_err());

	let session = joiner.handler.get_session(wrong_session).await.unwrap();
	assert!(matches!(session.state, PairingState::Failed { .. }));

	assert!(joiner.registry.read().await.get_all_devices().is_empty());
	assert!(initiator.registry.read().await.get_all_devices().is_empty());
}

#[tokio::test]
async fn pairing_with_unknown_peer_fails_cleanly() {
	let hub = MemoryHub::new();
	let joiner = make_peer(&hub, "Bob's Laptop");

	// Nobody is bound on the hub for this node id
	let ghost = NetworkIdentity::generate();
	let code = PairingCode::generate().unwrap();
	let session_id = code.session_id();

	let result = joiner
		.handler
		.pair_with(NodeAddr::new(ghost.node_id()), code)
		.await;
	assert!(result.is_err());

	let session = joiner.handler.get_session(session_id).await.unwrap();
	assert!(matches!(session.state, PairingState::Failed { .. }));
}

#[tokio::test]
async fn sessions_survive_restart_via_persistence() {
	let data_dir = tempfile::TempDir::new().unwrap();
	let hub = MemoryHub::new();

	let first = make_peer(&hub, "Alice's Desktop");
	let handler = PairingProtocolHandler::with_persistence(
		NetworkIdentity::generate(),
		first.handler.device_info(),
		first.registry.clone(),
		first.transport.clone(),
		data_dir.path().to_path_buf(),
	);
	let code = handler.start_pairing_session().await.unwrap();

	// A "restarted" handler pointed at the same data dir sees the session
	let second = make_peer(&hub, "Alice's Desktop");
	let restarted = PairingProtocolHandler::with_persistence(
		NetworkIdentity::generate(),
		second.handler.device_info(),
		second.registry.clone(),
		second.transport.clone(),
		data_dir.path().to_path_buf(),
	);
	assert_eq!(restarted.load_persisted_sessions().await.unwrap(), 1);

	let session = restarted.get_session(code.session_id()).await.unwrap();
	assert!(matches!(session.state, PairingState::Scanning));
}

#[tokio::test]
async fn sessions_can_be_cancelled_and_cleaned_up() {
	let hub = MemoryHub::new();
	let initiator = make_peer(&hub, "Alice's Desktop");

	let code = initiator.handler.start_pairing_session().await.unwrap();
	let session_id = code.session_id();
	assert_eq!(initiator.handler.get_active_sessions().await.len(), 1);

	initiator.handler.cancel_session(session_id).await.unwrap();
	assert!(initiator.handler.get_session(session_id).await.is_none());

	// A fresh session survives the expiry sweep
	initiator.handler.start_pairing_session().await.unwrap();
	assert_eq!(initiator.handler.cleanup_expired_sessions().await.unwrap(), 0);
	assert_eq!(initiator.handler.get_active_sessions().await.len(), 1);
}

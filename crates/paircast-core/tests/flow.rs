//! Integration tests for pairing and control flows.

use std::sync::Arc;

use paircast_core::engine::{PairingEngine, PairingEvent};
use paircast_core::harness::{make_peer, run_pairing_flow, TestPeer};
use paircast_core::relay::MemoryRelay;
use paircast_core::secret_store::MemorySecretStore;
use paircast_core::{CoreError, EngineConfig};
use paircast_proto::jsonrpc::methods;
use paircast_proto::types::{
    AppMetadata, JsonRpcPermissions, PairingState, ProposedPermissions, Reason,
};

#[tokio::test]
async fn test_pairing_flow() {
    let hub = MemoryRelay::new_shared();
    run_pairing_flow(&hub)
        .await
        .expect("pairing flow should succeed");
}

#[tokio::test]
async fn test_settled_permissions_default_to_session_propose() {
    let hub = MemoryRelay::new_shared();
    let (proposer, responder, topic) = run_pairing_flow(&hub).await.unwrap();

    for peer in [&proposer, &responder] {
        let sequence = peer.engine.sequence(&topic).await.unwrap();
        let settled = sequence.settled().unwrap();
        assert_eq!(
            settled.permissions.jsonrpc.methods,
            vec![methods::SESSION_PROPOSE.to_string()]
        );
    }
}

#[tokio::test]
async fn test_update_flow() {
    let hub = MemoryRelay::new_shared();
    let (mut proposer, mut responder, topic) = run_pairing_flow(&hub).await.unwrap();

    let new_state = PairingState {
        metadata: Some(AppMetadata {
            name: "Example Wallet".to_string(),
            description: Some("renamed".to_string()),
            url: None,
            icons: Vec::new(),
        }),
    };

    // the responder holds the controller role in the harness flow
    responder
        .engine
        .update(&topic, new_state.clone())
        .await
        .expect("controller update should succeed");
    proposer.pump().await;
    responder.pump().await;

    let sequence = proposer.engine.sequence(&topic).await.unwrap();
    assert_eq!(sequence.settled().unwrap().state, new_state);
    assert!(proposer
        .events()
        .iter()
        .any(|e| matches!(e, PairingEvent::Updated { state, .. } if *state == new_state)));

    // the proposer is not the controller and must be refused locally
    let err = proposer
        .engine
        .update(&topic, PairingState::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Sequence(_)));
}

#[tokio::test]
async fn test_upgrade_flow() {
    let hub = MemoryRelay::new_shared();
    let (mut proposer, mut responder, topic) = run_pairing_flow(&hub).await.unwrap();

    let wider = ProposedPermissions {
        jsonrpc: JsonRpcPermissions {
            methods: vec![
                methods::SESSION_PROPOSE.to_string(),
                "wc_customCall".to_string(),
            ],
        },
    };
    responder
        .engine
        .upgrade(&topic, wider.clone())
        .await
        .expect("controller upgrade should succeed");
    proposer.pump().await;
    responder.pump().await;

    for peer in [&proposer, &responder] {
        let sequence = peer.engine.sequence(&topic).await.unwrap();
        assert_eq!(
            sequence.settled().unwrap().permissions.jsonrpc.methods,
            wider.jsonrpc.methods
        );
    }
    assert!(proposer
        .events()
        .iter()
        .any(|e| matches!(e, PairingEvent::Upgraded { .. })));
}

#[tokio::test]
async fn test_ping_flow() {
    let hub = MemoryRelay::new_shared();
    let (mut proposer, mut responder, topic) = run_pairing_flow(&hub).await.unwrap();

    proposer.engine.ping(&topic).await.unwrap();
    responder.pump().await;
    proposer.pump().await;

    assert!(responder
        .events()
        .iter()
        .any(|e| matches!(e, PairingEvent::Ping { .. })));
    assert!(proposer
        .events()
        .iter()
        .any(|e| matches!(e, PairingEvent::PingResult { ok: true, .. })));
}

#[tokio::test]
async fn test_delete_flow() {
    let hub = MemoryRelay::new_shared();
    let (mut proposer, mut responder, topic) = run_pairing_flow(&hub).await.unwrap();

    responder
        .engine
        .delete(
            &topic,
            Reason {
                code: 6000,
                message: "user disconnected".to_string(),
            },
        )
        .await
        .unwrap();
    proposer.pump().await;

    assert!(proposer.events().iter().any(|e| matches!(
        e,
        PairingEvent::Deleted { reason, .. } if reason.message == "user disconnected"
    )));
    assert!(proposer.engine.sequence(&topic).await.is_none());
    assert!(responder.engine.sequence(&topic).await.is_none());

    // the pairing is gone on both sides
    for peer in [&proposer, &responder] {
        let err = peer.engine.ping(&topic).await.unwrap_err();
        assert!(matches!(err, CoreError::NoMatchingSequence(_)));
    }
}

#[tokio::test]
async fn test_reject_flow() {
    let hub = MemoryRelay::new_shared();
    let mut proposer = make_peer(&hub, false);
    let responder = make_peer(&hub, true);

    let uri = proposer.engine.propose().await.unwrap();
    responder
        .engine
        .reject(&uri.to_string(), "user declined")
        .await
        .unwrap();
    proposer.pump().await;

    assert!(proposer.events().iter().any(|e| matches!(
        e,
        PairingEvent::Rejected { reason, .. } if reason == "user declined"
    )));
    assert!(proposer.engine.sequence(&uri.topic).await.is_none());
    // rejecting creates no state on the responder
    assert!(responder.engine.topics().await.is_empty());
}

#[tokio::test]
async fn test_responder_metadata_reaches_proposer() {
    let hub = MemoryRelay::new_shared();
    let mut proposer = make_peer(&hub, false);

    let config = EngineConfig {
        controller: true,
        metadata: Some(AppMetadata {
            name: "Example Wallet".to_string(),
            description: Some("integration fixture".to_string()),
            url: Some("https://wallet.example".to_string()),
            icons: vec!["https://wallet.example/icon.png".to_string()],
        }),
        ..EngineConfig::default()
    };
    let (engine, handles) = PairingEngine::new(
        config,
        MemorySecretStore::new_shared(),
        Arc::new(hub.client()),
    );
    let mut responder = TestPeer { engine, handles };

    let uri = proposer.engine.propose().await.unwrap();
    let topic = responder.engine.pair(&uri.to_string()).await.unwrap();
    proposer.pump().await;
    responder.pump().await;

    let sequence = proposer.engine.sequence(&topic).await.unwrap();
    let metadata = sequence
        .settled()
        .unwrap()
        .state
        .metadata
        .clone()
        .expect("metadata should be carried in the approval");
    assert_eq!(metadata.name, "Example Wallet");
    assert_eq!(metadata.url.as_deref(), Some("https://wallet.example"));
}

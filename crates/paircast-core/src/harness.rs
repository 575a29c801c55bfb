//! Test harness for pairing flows.
//!
//! Wires engines to one in-memory relay hub and pumps their inbound
//! queues on demand. Integration tests build scenarios on top of
//! [`run_pairing_flow`].

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use paircast_proto::types::Topic;

use crate::config::EngineConfig;
use crate::engine::{EngineHandles, PairingEngine, PairingEvent};
use crate::errors::CoreError;
use crate::relay::{MemoryRelay, MemoryRelayClient};
use crate::secret_store::MemorySecretStore;

/// How long a pump waits for further traffic before deciding the line
/// is quiet.
const PUMP_IDLE: Duration = Duration::from_millis(50);

/// One engine plus the channels to drive it.
pub struct TestPeer {
    pub engine: PairingEngine<MemorySecretStore, MemoryRelayClient>,
    pub handles: EngineHandles,
}

impl TestPeer {
    /// Deliver queued relay traffic until the line goes quiet.
    pub async fn pump(&mut self) {
        while let Ok(Some(message)) = timeout(PUMP_IDLE, self.handles.inbound.recv()).await {
            self.engine.handle_inbound(message).await;
        }
    }

    /// Drain buffered events without waiting.
    pub fn events(&mut self) -> Vec<PairingEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.handles.events.try_recv() {
            events.push(event);
        }
        events
    }
}

/// Build a peer attached to the hub.
pub fn make_peer(hub: &Arc<MemoryRelay>, controller: bool) -> TestPeer {
    let config = EngineConfig {
        controller,
        ..EngineConfig::default()
    };
    let (engine, handles) = PairingEngine::new(
        config,
        MemorySecretStore::new_shared(),
        Arc::new(hub.client()),
    );
    TestPeer { engine, handles }
}

/// Run a complete pairing flow between a proposer and a responder.
///
/// 1. The proposer creates a pairing URI
/// 2. The responder pairs from the URI and sends the approval
/// 3. The proposer settles on the derived topic and confirms
/// 4. The responder acknowledges
///
/// The proposer defers the controller role, so the responder holds it.
/// Returns both peers and the settled topic, with both sides verified
/// acknowledged.
pub async fn run_pairing_flow(
    hub: &Arc<MemoryRelay>,
) -> Result<(TestPeer, TestPeer, Topic), CoreError> {
    let mut proposer = make_peer(hub, false);
    let mut responder = make_peer(hub, true);

    let uri = proposer.engine.propose().await?;
    let settled_topic = responder.engine.pair(&uri.to_string()).await?;

    proposer.pump().await;
    responder.pump().await;

    for peer in [&proposer, &responder] {
        let sequence = peer
            .engine
            .sequence(&settled_topic)
            .await
            .ok_or_else(|| CoreError::NoMatchingSequence(settled_topic.clone()))?;
        assert_eq!(sequence.status_label(), "acknowledged");
    }

    Ok((proposer, responder, settled_topic))
}

//! Pairing engine.
//!
//! Orchestrates the full pairing lifecycle over a relay: proposing,
//! settling on a derived topic, and the control traffic that follows
//! (update, upgrade, delete, ping, session proposals).
//!
//! Wire rule: traffic on a topic with a stored agreement secret is sealed
//! as `iv || AES-256-CBC(json)`; traffic on the public proposal topic is
//! plaintext JSON, since no shared key exists before settlement and the
//! approval carries only public data.
//!
//! Everything arriving from the relay is untrusted. Decode or transition
//! failures never propagate out of [`PairingEngine::handle_inbound`]; the
//! message is counted, logged, and discarded.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use serde_json::{json, Value};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use paircast_crypto::envelope;
use paircast_proto::jsonrpc::{methods, Payload, Request, Response};
use paircast_proto::params::{
    ApprovalParams, DeleteParams, PingParams, RejectParams, UpdateParams, UpgradeParams,
};
use paircast_proto::types::{
    PairingState, Participant, ProposedPermissions, Reason, SettledPermissions, Topic,
};
use paircast_proto::uri::PairingUri;

use crate::config::EngineConfig;
use crate::errors::{CoreError, SequenceError};
use crate::key_management::KeyManagement;
use crate::registry::SequenceRegistry;
use crate::relay::{Relay, RelayMessage};
use crate::secret_store::SecretStore;
use crate::sequence::{resolve_controller, PairingSequence, PendingStatus, SettledStatus};
use crate::unix_now;

// ============================================================================
// Events
// ============================================================================

/// Notifications for the application layer.
#[derive(Debug, Clone)]
pub enum PairingEvent {
    /// A pairing reached mutual acknowledgement.
    Settled { topic: Topic },
    /// The peer rejected our proposal or refused our approval.
    Rejected { topic: Topic, reason: String },
    /// The peer replaced the shared state.
    Updated { topic: Topic, state: PairingState },
    /// The peer widened the permitted methods.
    Upgraded {
        topic: Topic,
        permissions: ProposedPermissions,
    },
    /// The peer deleted the pairing.
    Deleted { topic: Topic, reason: Reason },
    /// The peer pinged us.
    Ping { topic: Topic },
    /// A ping we sent completed.
    PingResult { topic: Topic, ok: bool },
    /// A session proposal arrived on an acknowledged pairing.
    SessionProposal { topic: Topic, id: u64, params: Value },
    /// Another permitted request arrived on an acknowledged pairing.
    Rpc {
        topic: Topic,
        id: u64,
        method: String,
        params: Value,
    },
    /// A permitted request we sent got its response.
    RpcResult {
        topic: Topic,
        id: u64,
        result: Option<Value>,
        error: Option<String>,
    },
}

// ============================================================================
// Dispatch statistics
// ============================================================================

/// Counters for inbound relay traffic.
#[derive(Debug, Default)]
pub struct DispatchStats {
    /// Total messages received.
    pub received: AtomicU64,
    /// Messages handled to completion.
    pub dispatched: AtomicU64,
    /// Messages discarded for any reason.
    pub dropped: AtomicU64,
    /// Messages discarded because the envelope would not open.
    pub decryption_failures: AtomicU64,
    /// Messages discarded because no live sequence matched the topic.
    pub no_matching_sequence: AtomicU64,
}

impl DispatchStats {
    pub fn snapshot(&self) -> DispatchStatsSnapshot {
        DispatchStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            decryption_failures: self.decryption_failures.load(Ordering::Relaxed),
            no_matching_sequence: self.no_matching_sequence.load(Ordering::Relaxed),
        }
    }

    fn inc_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    fn inc_dispatched(&self) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
    }

    fn inc_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    fn inc_decryption_failures(&self) {
        self.decryption_failures.fetch_add(1, Ordering::Relaxed);
        self.inc_dropped();
    }

    fn inc_no_matching_sequence(&self) {
        self.no_matching_sequence.fetch_add(1, Ordering::Relaxed);
        self.inc_dropped();
    }
}

/// Point-in-time copy of [`DispatchStats`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DispatchStatsSnapshot {
    pub received: u64,
    pub dispatched: u64,
    pub dropped: u64,
    pub decryption_failures: u64,
    pub no_matching_sequence: u64,
}

// ============================================================================
// Pending request tracking
// ============================================================================

/// What an outstanding request id is waiting for.
#[derive(Debug, Clone)]
enum PendingRequest {
    Approval {
        pending_topic: Topic,
        settled_topic: Topic,
    },
    Ping {
        topic: Topic,
    },
    Update {
        topic: Topic,
    },
    Upgrade {
        topic: Topic,
    },
    Rpc {
        topic: Topic,
    },
}

impl PendingRequest {
    fn expected_topic(&self) -> &Topic {
        match self {
            PendingRequest::Approval { pending_topic, .. } => pending_topic,
            PendingRequest::Ping { topic }
            | PendingRequest::Update { topic }
            | PendingRequest::Upgrade { topic }
            | PendingRequest::Rpc { topic } => topic,
        }
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Receivers handed out by [`PairingEngine::new`].
pub struct EngineHandles {
    /// Relay traffic from every topic the engine subscribed to. Drive it
    /// into [`PairingEngine::handle_inbound`].
    pub inbound: mpsc::UnboundedReceiver<RelayMessage>,
    /// Lifecycle notifications for the application.
    pub events: mpsc::UnboundedReceiver<PairingEvent>,
}

/// One participant's pairing engine.
pub struct PairingEngine<S: SecretStore, R: Relay> {
    config: EngineConfig,
    kms: KeyManagement<S>,
    registry: SequenceRegistry,
    relay: Arc<R>,
    pending_requests: RwLock<HashMap<u64, PendingRequest>>,
    stats: DispatchStats,
    inbound_tx: mpsc::UnboundedSender<RelayMessage>,
    events: mpsc::UnboundedSender<PairingEvent>,
}

impl<S: SecretStore, R: Relay> PairingEngine<S, R> {
    pub fn new(config: EngineConfig, store: Arc<S>, relay: Arc<R>) -> (Self, EngineHandles) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let engine = Self {
            config,
            kms: KeyManagement::new(store),
            registry: SequenceRegistry::new(),
            relay,
            pending_requests: RwLock::new(HashMap::new()),
            stats: DispatchStats::default(),
            inbound_tx,
            events: events_tx,
        };
        let handles = EngineHandles {
            inbound: inbound_rx,
            events: events_rx,
        };
        (engine, handles)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn stats(&self) -> DispatchStatsSnapshot {
        self.stats.snapshot()
    }

    /// Clone of the live sequence for a topic, if any.
    pub async fn sequence(&self, topic: &Topic) -> Option<PairingSequence> {
        self.registry.find(topic, unix_now()).await
    }

    /// Topics of all live sequences.
    pub async fn topics(&self) -> Vec<Topic> {
        self.registry.topics(unix_now()).await
    }

    // ------------------------------------------------------------------------
    // Outbound operations
    // ------------------------------------------------------------------------

    /// Start a new pairing: generate a key pair and a proposal topic,
    /// subscribe to it, and return the URI to hand to the peer.
    pub async fn propose(&self) -> Result<PairingUri, CoreError> {
        let pair = self.kms.create_key_pair().await?;
        let topic = random_topic()?;
        let uri = PairingUri::new(
            topic.clone(),
            pair.public_key(),
            self.config.controller,
            self.config.relay.clone(),
        );
        let proposal = uri.to_proposal(self.config.expiry.pending_ttl_secs);

        let now = unix_now();
        let sequence = PairingSequence::propose(
            topic.clone(),
            self.config.relay.clone(),
            pair.public_key(),
            proposal,
            now + self.config.expiry.proposed_ttl_secs,
        );
        self.registry.insert(sequence).await;
        self.open_topic(&topic).await?;

        info!(%topic, "proposed pairing");
        Ok(uri)
    }

    /// Respond to a pairing URI: derive the settled topic, persist the
    /// agreement secret, and send the approval. Returns the settled topic;
    /// the pairing is acknowledged once the peer confirms.
    pub async fn pair(&self, uri: &str) -> Result<Topic, CoreError> {
        let uri = PairingUri::parse(uri)?;
        let now = unix_now();
        if self.registry.contains(&uri.topic, now).await {
            return Err(CoreError::TopicExists(uri.topic.clone()));
        }
        let proposal = uri.to_proposal(self.config.expiry.pending_ttl_secs);

        let pair = self.kms.create_key_pair().await?;
        let agreement = pair.agree(&uri.public_key)?;
        let settled_topic = agreement.derived_topic();

        // pending record for the proposal topic, already responded
        let mut pending = PairingSequence::propose(
            uri.topic.clone(),
            uri.relay.clone(),
            pair.public_key(),
            proposal.clone(),
            now + proposal.ttl,
        );
        pending.mark_responded(settled_topic.clone(), now)?;

        let responder = Participant {
            public_key: pair.public_key(),
        };
        let controller = resolve_controller(&proposal.proposer, &responder);
        let permissions = SettledPermissions {
            jsonrpc: proposal.permissions.jsonrpc.clone(),
            controller,
        };
        let pairing_state = PairingState {
            metadata: self.config.metadata.clone(),
        };
        let expiry_unix = now + self.config.expiry.settled_ttl_secs;
        let settled = PairingSequence::settle(
            settled_topic.clone(),
            uri.relay.clone(),
            pair.public_key(),
            Participant {
                public_key: uri.public_key.clone(),
            },
            permissions,
            pairing_state.clone(),
            expiry_unix,
        );

        self.kms.save_agreement(&settled_topic, &agreement).await?;
        self.registry.insert(pending).await;
        self.registry.insert(settled).await;
        self.open_topic(&uri.topic).await?;
        self.open_topic(&settled_topic).await?;

        let params = ApprovalParams {
            relay: uri.relay.clone(),
            responder,
            expiry: expiry_unix,
            state: Some(pairing_state),
        };
        let request = Request::new(methods::PAIRING_APPROVE, serde_json::to_value(&params)?);
        let id = request.id;
        self.track_request(
            id,
            PendingRequest::Approval {
                pending_topic: uri.topic.clone(),
                settled_topic: settled_topic.clone(),
            },
        )
        .await;
        self.publish_payload(&uri.topic, &Payload::Request(request))
            .await?;

        info!(topic = %settled_topic, "responded to pairing proposal");
        Ok(settled_topic)
    }

    /// Decline a pairing URI without creating any local state.
    pub async fn reject(&self, uri: &str, reason: &str) -> Result<(), CoreError> {
        let uri = PairingUri::parse(uri)?;
        let request = Request::new(
            methods::PAIRING_REJECT,
            serde_json::to_value(RejectParams {
                reason: reason.to_string(),
            })?,
        );
        self.publish_payload(&uri.topic, &Payload::Request(request))
            .await?;
        info!(topic = %uri.topic, "rejected pairing proposal");
        Ok(())
    }

    /// Replace the shared state of an acknowledged pairing. Controller only.
    pub async fn update(&self, topic: &Topic, state: PairingState) -> Result<u64, CoreError> {
        let now = unix_now();
        let sequence = self
            .registry
            .find(topic, now)
            .await
            .ok_or_else(|| CoreError::NoMatchingSequence(topic.clone()))?;
        if !sequence.self_is_controller() {
            return Err(SequenceError::Unauthorized("only the controller may update").into());
        }

        self.registry
            .update(topic, now, |seq| seq.apply_state(state.clone(), now))
            .await?;

        let request = Request::new(
            methods::PAIRING_UPDATE,
            serde_json::to_value(UpdateParams { state })?,
        );
        let id = request.id;
        self.track_request(
            id,
            PendingRequest::Update {
                topic: topic.clone(),
            },
        )
        .await;
        self.publish_payload(topic, &Payload::Request(request))
            .await?;
        Ok(id)
    }

    /// Widen the permitted methods of an acknowledged pairing. Controller only.
    pub async fn upgrade(
        &self,
        topic: &Topic,
        permissions: ProposedPermissions,
    ) -> Result<u64, CoreError> {
        let now = unix_now();
        let sequence = self
            .registry
            .find(topic, now)
            .await
            .ok_or_else(|| CoreError::NoMatchingSequence(topic.clone()))?;
        if !sequence.self_is_controller() {
            return Err(SequenceError::Unauthorized("only the controller may upgrade").into());
        }

        self.registry
            .update(topic, now, |seq| seq.apply_upgrade(&permissions, now))
            .await?;

        let request = Request::new(
            methods::PAIRING_UPGRADE,
            serde_json::to_value(UpgradeParams { permissions })?,
        );
        let id = request.id;
        self.track_request(
            id,
            PendingRequest::Upgrade {
                topic: topic.clone(),
            },
        )
        .await;
        self.publish_payload(topic, &Payload::Request(request))
            .await?;
        Ok(id)
    }

    /// Tear down a settled pairing. The farewell to the peer is best
    /// effort; local state is purged regardless.
    pub async fn delete(&self, topic: &Topic, reason: Reason) -> Result<(), CoreError> {
        let now = unix_now();
        let sequence = self
            .registry
            .find(topic, now)
            .await
            .ok_or_else(|| CoreError::NoMatchingSequence(topic.clone()))?;
        if sequence.settled().is_none() {
            return Err(SequenceError::InvalidTransition {
                from: sequence.status_label(),
                action: "delete",
            }
            .into());
        }

        let request = Request::new(
            methods::PAIRING_DELETE,
            serde_json::to_value(DeleteParams { reason })?,
        );
        if let Err(err) = self
            .publish_payload(topic, &Payload::Request(request))
            .await
        {
            warn!(%topic, %err, "failed to send delete notice");
        }

        self.registry.remove(topic).await;
        self.kms.delete_agreement(topic).await?;
        self.kms.delete_key_pair(&sequence.self_key).await?;
        self.quiet_unsubscribe(topic).await;
        info!(%topic, "deleted pairing");
        Ok(())
    }

    /// Liveness probe for a settled pairing. The outcome arrives as
    /// [`PairingEvent::PingResult`].
    pub async fn ping(&self, topic: &Topic) -> Result<u64, CoreError> {
        let now = unix_now();
        let sequence = self
            .registry
            .find(topic, now)
            .await
            .ok_or_else(|| CoreError::NoMatchingSequence(topic.clone()))?;
        if sequence.settled().is_none() {
            return Err(SequenceError::InvalidTransition {
                from: sequence.status_label(),
                action: "ping",
            }
            .into());
        }

        let request = Request::new(methods::PAIRING_PING, serde_json::to_value(PingParams {})?);
        let id = request.id;
        self.track_request(
            id,
            PendingRequest::Ping {
                topic: topic.clone(),
            },
        )
        .await;
        self.publish_payload(topic, &Payload::Request(request))
            .await?;
        Ok(id)
    }

    /// Send a session proposal over an acknowledged pairing.
    pub async fn propose_session(&self, topic: &Topic, params: Value) -> Result<u64, CoreError> {
        let now = unix_now();
        let sequence = self
            .registry
            .find(topic, now)
            .await
            .ok_or_else(|| CoreError::NoMatchingSequence(topic.clone()))?;
        let permitted = match sequence.settled() {
            Some(settled) if settled.status == SettledStatus::Acknowledged => settled
                .permissions
                .jsonrpc
                .methods
                .iter()
                .any(|m| m == methods::SESSION_PROPOSE),
            _ => {
                return Err(SequenceError::InvalidTransition {
                    from: sequence.status_label(),
                    action: "session proposal",
                }
                .into())
            }
        };
        if !permitted {
            return Err(
                SequenceError::Unauthorized("session proposals not permitted").into(),
            );
        }

        let request = Request::new(methods::SESSION_PROPOSE, params);
        let id = request.id;
        self.track_request(
            id,
            PendingRequest::Rpc {
                topic: topic.clone(),
            },
        )
        .await;
        self.publish_payload(topic, &Payload::Request(request))
            .await?;
        Ok(id)
    }

    /// Send a response on a topic, e.g. to answer a
    /// [`PairingEvent::SessionProposal`].
    pub async fn respond(&self, topic: &Topic, response: Response) -> Result<(), CoreError> {
        self.publish_payload(topic, &Payload::Response(response))
            .await
    }

    /// Purge every expired sequence along with its key material.
    /// Returns how many sequences were removed.
    pub async fn cleanup_expired(&self) -> usize {
        let removed = self.registry.cleanup_expired(unix_now()).await;
        for sequence in &removed {
            if sequence.settled().is_some() {
                if let Err(err) = self.kms.delete_agreement(&sequence.topic).await {
                    warn!(topic = %sequence.topic, %err, "failed to purge agreement secret");
                }
            }
            if let Err(err) = self.kms.delete_key_pair(&sequence.self_key).await {
                warn!(topic = %sequence.topic, %err, "failed to purge key pair");
            }
            self.quiet_unsubscribe(&sequence.topic).await;
        }
        removed.len()
    }

    // ------------------------------------------------------------------------
    // Inbound dispatch
    // ------------------------------------------------------------------------

    /// Handle one relay message. Never fails: bad input is counted,
    /// logged, and discarded.
    pub async fn handle_inbound(&self, message: RelayMessage) {
        self.stats.inc_received();
        match self.process_inbound(&message).await {
            Ok(()) => self.stats.inc_dispatched(),
            Err(err) => {
                match &err {
                    CoreError::Envelope(_) | CoreError::Cipher(_) => {
                        self.stats.inc_decryption_failures()
                    }
                    CoreError::NoMatchingSequence(_) => self.stats.inc_no_matching_sequence(),
                    _ => self.stats.inc_dropped(),
                }
                if err.is_traffic_noise() {
                    debug!(topic = %message.topic, %err, "discarded relay message");
                } else {
                    warn!(topic = %message.topic, %err, "discarded relay message");
                }
            }
        }
    }

    async fn process_inbound(&self, message: &RelayMessage) -> Result<(), CoreError> {
        let plaintext = match self.kms.load_agreement(&message.topic).await? {
            Some(agreement) => envelope::open(&agreement.symmetric_key(), &message.payload)?,
            None => message.payload.to_vec(),
        };

        match serde_json::from_slice::<Payload>(&plaintext)? {
            Payload::Request(request) => self.handle_request(&message.topic, request).await,
            Payload::Response(response) => self.handle_response(&message.topic, response).await,
        }
    }

    async fn handle_request(&self, topic: &Topic, request: Request) -> Result<(), CoreError> {
        debug!(%topic, method = %request.method, id = request.id, "inbound request");
        match request.method.as_str() {
            methods::PAIRING_APPROVE => self.handle_approve(topic, request).await,
            methods::PAIRING_REJECT => self.handle_reject(topic, request).await,
            methods::PAIRING_UPDATE => self.handle_update(topic, request).await,
            methods::PAIRING_UPGRADE => self.handle_upgrade(topic, request).await,
            methods::PAIRING_DELETE => self.handle_delete(topic, request).await,
            methods::PAIRING_PING => self.handle_ping(topic, request).await,
            _ => self.handle_other(topic, request).await,
        }
    }

    /// The peer accepted our proposal: derive the settled topic, walk the
    /// pending sequence forward, and confirm on the proposal topic.
    async fn handle_approve(&self, topic: &Topic, request: Request) -> Result<(), CoreError> {
        let params: ApprovalParams = serde_json::from_value(request.params)?;
        let now = unix_now();
        let sequence = self
            .registry
            .find(topic, now)
            .await
            .ok_or_else(|| CoreError::NoMatchingSequence(topic.clone()))?;

        let pending = match sequence.pending() {
            Some(pending) if pending.status == PendingStatus::Proposed => pending,
            _ => {
                return Err(SequenceError::InvalidTransition {
                    from: sequence.status_label(),
                    action: "approve",
                }
                .into())
            }
        };

        let agreement = self
            .kms
            .perform_agreement(&sequence.self_key, &params.responder.public_key)
            .await?;
        let settled_topic = agreement.derived_topic();

        // the approval's expiry is untrusted input; clamp to our ceiling
        let ceiling = now + self.config.expiry.settled_ttl_secs;
        let expiry_unix = if params.expiry <= now || params.expiry > ceiling {
            debug!(%settled_topic, requested = params.expiry, "clamping approval expiry");
            ceiling
        } else {
            params.expiry
        };

        let controller = resolve_controller(&pending.proposal.proposer, &params.responder);
        let permissions = SettledPermissions {
            jsonrpc: pending.proposal.permissions.jsonrpc.clone(),
            controller,
        };
        let mut settled = PairingSequence::settle(
            settled_topic.clone(),
            params.relay.clone(),
            sequence.self_key.clone(),
            params.responder.clone(),
            permissions,
            params.state.clone().unwrap_or_default(),
            expiry_unix,
        );
        settled.acknowledge(now)?;

        self.registry
            .update(topic, now, |seq| seq.mark_responded(settled_topic.clone(), now))
            .await?;

        self.kms.save_agreement(&settled_topic, &agreement).await?;
        self.registry.insert(settled).await;
        self.open_topic(&settled_topic).await?;

        // confirm on the proposal topic, then retire it
        self.publish_payload(
            topic,
            &Payload::Response(Response::ok(request.id, json!(true))),
        )
        .await?;
        self.registry.remove(topic).await;
        self.quiet_unsubscribe(topic).await;

        info!(%settled_topic, "pairing settled");
        self.emit(PairingEvent::Settled {
            topic: settled_topic,
        });
        Ok(())
    }

    async fn handle_reject(&self, topic: &Topic, request: Request) -> Result<(), CoreError> {
        let params: RejectParams = serde_json::from_value(request.params)?;
        let now = unix_now();
        let sequence = self
            .registry
            .find(topic, now)
            .await
            .ok_or_else(|| CoreError::NoMatchingSequence(topic.clone()))?;
        if sequence.pending().is_none() {
            return Err(SequenceError::InvalidTransition {
                from: sequence.status_label(),
                action: "reject",
            }
            .into());
        }

        self.registry.remove(topic).await;
        if let Err(err) = self.kms.delete_key_pair(&sequence.self_key).await {
            debug!(%topic, %err, "failed to delete proposal key pair");
        }
        self.quiet_unsubscribe(topic).await;

        info!(%topic, reason = %params.reason, "pairing proposal rejected by peer");
        self.emit(PairingEvent::Rejected {
            topic: topic.clone(),
            reason: params.reason,
        });
        Ok(())
    }

    async fn handle_update(&self, topic: &Topic, request: Request) -> Result<(), CoreError> {
        let params: UpdateParams = serde_json::from_value(request.params)?;
        let now = unix_now();
        let sequence = self
            .registry
            .find(topic, now)
            .await
            .ok_or_else(|| CoreError::NoMatchingSequence(topic.clone()))?;
        if sequence.settled().is_none() {
            return Err(SequenceError::InvalidTransition {
                from: sequence.status_label(),
                action: "update",
            }
            .into());
        }
        if !sequence.peer_is_controller() {
            return Err(SequenceError::Unauthorized("update from non-controller peer").into());
        }

        self.registry
            .update(topic, now, |seq| seq.apply_state(params.state.clone(), now))
            .await?;
        self.publish_payload(
            topic,
            &Payload::Response(Response::ok(request.id, json!(true))),
        )
        .await?;
        self.emit(PairingEvent::Updated {
            topic: topic.clone(),
            state: params.state,
        });
        Ok(())
    }

    async fn handle_upgrade(&self, topic: &Topic, request: Request) -> Result<(), CoreError> {
        let params: UpgradeParams = serde_json::from_value(request.params)?;
        let now = unix_now();
        let sequence = self
            .registry
            .find(topic, now)
            .await
            .ok_or_else(|| CoreError::NoMatchingSequence(topic.clone()))?;
        if sequence.settled().is_none() {
            return Err(SequenceError::InvalidTransition {
                from: sequence.status_label(),
                action: "upgrade",
            }
            .into());
        }
        if !sequence.peer_is_controller() {
            return Err(SequenceError::Unauthorized("upgrade from non-controller peer").into());
        }

        self.registry
            .update(topic, now, |seq| seq.apply_upgrade(&params.permissions, now))
            .await?;
        self.publish_payload(
            topic,
            &Payload::Response(Response::ok(request.id, json!(true))),
        )
        .await?;
        self.emit(PairingEvent::Upgraded {
            topic: topic.clone(),
            permissions: params.permissions,
        });
        Ok(())
    }

    async fn handle_delete(&self, topic: &Topic, request: Request) -> Result<(), CoreError> {
        let params: DeleteParams = serde_json::from_value(request.params)?;
        let now = unix_now();
        let sequence = self
            .registry
            .find(topic, now)
            .await
            .ok_or_else(|| CoreError::NoMatchingSequence(topic.clone()))?;
        if sequence.settled().is_none() {
            return Err(SequenceError::InvalidTransition {
                from: sequence.status_label(),
                action: "delete",
            }
            .into());
        }

        // answer while the secret still exists, then purge
        self.publish_payload(
            topic,
            &Payload::Response(Response::ok(request.id, json!(true))),
        )
        .await?;
        self.registry.remove(topic).await;
        if let Err(err) = self.kms.delete_agreement(topic).await {
            warn!(%topic, %err, "failed to purge agreement secret");
        }
        if let Err(err) = self.kms.delete_key_pair(&sequence.self_key).await {
            debug!(%topic, %err, "failed to delete key pair");
        }
        self.quiet_unsubscribe(topic).await;

        info!(%topic, reason = %params.reason.message, "pairing deleted by peer");
        self.emit(PairingEvent::Deleted {
            topic: topic.clone(),
            reason: params.reason,
        });
        Ok(())
    }

    async fn handle_ping(&self, topic: &Topic, request: Request) -> Result<(), CoreError> {
        let _params: PingParams = serde_json::from_value(request.params)?;
        let now = unix_now();
        let sequence = self
            .registry
            .find(topic, now)
            .await
            .ok_or_else(|| CoreError::NoMatchingSequence(topic.clone()))?;
        if sequence.settled().is_none() {
            return Err(SequenceError::InvalidTransition {
                from: sequence.status_label(),
                action: "ping",
            }
            .into());
        }

        self.publish_payload(
            topic,
            &Payload::Response(Response::ok(request.id, json!(true))),
        )
        .await?;
        self.emit(PairingEvent::Ping {
            topic: topic.clone(),
        });
        Ok(())
    }

    /// Non-lifecycle request: deliver it to the application if the pairing
    /// permits the method, refuse it on the wire otherwise.
    async fn handle_other(&self, topic: &Topic, request: Request) -> Result<(), CoreError> {
        let now = unix_now();
        let sequence = self
            .registry
            .find(topic, now)
            .await
            .ok_or_else(|| CoreError::NoMatchingSequence(topic.clone()))?;
        let permitted = match sequence.settled() {
            Some(settled) if settled.status == SettledStatus::Acknowledged => {
                settled.permissions.jsonrpc.methods.contains(&request.method)
            }
            _ => {
                return Err(SequenceError::InvalidTransition {
                    from: sequence.status_label(),
                    action: "request",
                }
                .into())
            }
        };

        if !permitted {
            warn!(%topic, method = %request.method, "refusing unpermitted method");
            self.publish_payload(
                topic,
                &Payload::Response(Response::err(request.id, -32601, "method not permitted")),
            )
            .await?;
            return Ok(());
        }

        if request.method == methods::SESSION_PROPOSE {
            self.emit(PairingEvent::SessionProposal {
                topic: topic.clone(),
                id: request.id,
                params: request.params,
            });
        } else {
            self.emit(PairingEvent::Rpc {
                topic: topic.clone(),
                id: request.id,
                method: request.method,
                params: request.params,
            });
        }
        Ok(())
    }

    async fn handle_response(&self, topic: &Topic, response: Response) -> Result<(), CoreError> {
        let entry = {
            let pending = self.pending_requests.read().await;
            match pending.get(&response.id) {
                Some(entry) if entry.expected_topic() == topic => entry.clone(),
                _ => return Err(CoreError::UnknownRequest(response.id)),
            }
        };
        if self
            .pending_requests
            .write()
            .await
            .remove(&response.id)
            .is_none()
        {
            return Err(CoreError::UnknownRequest(response.id));
        }

        match entry {
            PendingRequest::Approval {
                pending_topic,
                settled_topic,
            } => {
                if response.is_success() {
                    let now = unix_now();
                    self.registry
                        .update(&settled_topic, now, |seq| seq.acknowledge(now))
                        .await?;
                    self.registry.remove(&pending_topic).await;
                    self.quiet_unsubscribe(&pending_topic).await;
                    info!(topic = %settled_topic, "pairing acknowledged");
                    self.emit(PairingEvent::Settled {
                        topic: settled_topic,
                    });
                } else {
                    let reason = response
                        .error
                        .map(|e| e.message)
                        .unwrap_or_else(|| "approval refused".to_string());
                    warn!(topic = %pending_topic, %reason, "pairing approval refused");
                    if let Some(sequence) = self.registry.remove(&settled_topic).await {
                        if let Err(err) = self.kms.delete_key_pair(&sequence.self_key).await {
                            debug!(topic = %settled_topic, %err, "failed to delete key pair");
                        }
                    }
                    self.registry.remove(&pending_topic).await;
                    if let Err(err) = self.kms.delete_agreement(&settled_topic).await {
                        warn!(topic = %settled_topic, %err, "failed to purge agreement secret");
                    }
                    self.quiet_unsubscribe(&pending_topic).await;
                    self.quiet_unsubscribe(&settled_topic).await;
                    self.emit(PairingEvent::Rejected {
                        topic: pending_topic,
                        reason,
                    });
                }
            }
            PendingRequest::Ping { topic } => {
                self.emit(PairingEvent::PingResult {
                    topic,
                    ok: response.is_success(),
                });
            }
            PendingRequest::Update { topic } => {
                if response.is_success() {
                    debug!(%topic, "state update acknowledged");
                } else {
                    warn!(%topic, "state update refused by peer");
                }
            }
            PendingRequest::Upgrade { topic } => {
                if response.is_success() {
                    debug!(%topic, "permission upgrade acknowledged");
                } else {
                    warn!(%topic, "permission upgrade refused by peer");
                }
            }
            PendingRequest::Rpc { topic } => {
                let error = response.error.map(|e| e.message);
                self.emit(PairingEvent::RpcResult {
                    topic,
                    id: response.id,
                    result: response.result,
                    error,
                });
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Plumbing
    // ------------------------------------------------------------------------

    /// Serialize and send: sealed when the topic has an agreement secret,
    /// plaintext JSON otherwise.
    async fn publish_payload(&self, topic: &Topic, payload: &Payload) -> Result<(), CoreError> {
        let json = serde_json::to_vec(payload)?;
        let bytes = match self.kms.load_agreement(topic).await? {
            Some(agreement) => Bytes::from(envelope::seal(&agreement.symmetric_key(), &json)?),
            None => Bytes::from(json),
        };
        self.relay.publish(topic, bytes).await?;
        Ok(())
    }

    /// Subscribe and forward the topic's traffic into the inbound channel.
    async fn open_topic(&self, topic: &Topic) -> Result<(), CoreError> {
        let mut rx = self.relay.subscribe(topic).await?;
        let inbound = self.inbound_tx.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if inbound.send(message).is_err() {
                    break;
                }
            }
        });
        Ok(())
    }

    async fn quiet_unsubscribe(&self, topic: &Topic) {
        if let Err(err) = self.relay.unsubscribe(topic).await {
            debug!(%topic, %err, "unsubscribe failed");
        }
    }

    async fn track_request(&self, id: u64, pending: PendingRequest) {
        self.pending_requests.write().await.insert(id, pending);
    }

    fn emit(&self, event: PairingEvent) {
        // the application may have dropped its receiver
        let _ = self.events.send(event);
    }
}

fn random_topic() -> Result<Topic, CoreError> {
    let mut bytes = [0u8; 32];
    getrandom::getrandom(&mut bytes).map_err(|_| CoreError::Rng)?;
    Ok(Topic::from_raw(bytes))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::{MemoryRelay, MemoryRelayClient};
    use crate::secret_store::MemorySecretStore;
    use std::time::Duration;
    use tokio::time::timeout;

    type TestEngine = PairingEngine<MemorySecretStore, MemoryRelayClient>;

    fn make_engine(hub: &Arc<MemoryRelay>, controller: bool) -> (TestEngine, EngineHandles) {
        let config = EngineConfig {
            controller,
            ..EngineConfig::default()
        };
        PairingEngine::new(
            config,
            MemorySecretStore::new_shared(),
            Arc::new(hub.client()),
        )
    }

    /// Deliver queued relay traffic until the line goes quiet.
    async fn pump(engine: &TestEngine, handles: &mut EngineHandles) {
        while let Ok(Some(message)) =
            timeout(Duration::from_millis(50), handles.inbound.recv()).await
        {
            engine.handle_inbound(message).await;
        }
    }

    fn drain_events(handles: &mut EngineHandles) -> Vec<PairingEvent> {
        let mut events = Vec::new();
        while let Ok(event) = handles.events.try_recv() {
            events.push(event);
        }
        events
    }

    /// Propose from `alice`, pair from `bob`, and pump until acknowledged.
    async fn settle(
        hub: &Arc<MemoryRelay>,
    ) -> (TestEngine, EngineHandles, TestEngine, EngineHandles, Topic) {
        let (alice, mut alice_handles) = make_engine(hub, false);
        let (bob, mut bob_handles) = make_engine(hub, true);

        let uri = alice.propose().await.unwrap();
        let settled_topic = bob.pair(&uri.to_string()).await.unwrap();
        pump(&alice, &mut alice_handles).await;
        pump(&bob, &mut bob_handles).await;

        (alice, alice_handles, bob, bob_handles, settled_topic)
    }

    #[tokio::test]
    async fn test_propose_registers_pending_sequence() {
        let hub = MemoryRelay::new_shared();
        let (alice, _handles) = make_engine(&hub, true);

        let uri = alice.propose().await.unwrap();
        assert!(uri.controller);

        let sequence = alice.sequence(&uri.topic).await.unwrap();
        assert_eq!(sequence.status_label(), "proposed");
        assert_eq!(sequence.self_key, uri.public_key);
        assert_eq!(hub.subscriber_count(&uri.topic).await, 1);
    }

    #[tokio::test]
    async fn test_full_settlement() {
        let hub = MemoryRelay::new_shared();
        let (alice, mut alice_handles, bob, mut bob_handles, settled_topic) = settle(&hub).await;

        for engine in [&alice, &bob] {
            let sequence = engine.sequence(&settled_topic).await.unwrap();
            assert_eq!(sequence.status_label(), "acknowledged");
        }

        // the proposer deferred the controller role, so the responder holds it
        assert!(!alice.sequence(&settled_topic).await.unwrap().self_is_controller());
        assert!(bob.sequence(&settled_topic).await.unwrap().self_is_controller());

        // the proposal topic is retired on both sides once acknowledged
        assert_eq!(alice.topics().await, vec![settled_topic.clone()]);
        assert_eq!(bob.topics().await, vec![settled_topic.clone()]);

        let alice_events = drain_events(&mut alice_handles);
        assert!(alice_events
            .iter()
            .any(|e| matches!(e, PairingEvent::Settled { topic } if *topic == settled_topic)));
        let bob_events = drain_events(&mut bob_handles);
        assert!(bob_events
            .iter()
            .any(|e| matches!(e, PairingEvent::Settled { topic } if *topic == settled_topic)));

        assert_eq!(alice.stats().dropped, 0);
        assert_eq!(bob.stats().dropped, 0);
    }

    #[tokio::test]
    async fn test_proposer_can_claim_controller() {
        let hub = MemoryRelay::new_shared();
        let (alice, mut alice_handles) = make_engine(&hub, true);
        let (bob, mut bob_handles) = make_engine(&hub, false);

        let uri = alice.propose().await.unwrap();
        let settled_topic = bob.pair(&uri.to_string()).await.unwrap();
        pump(&alice, &mut alice_handles).await;
        pump(&bob, &mut bob_handles).await;

        assert!(alice.sequence(&settled_topic).await.unwrap().self_is_controller());
        assert!(bob.sequence(&settled_topic).await.unwrap().peer_is_controller());
    }

    #[tokio::test]
    async fn test_pairing_same_uri_twice_fails() {
        let hub = MemoryRelay::new_shared();
        let (alice, _alice_handles) = make_engine(&hub, false);
        let (bob, _bob_handles) = make_engine(&hub, true);

        let uri = alice.propose().await.unwrap().to_string();
        bob.pair(&uri).await.unwrap();
        let err = bob.pair(&uri).await.unwrap_err();
        assert!(matches!(err, CoreError::TopicExists(_)));
    }

    #[tokio::test]
    async fn test_update_refused_locally_for_non_controller() {
        let hub = MemoryRelay::new_shared();
        let (alice, _ah, _bob, _bh, settled_topic) = settle(&hub).await;

        let err = alice
            .update(&settled_topic, PairingState::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CoreError::Sequence(SequenceError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn test_forged_update_from_non_controller_dropped() {
        let hub = MemoryRelay::new_shared();
        let (alice, _ah, bob, mut bob_handles, settled_topic) = settle(&hub).await;
        // discard settlement-era events; only the attack's effects are under test
        drain_events(&mut bob_handles);
        let state_before = bob.sequence(&settled_topic).await.unwrap();

        // alice holds the real secret but not the controller role; a
        // well-formed envelope must still be refused
        let agreement = alice.kms.load_agreement(&settled_topic).await.unwrap().unwrap();
        let request = Request::new(
            methods::PAIRING_UPDATE,
            serde_json::to_value(UpdateParams {
                state: PairingState::default(),
            })
            .unwrap(),
        );
        let json = serde_json::to_vec(&Payload::Request(request)).unwrap();
        let sealed = envelope::seal(&agreement.symmetric_key(), &json).unwrap();

        let attacker = hub.client();
        attacker
            .publish(&settled_topic, Bytes::from(sealed))
            .await
            .unwrap();
        pump(&bob, &mut bob_handles).await;

        assert_eq!(bob.stats().dropped, 1);
        assert!(drain_events(&mut bob_handles).is_empty());
        assert_eq!(
            bob.sequence(&settled_topic).await.unwrap(),
            state_before
        );
    }

    #[tokio::test]
    async fn test_expired_proposal_refuses_approval() {
        let hub = MemoryRelay::new_shared();
        let (alice, mut alice_handles) = make_engine(&hub, false);
        let (bob, _bob_handles) = make_engine(&hub, true);

        let uri = alice.propose().await.unwrap();

        // force the pending sequence into the past
        let mut sequence = alice.registry.remove(&uri.topic).await.unwrap();
        sequence.expiry_unix = 1;
        alice.registry.insert(sequence).await;

        bob.pair(&uri.to_string()).await.unwrap();
        pump(&alice, &mut alice_handles).await;

        let stats = alice.stats();
        assert_eq!(stats.no_matching_sequence, 1);
        assert_eq!(stats.dropped, 1);
        assert!(drain_events(&mut alice_handles).is_empty());
        // the expired record was purged on lookup
        assert!(alice.sequence(&uri.topic).await.is_none());
    }

    #[tokio::test]
    async fn test_garbage_on_settled_topic_counts_decryption_failure() {
        let hub = MemoryRelay::new_shared();
        let (_alice, _ah, bob, mut bob_handles, settled_topic) = settle(&hub).await;

        let attacker = hub.client();
        attacker
            .publish(&settled_topic, Bytes::from_static(b"not an envelope"))
            .await
            .unwrap();
        pump(&bob, &mut bob_handles).await;

        let stats = bob.stats();
        assert_eq!(stats.decryption_failures, 1);
        assert_eq!(stats.dropped, 1);
        assert_eq!(bob.sequence(&settled_topic).await.unwrap().status_label(), "acknowledged");
    }

    #[tokio::test]
    async fn test_plaintext_junk_on_proposal_topic_dropped() {
        let hub = MemoryRelay::new_shared();
        let (alice, mut alice_handles) = make_engine(&hub, false);

        let uri = alice.propose().await.unwrap();
        let attacker = hub.client();
        attacker
            .publish(&uri.topic, Bytes::from_static(b"{\"neither\": \"kind\"}"))
            .await
            .unwrap();
        attacker
            .publish(&uri.topic, Bytes::from_static(b"not json at all"))
            .await
            .unwrap();
        pump(&alice, &mut alice_handles).await;

        assert_eq!(alice.stats().dropped, 2);
        // proposal survives the noise
        assert_eq!(
            alice.sequence(&uri.topic).await.unwrap().status_label(),
            "proposed"
        );
    }

    #[tokio::test]
    async fn test_unpermitted_method_refused_on_wire() {
        let hub = MemoryRelay::new_shared();
        let (alice, _ah, bob, mut bob_handles, settled_topic) = settle(&hub).await;

        let agreement = alice.kms.load_agreement(&settled_topic).await.unwrap().unwrap();
        let request = Request::new("eth_sign", json!({"data": "0x00"}));
        let json = serde_json::to_vec(&Payload::Request(request)).unwrap();
        let sealed = envelope::seal(&agreement.symmetric_key(), &json).unwrap();

        let attacker = hub.client();
        attacker
            .publish(&settled_topic, Bytes::from(sealed))
            .await
            .unwrap();
        pump(&bob, &mut bob_handles).await;

        // refused on the wire, nothing surfaced to the application
        assert_eq!(bob.stats().dispatched, bob.stats().received);
        assert!(drain_events(&mut bob_handles).iter().all(|e| !matches!(
            e,
            PairingEvent::Rpc { .. } | PairingEvent::SessionProposal { .. }
        )));
    }

    #[tokio::test]
    async fn test_session_proposal_round_trip() {
        let hub = MemoryRelay::new_shared();
        let (alice, mut alice_handles, bob, mut bob_handles, settled_topic) = settle(&hub).await;

        let id = alice
            .propose_session(&settled_topic, json!({"chains": ["eip155:1"]}))
            .await
            .unwrap();
        pump(&bob, &mut bob_handles).await;

        let events = drain_events(&mut bob_handles);
        let proposal = events
            .iter()
            .find_map(|e| match e {
                PairingEvent::SessionProposal {
                    id: got, params, ..
                } => Some((*got, params.clone())),
                _ => None,
            })
            .expect("session proposal event");
        assert_eq!(proposal.0, id);
        assert_eq!(proposal.1, json!({"chains": ["eip155:1"]}));

        bob.respond(&settled_topic, Response::ok(id, json!({"approved": true})))
            .await
            .unwrap();
        pump(&alice, &mut alice_handles).await;

        let events = drain_events(&mut alice_handles);
        assert!(events.iter().any(|e| matches!(
            e,
            PairingEvent::RpcResult { id: got, result: Some(r), .. }
                if *got == id && *r == json!({"approved": true})
        )));
    }

    #[tokio::test]
    async fn test_ping_on_unknown_topic_fails() {
        let hub = MemoryRelay::new_shared();
        let (alice, _handles) = make_engine(&hub, false);
        let err = alice.ping(&Topic::from_raw([3u8; 32])).await.unwrap_err();
        assert!(matches!(err, CoreError::NoMatchingSequence(_)));
    }

    #[tokio::test]
    async fn test_cleanup_expired_purges_key_material() {
        let hub = MemoryRelay::new_shared();
        let (alice, _ah, _bob, _bh, settled_topic) = settle(&hub).await;

        let mut sequence = alice.registry.remove(&settled_topic).await.unwrap();
        sequence.expiry_unix = 1;
        alice.registry.insert(sequence).await;

        assert_eq!(alice.cleanup_expired().await, 1);
        assert!(alice.sequence(&settled_topic).await.is_none());
        assert!(alice
            .kms
            .load_agreement(&settled_topic)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_expiry_clamped_on_approval() {
        let hub = MemoryRelay::new_shared();
        let (alice, mut alice_handles) = make_engine(&hub, false);

        // a peer promising a century gets clamped to our own ceiling
        let mut bob_config = EngineConfig::default();
        bob_config.expiry.settled_ttl_secs = 100 * 365 * 24 * 60 * 60;
        let (bob, mut bob_handles) = PairingEngine::new(
            bob_config,
            MemorySecretStore::new_shared(),
            Arc::new(hub.client()),
        );

        let uri = alice.propose().await.unwrap();
        let settled_topic = bob.pair(&uri.to_string()).await.unwrap();
        pump(&alice, &mut alice_handles).await;
        pump(&bob, &mut bob_handles).await;

        let ceiling = unix_now() + alice.config.expiry.settled_ttl_secs;
        let sequence = alice.sequence(&settled_topic).await.unwrap();
        assert!(sequence.expiry_unix <= ceiling);
        assert_eq!(sequence.status_label(), "acknowledged");
    }
}

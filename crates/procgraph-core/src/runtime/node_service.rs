//! The per-node actor implementing the activation protocol.
//!
//! A node service drains its mailbox one message at a time. State is kept per
//! process instance; downstream propagation runs in a separate task that
//! reports back through the same mailbox, so the loop never waits on other
//! nodes except while an event definition itself does.

use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::endpoint::NodeEndpoint;
use super::event_definition::{Continuation, EventDefinition, NodeContext};
use super::fanout::activate_all;
use super::messages::{
    ActivationMessage, Commit, CommitError, CommitErrorKind, DeactivationMessage, Envelope,
    NodeState, NodeTransition, Operation, ProcessInstanceId, TriggerMessage,
};
use super::registry::NodeDescriptor;
use crate::definition::EventDefinitionSpec;
use crate::identity::FlowNodeId;

/// Everything needed to start the node service of one flow node
#[derive(Debug, Clone)]
pub struct NodeBlueprint {
    pub descriptor: NodeDescriptor,
    /// Targets of this node's outgoing sequence flows
    pub outgoing: Vec<FlowNodeId>,
    /// Number of incoming sequence flows
    pub incoming: usize,
    /// Entry nodes of the embedded flow, for sub-processes
    pub embedded_entries: Vec<FlowNodeId>,
    pub event_definition: Option<EventDefinitionSpec>,
}

#[derive(Debug, Default)]
struct InstanceEntry {
    /// Distinguishes this activation from earlier ones of the same instance
    activation: u64,
    /// Downstream propagations still running
    in_flight: usize,
    /// Waiting for a trigger
    awaiting: bool,
    deactivated: Arc<AtomicBool>,
}

pub struct NodeService {
    context: NodeContext,
    event_definition: Arc<dyn EventDefinition>,
    outgoing: Vec<NodeEndpoint>,
    mailbox: mpsc::Receiver<Envelope>,
    instances: HashMap<ProcessInstanceId, InstanceEntry>,
    activations: u64,
    transitions: broadcast::Sender<NodeTransition>,
}

impl NodeService {
    pub(crate) fn new(
        context: NodeContext,
        event_definition: Arc<dyn EventDefinition>,
        outgoing: Vec<NodeEndpoint>,
        mailbox: mpsc::Receiver<Envelope>,
        transitions: broadcast::Sender<NodeTransition>,
    ) -> Self {
        Self {
            context,
            event_definition,
            outgoing,
            mailbox,
            instances: HashMap::new(),
            activations: 0,
            transitions,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    fn node_id(&self) -> &FlowNodeId {
        &self.context.node_id
    }

    async fn run(mut self) {
        debug!(
            node_id = %self.context.node_id,
            kind = %self.context.kind,
            event_definition = self.event_definition.name(),
            "Node service started"
        );

        while let Some(envelope) = self.mailbox.recv().await {
            let Envelope {
                operation,
                deadline,
                mut reply,
            } = envelope;

            match operation {
                Operation::Activate(message) => {
                    if !self.expired(&message.instance_id, "activate", deadline, &mut reply) {
                        self.on_activate(message, deadline, reply).await;
                    }
                }
                Operation::Deactivate(message) => {
                    if !self.expired(&message.instance_id, "deactivate", deadline, &mut reply) {
                        self.on_deactivate(message, deadline, reply).await;
                    }
                }
                Operation::Trigger(message) => {
                    if !self.expired(&message.instance_id, "trigger", deadline, &mut reply) {
                        self.on_trigger(message, deadline, reply).await;
                    }
                }
                Operation::State(instance_id, sender) => {
                    let _ = sender.send(self.state_of(&instance_id));
                }
                Operation::Completed(instance_id, activation) => {
                    self.on_completed(&instance_id, activation)
                }
                Operation::Stop => break,
            }
        }

        debug!(node_id = %self.context.node_id, "Node service stopped");
    }

    fn state_of(&self, instance_id: &ProcessInstanceId) -> NodeState {
        if self.instances.contains_key(instance_id) {
            NodeState::Active
        } else {
            NodeState::Inactive
        }
    }

    /// Reply with a timeout failure if the message outlived its deadline in the mailbox
    fn expired(
        &self,
        instance_id: &ProcessInstanceId,
        operation: &str,
        deadline: Instant,
        reply: &mut Option<oneshot::Sender<Commit>>,
    ) -> bool {
        if Instant::now() < deadline {
            return false;
        }
        warn!(
            node_id = %self.node_id(),
            instance_id = %instance_id,
            operation,
            "Dropping expired message"
        );
        let error = CommitError::new(
            CommitErrorKind::Timeout,
            format!("{} expired before node {} processed it", operation, self.node_id()),
        )
        .with_nodes(vec![self.node_id().clone()]);
        send_reply(
            reply.take(),
            Commit::failure(instance_id.clone(), self.node_id().clone(), error),
        );
        true
    }

    async fn on_activate(
        &mut self,
        message: ActivationMessage,
        deadline: Instant,
        reply: Option<oneshot::Sender<Commit>>,
    ) {
        let outcome = self
            .event_definition
            .activate(&self.context, &message, deadline)
            .await;
        self.apply(message.instance_id, outcome, deadline, reply);
    }

    async fn on_trigger(
        &mut self,
        message: TriggerMessage,
        deadline: Instant,
        reply: Option<oneshot::Sender<Commit>>,
    ) {
        let state = self.state_of(&message.instance_id);
        let outcome = self
            .event_definition
            .trigger(&self.context, &message, state, deadline)
            .await;
        self.apply(message.instance_id, outcome, deadline, reply);
    }

    async fn on_deactivate(
        &mut self,
        message: DeactivationMessage,
        deadline: Instant,
        reply: Option<oneshot::Sender<Commit>>,
    ) {
        let outcome = self
            .event_definition
            .deactivate(&self.context, &message, deadline)
            .await;

        if let Some(entry) = self.instances.get(&message.instance_id) {
            entry.deactivated.store(true, Ordering::SeqCst);
        }
        self.leave(&message.instance_id);

        let commit = match outcome {
            Ok(()) => Commit::success(message.instance_id, self.node_id().clone(), None),
            Err(error) => Commit::failure(message.instance_id, self.node_id().clone(), error),
        };
        send_reply(reply, commit);
    }

    fn on_completed(&mut self, instance_id: &ProcessInstanceId, activation: u64) {
        let finished = match self.instances.get_mut(instance_id) {
            // A notice from before a deactivation must not touch the current entry
            Some(entry) if entry.activation == activation => {
                entry.in_flight = entry.in_flight.saturating_sub(1);
                entry.in_flight == 0 && !entry.awaiting
            }
            _ => false,
        };
        if finished {
            self.leave(instance_id);
        }
    }

    fn apply(
        &mut self,
        instance_id: ProcessInstanceId,
        outcome: Result<Continuation, CommitError>,
        deadline: Instant,
        reply: Option<oneshot::Sender<Commit>>,
    ) {
        let continuation = match outcome {
            Ok(continuation) => continuation,
            Err(error) => {
                warn!(
                    node_id = %self.node_id(),
                    instance_id = %instance_id,
                    error = %error,
                    "Committing failure"
                );
                send_reply(
                    reply,
                    Commit::failure(instance_id, self.node_id().clone(), error),
                );
                return;
            }
        };

        match continuation {
            Continuation::Unchanged(payload) => {
                send_reply(reply, Commit::success(instance_id, self.node_id().clone(), payload));
            }
            Continuation::Await => {
                self.enter(&instance_id).awaiting = true;
                send_reply(reply, Commit::success(instance_id, self.node_id().clone(), None));
            }
            Continuation::Complete(payload) => {
                self.enter(&instance_id);
                self.leave(&instance_id);
                send_reply(reply, Commit::success(instance_id, self.node_id().clone(), payload));
            }
            Continuation::Proceed(payload) => {
                self.propagate(instance_id, Vec::new(), payload, deadline, reply);
            }
            Continuation::Descend {
                entry_points,
                payload,
            } => {
                self.propagate(instance_id, entry_points, payload, deadline, reply);
            }
        }
    }

    /// Activate `embedded` then the outgoing targets, replying once both stages finished
    fn propagate(
        &mut self,
        instance_id: ProcessInstanceId,
        embedded: Vec<NodeEndpoint>,
        payload: Option<Value>,
        deadline: Instant,
        reply: Option<oneshot::Sender<Commit>>,
    ) {
        let node_id = self.node_id().clone();

        if embedded.is_empty() && self.outgoing.is_empty() {
            let entry = self.enter(&instance_id);
            entry.awaiting = false;
            if entry.in_flight == 0 {
                self.leave(&instance_id);
            }
            send_reply(reply, Commit::success(instance_id, node_id, payload));
            return;
        }

        let entry = self.enter(&instance_id);
        entry.in_flight += 1;
        entry.awaiting = false;
        let activation = entry.activation;
        let deactivated = entry.deactivated.clone();

        let outgoing = self.outgoing.clone();
        let own = self.context.endpoint.clone();
        let now = Instant::now();
        let downstream_deadline =
            now + self.context.config.shortened(deadline.saturating_duration_since(now));

        tokio::spawn(async move {
            let mut commit = Commit::success(instance_id.clone(), node_id.clone(), payload.clone());

            if !embedded.is_empty() {
                commit = activate_all(&embedded, &instance_id, payload.clone(), downstream_deadline)
                    .await
                    .into_commit(&instance_id, &node_id, payload.clone());
            }

            if commit.ok && !outgoing.is_empty() {
                if deactivated.load(Ordering::SeqCst) {
                    debug!(node_id = %node_id, instance_id = %instance_id, "Deactivated before outgoing flows");
                } else {
                    commit = activate_all(&outgoing, &instance_id, payload.clone(), downstream_deadline)
                        .await
                        .into_commit(&instance_id, &node_id, payload);
                }
            }

            if !commit.ok {
                warn!(
                    node_id = %node_id,
                    instance_id = %instance_id,
                    error = ?commit.error,
                    "Downstream propagation failed"
                );
            }

            own.notify_completed(&instance_id, activation).await;
            send_reply(reply, commit);
        });
    }

    /// Entry for an instance, moving the node to Active if it was Inactive
    fn enter(&mut self, instance_id: &ProcessInstanceId) -> &mut InstanceEntry {
        if !self.instances.contains_key(instance_id) {
            self.publish(instance_id, NodeState::Inactive, NodeState::Active);
            self.activations += 1;
            let entry = InstanceEntry {
                activation: self.activations,
                ..InstanceEntry::default()
            };
            self.instances.insert(instance_id.clone(), entry);
        }
        self.instances.entry(instance_id.clone()).or_default()
    }

    /// Drop the entry for an instance, moving the node to Inactive if it was Active
    fn leave(&mut self, instance_id: &ProcessInstanceId) {
        if self.instances.remove(instance_id).is_some() {
            self.publish(instance_id, NodeState::Active, NodeState::Inactive);
        }
    }

    fn publish(&self, instance_id: &ProcessInstanceId, from: NodeState, to: NodeState) {
        debug!(
            node_id = %self.node_id(),
            instance_id = %instance_id,
            from = ?from,
            to = ?to,
            "Node transition"
        );
        // No subscribers is fine
        let _ = self.transitions.send(NodeTransition {
            node_id: self.node_id().clone(),
            instance_id: instance_id.clone(),
            from,
            to,
            at: Utc::now(),
        });
    }
}

fn send_reply(reply: Option<oneshot::Sender<Commit>>, commit: Commit) {
    if let Some(reply) = reply {
        // The caller may have given up already
        let _ = reply.send(commit);
    }
}

//! Tokio runner for one replica session.
//!
//! A single task owns the state machine and receives events from three
//! sources: its timers, its transport and its pool's command channel.
//! Internal events are drained before the next external event is taken.

use crate::codec::{self, CodecError};
use crate::storage::MemoryLedger;
use crate::timers::TimerManager;
use crate::transport::{Inbound, Transport, TransportError};
use keel_core::{Action, Event, Ledger, LedgerError, NodeNotification, StateMachine};
use keel_node::NodeStateMachine;
use keel_types::{ClientRequest, NodeId, RequestId, SeqNo, ViewNumber};
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, span, trace, warn, Level};

/// Capacity of the timer event channel.
const TIMER_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("inbound channel closed")]
    ChannelClosed,

    #[error("codec: {0}")]
    Codec(#[from] CodecError),

    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    #[error("ledger: {0}")]
    Ledger(#[from] LedgerError),
}

/// Instructions a pool gives a running replica.
#[derive(Debug, Clone)]
pub enum Command {
    Submit(ClientRequest),
    RequestViewChange,
}

impl Command {
    fn into_event(self) -> Event {
        match self {
            Command::Submit(request) => Event::ClientRequestReceived { request },
            Command::RequestViewChange => Event::ViewChangeRequested,
        }
    }
}

/// What a replica reports to whoever runs the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicaEvent {
    Notification {
        node: NodeId,
        notification: NodeNotification,
    },
    Reply {
        node: NodeId,
        request_id: RequestId,
        view: ViewNumber,
        seq: SeqNo,
    },
}

pub struct ReplicaRunner {
    state: NodeStateMachine,
    transport: Arc<dyn Transport>,
    inbound_rx: mpsc::UnboundedReceiver<Inbound>,
    command_rx: mpsc::Receiver<Command>,
    timer_rx: mpsc::Receiver<Event>,
    timers: TimerManager,
    /// Internal events produced by the last handled event.
    internal: VecDeque<Event>,
    ledger: MemoryLedger,
    events_tx: broadcast::Sender<ReplicaEvent>,
    shutdown: CancellationToken,
    start_time: Instant,
}

impl ReplicaRunner {
    pub fn new(
        state: NodeStateMachine,
        transport: Arc<dyn Transport>,
        inbound_rx: mpsc::UnboundedReceiver<Inbound>,
        command_rx: mpsc::Receiver<Command>,
        ledger: MemoryLedger,
        events_tx: broadcast::Sender<ReplicaEvent>,
        shutdown: CancellationToken,
    ) -> Self {
        let (timer_tx, timer_rx) = mpsc::channel(TIMER_CHANNEL_CAPACITY);
        Self {
            state,
            transport,
            inbound_rx,
            command_rx,
            timer_rx,
            timers: TimerManager::new(timer_tx),
            internal: VecDeque::new(),
            ledger,
            events_tx,
            shutdown,
            start_time: Instant::now(),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.state.node_id()
    }

    /// Run until the shutdown token is cancelled.
    pub async fn run(mut self) -> Result<(), RunnerError> {
        info!(
            node = %self.node_id(),
            last_committed = self.state.last_committed().0,
            "Starting replica"
        );

        self.state.set_time(self.start_time.elapsed());
        let actions = self.state.start();
        self.process_actions(actions)?;
        self.drain_internal()?;

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => {
                    info!(node = %self.node_id(), "Shutdown signal received");
                    break;
                }

                Some(event) = self.timer_rx.recv() => {
                    self.dispatch(event)?;
                }

                inbound = self.inbound_rx.recv() => match inbound {
                    Some(Inbound::Frame { from, bytes }) => match codec::decode(&bytes) {
                        Ok((sender, message)) if sender == from => {
                            self.dispatch(message.into_event())?;
                        }
                        Ok((sender, _)) => {
                            warn!(node = %self.node_id(), %from, %sender, "Frame sender mismatch");
                        }
                        Err(e) => {
                            debug!(node = %self.node_id(), %from, error = %e, "Undecodable frame");
                        }
                    },
                    Some(Inbound::PeerDisconnected(peer)) => {
                        self.dispatch(Event::PeerDisconnected { peer })?;
                    }
                    None => return Err(RunnerError::ChannelClosed),
                },

                Some(command) = self.command_rx.recv() => {
                    self.dispatch(command.into_event())?;
                }
            }
        }

        self.timers.cancel_all();
        Ok(())
    }

    fn dispatch(&mut self, event: Event) -> Result<(), RunnerError> {
        let span = span!(
            Level::DEBUG,
            "handle_event",
            event.type = event.type_name(),
            node = %self.node_id(),
        );
        let _guard = span.enter();

        self.state.set_time(self.start_time.elapsed());
        let actions = self.state.handle(event);
        self.process_actions(actions)?;
        self.drain_internal()
    }

    fn drain_internal(&mut self) -> Result<(), RunnerError> {
        while let Some(event) = self.internal.pop_front() {
            let actions = self.state.handle(event);
            self.process_actions(actions)?;
        }
        Ok(())
    }

    fn process_actions(&mut self, actions: Vec<Action>) -> Result<(), RunnerError> {
        for action in actions {
            self.process_action(action)?;
        }
        Ok(())
    }

    fn process_action(&mut self, action: Action) -> Result<(), RunnerError> {
        let node = self.node_id();
        match action {
            Action::Broadcast { message } => {
                let frame = codec::encode(node, &message)?;
                self.transport.broadcast(&frame);
            }

            Action::Send { to, message } => {
                let frame = codec::encode(node, &message)?;
                if let Err(e) = self.transport.send(to, frame) {
                    debug!(%node, %to, error = %e, "Send failed");
                }
            }

            Action::SetTimer { id, duration } => self.timers.set_timer(id, duration),

            Action::CancelTimer { id } => self.timers.cancel_timer(id),

            Action::EnqueueInternal { event } => self.internal.push_back(event),

            Action::AppendCommitted { entry } => {
                let seq = entry.seq;
                if let Err(e) = self.ledger.append_committed(entry) {
                    error!(
                        %node,
                        seq = seq.0,
                        error = %e,
                        "Ledger append rejected, stopping replica"
                    );
                    return Err(e.into());
                }
                trace!(%node, seq = seq.0, "Ledger append");
            }

            Action::ReplyToClient {
                request_id,
                view,
                seq,
            } => {
                // No subscribers is fine.
                let _ = self.events_tx.send(ReplicaEvent::Reply {
                    node,
                    request_id,
                    view,
                    seq,
                });
            }

            Action::Notify { notification } => {
                info!(%node, notification = notification.type_name(), "Notification");
                let _ = self.events_tx.send(ReplicaEvent::Notification {
                    node,
                    notification,
                });
            }
        }
        Ok(())
    }
}

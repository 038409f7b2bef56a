//! Mailbox actor — one tokio task per instance.
//!
//! A strict single-consumer queue: messages are processed FIFO, and
//! processing one message runs a full interpreter step to completion
//! before the next dequeue. Events raised during a step sit in an
//! actor-local front queue drained before the channel, so raises land
//! ahead of pending external sends and FIFO among themselves.
//!
//! The actor performs the step's effects: it arms and aborts timer tasks,
//! runs invoked services as abortable spawned tasks that re-enter the
//! mailbox as internal messages, routes peer sends, services spawn
//! requests, and fans notifications out to subscribers and the
//! orchestrator.

use crate::context::MachineContext;
use crate::error::EngineError;
use crate::events::Notification;
use crate::interp::{Effect, Interp, StepReport};
use crate::orchestrator::Orchestrator;
use crate::types::{now_ms, EventObject, InterpOptions, Layout, Program, Snapshot, StateIdx};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Creates child mailboxes for `spawn` actions. Implemented by the engine
/// facade, which owns the machine registry.
#[async_trait::async_trait]
pub trait ChildSpawner: Send + Sync {
    async fn spawn_child(
        &self,
        parent: &str,
        src: &str,
        child_id: &str,
    ) -> Result<MailboxHandle, EngineError>;
}

/// Messages an instance mailbox consumes.
pub enum Message {
    Start,
    Stop,
    Send(EventObject),
    Raise(EventObject),
    AskState(oneshot::Sender<Snapshot>),
    Subscribe {
        tag: String,
        sink: mpsc::UnboundedSender<Notification>,
    },
    Unsubscribe {
        tag: String,
    },
    // Internal.
    DelayedFire {
        state: StateIdx,
        index: usize,
        generation: u64,
    },
    ServiceDone {
        invocation: Uuid,
        output: Value,
    },
    ServiceError {
        invocation: Uuid,
        message: String,
    },
}

/// Shareable, non-blocking handle to an instance mailbox.
#[derive(Clone, Debug)]
pub struct MailboxHandle {
    id: Arc<str>,
    tx: mpsc::UnboundedSender<Message>,
}

impl MailboxHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn start(&self) -> Result<(), EngineError> {
        self.post(Message::Start)
    }

    pub fn stop(&self) -> Result<(), EngineError> {
        self.post(Message::Stop)
    }

    pub fn send(&self, event: EventObject) -> Result<(), EngineError> {
        self.post(Message::Send(event))
    }

    /// Self-directed event. Raises emitted by actions during a step take
    /// priority over queued external sends; from outside the instance
    /// this is an ordinary enqueue.
    pub fn raise(&self, event: EventObject) -> Result<(), EngineError> {
        self.post(Message::Raise(event))
    }

    /// Synchronous snapshot reply.
    pub async fn state(&self) -> Result<Snapshot, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.post(Message::AskState(reply_tx))?;
        reply_rx
            .await
            .map_err(|_| EngineError::InstanceGone(self.id.to_string()))
    }

    pub fn subscribe(
        &self,
        tag: impl Into<String>,
        sink: mpsc::UnboundedSender<Notification>,
    ) -> Result<(), EngineError> {
        self.post(Message::Subscribe {
            tag: tag.into(),
            sink,
        })
    }

    pub fn unsubscribe(&self, tag: impl Into<String>) -> Result<(), EngineError> {
        self.post(Message::Unsubscribe { tag: tag.into() })
    }

    pub(crate) fn post(&self, msg: Message) -> Result<(), EngineError> {
        self.tx
            .send(msg)
            .map_err(|_| EngineError::InstanceGone(self.id.to_string()))
    }
}

/// Spawn an instance: wrap `{program, context}` in a mailbox actor and
/// return its handle. Read-optimised layouts freeze the registries here,
/// before the first message is consumed.
pub fn spawn_instance(
    id: impl Into<Arc<str>>,
    program: Arc<Program>,
    mut ctx: MachineContext,
    options: InterpOptions,
    orchestrator: Option<Orchestrator>,
    spawner: Option<Arc<dyn ChildSpawner>>,
) -> MailboxHandle {
    let id: Arc<str> = id.into();
    match options.layout {
        Layout::NameKeyed => {}
        Layout::Frozen => ctx.freeze(),
        Layout::Dense => match program.symbols() {
            Some(symbols) => ctx.freeze_with(symbols),
            None => ctx.freeze(),
        },
    }

    let (tx, rx) = mpsc::unbounded_channel();
    let handle = MailboxHandle {
        id: id.clone(),
        tx: tx.clone(),
    };
    let actor = Actor {
        id: id.clone(),
        interp: Interp::new(program, id.clone(), options),
        ctx,
        raised: VecDeque::new(),
        timers: HashMap::new(),
        services: HashMap::new(),
        delayed_sends: Vec::new(),
        children: HashMap::new(),
        subscribers: HashMap::new(),
        orchestrator,
        spawner,
        self_tx: tx.downgrade(),
    };
    tokio::spawn(actor.run(rx));
    handle
}

struct Actor {
    id: Arc<str>,
    interp: Interp,
    ctx: MachineContext,
    /// Events raised during steps; drained before the channel.
    raised: VecDeque<EventObject>,
    /// Armed timer tasks by (state, after index).
    timers: HashMap<(StateIdx, usize), JoinHandle<()>>,
    /// Running service tasks by invocation id.
    services: HashMap<Uuid, JoinHandle<()>>,
    /// Outstanding delayed sends, cancelled on stop.
    delayed_sends: Vec<JoinHandle<()>>,
    /// Spawned child instances by child id.
    children: HashMap<String, MailboxHandle>,
    subscribers: HashMap<String, mpsc::UnboundedSender<Notification>>,
    orchestrator: Option<Orchestrator>,
    spawner: Option<Arc<dyn ChildSpawner>>,
    /// Weak so the actor's own tasks never keep the mailbox alive.
    self_tx: mpsc::WeakUnboundedSender<Message>,
}

impl Actor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Message>) {
        loop {
            // Raised events outrank anything still in the channel.
            if let Some(event) = self.raised.pop_front() {
                let report = self.interp.handle_event(&mut self.ctx, &event);
                self.perform(report).await;
                continue;
            }
            let Some(msg) = rx.recv().await else {
                break;
            };
            self.handle(msg).await;
        }
        // All handles dropped: tear down as if stopped.
        self.cancel_everything();
        tracing::debug!(instance = %self.id, "mailbox closed");
    }

    async fn handle(&mut self, msg: Message) {
        match msg {
            Message::Start => {
                let report = self.interp.start(&mut self.ctx);
                self.perform(report).await;
            }
            Message::Stop => {
                let report = self.interp.stop(&mut self.ctx);
                self.perform(report).await;
                self.cancel_everything();
            }
            Message::Send(event) | Message::Raise(event) => {
                let report = self.interp.handle_event(&mut self.ctx, &event);
                self.perform(report).await;
            }
            Message::AskState(reply) => {
                let _ = reply.send(self.interp.snapshot(&self.ctx));
            }
            Message::Subscribe { tag, sink } => {
                self.subscribers.insert(tag, sink);
            }
            Message::Unsubscribe { tag } => {
                self.subscribers.remove(&tag);
            }
            Message::DelayedFire {
                state,
                index,
                generation,
            } => {
                self.timers.remove(&(state, index));
                let report = self
                    .interp
                    .handle_timer(&mut self.ctx, state, index, generation);
                self.perform(report).await;
            }
            Message::ServiceDone { invocation, output } => {
                self.services.remove(&invocation);
                let report = self
                    .interp
                    .handle_service_done(&mut self.ctx, invocation, output);
                self.perform(report).await;
            }
            Message::ServiceError {
                invocation,
                message,
            } => {
                self.services.remove(&invocation);
                let report = self
                    .interp
                    .handle_service_error(&mut self.ctx, invocation, message);
                self.perform(report).await;
            }
        }
    }

    /// Perform a step's effects in order.
    async fn perform(&mut self, report: StepReport) {
        for effect in report.effects {
            match effect {
                Effect::ArmTimer {
                    state,
                    index,
                    delay_ms,
                    generation,
                } => self.arm_timer(state, index, delay_ms, generation),
                Effect::CancelTimers { state } => {
                    self.timers.retain(|&(timer_state, _), handle| {
                        if timer_state == state {
                            handle.abort();
                            false
                        } else {
                            true
                        }
                    });
                }
                Effect::StartService {
                    state: _,
                    invocation,
                    src,
                    input,
                } => self.start_service(invocation, &src, input).await,
                Effect::CancelService { invocation } => {
                    if let Some(handle) = self.services.remove(&invocation) {
                        handle.abort();
                    }
                }
                Effect::SendPeer {
                    to,
                    event,
                    delay_ms,
                } => self.send_peer(&to, event, delay_ms).await,
                Effect::Raise { event } => self.raised.push_back(event),
                Effect::SpawnChild { src, child_id } => self.spawn_child(&src, &child_id).await,
                Effect::StopPeer { target } => self.stop_peer(&target).await,
                Effect::Notify(notification) => self.publish(notification).await,
            }
        }
    }

    fn arm_timer(&mut self, state: StateIdx, index: usize, delay_ms: u64, generation: u64) {
        let tx = self.self_tx.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(Message::DelayedFire {
                    state,
                    index,
                    generation,
                });
            }
        });
        if let Some(stale) = self.timers.insert((state, index), task) {
            stale.abort();
        }
    }

    async fn start_service(&mut self, invocation: Uuid, src: &str, input: Value) {
        let Some(service) = self.ctx.service(src) else {
            let error = EngineError::UnknownService(src.to_string());
            self.ctx.record_error(error.code(), &error.to_string());
            self.publish(Notification::Diagnostic {
                instance: self.id.to_string(),
                code: error.code().into(),
                message: error.to_string(),
                at: now_ms(),
            })
            .await;
            // Route through the state's onError like any service failure.
            let report =
                self.interp
                    .handle_service_error(&mut self.ctx, invocation, error.to_string());
            Box::pin(self.perform(report)).await;
            return;
        };
        let tx = self.self_tx.clone();
        let task = tokio::spawn(async move {
            let outcome = service.call(input).await;
            let Some(tx) = tx.upgrade() else { return };
            let _ = match outcome {
                Ok(output) => tx.send(Message::ServiceDone { invocation, output }),
                Err(e) => tx.send(Message::ServiceError {
                    invocation,
                    message: format!("{e:#}"),
                }),
            };
        });
        self.services.insert(invocation, task);
    }

    async fn send_peer(&mut self, to: &str, event: EventObject, delay_ms: Option<u64>) {
        let target = match self.ctx.peer(to) {
            Some(handle) => Some(handle.clone()),
            None => match &self.orchestrator {
                Some(orchestrator) => orchestrator.lookup(to).await,
                None => None,
            },
        };
        let Some(target) = target else {
            let error = EngineError::UnknownPeer(to.to_string());
            tracing::warn!(instance = %self.id, peer = %to, "send to unknown peer dropped");
            self.publish(Notification::Diagnostic {
                instance: self.id.to_string(),
                code: error.code().into(),
                message: error.to_string(),
                at: now_ms(),
            })
            .await;
            return;
        };

        match delay_ms {
            None => {
                let _ = target.send(event);
            }
            Some(delay_ms) => {
                // Owned by this instance: cancelled if it stops first.
                self.delayed_sends.push(tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    let _ = target.send(event);
                }));
                self.delayed_sends.retain(|task| !task.is_finished());
            }
        }
    }

    async fn spawn_child(&mut self, src: &str, child_id: &str) {
        let Some(spawner) = self.spawner.clone() else {
            tracing::warn!(instance = %self.id, %src, "spawn request with no spawner configured");
            self.publish(Notification::Diagnostic {
                instance: self.id.to_string(),
                code: "unknown_machine".into(),
                message: format!("cannot spawn `{src}`: no machine registry attached"),
                at: now_ms(),
            })
            .await;
            return;
        };
        match spawner.spawn_child(&self.id, src, child_id).await {
            Ok(child) => {
                self.ctx.take_spawn_request(child_id);
                self.ctx.register_peer(child_id, child.clone());
                let _ = child.start();
                self.children.insert(child_id.to_string(), child);
            }
            Err(e) => {
                self.ctx.record_error(e.code(), &e.to_string());
                self.publish(Notification::Diagnostic {
                    instance: self.id.to_string(),
                    code: e.code().into(),
                    message: e.to_string(),
                    at: now_ms(),
                })
                .await;
            }
        }
    }

    async fn stop_peer(&mut self, target: &str) {
        if let Some(child) = self.children.remove(target) {
            let _ = child.stop();
            return;
        }
        if let Some(peer) = self.ctx.peer(target).cloned() {
            let _ = peer.stop();
            return;
        }
        if let Some(orchestrator) = &self.orchestrator {
            if let Some(handle) = orchestrator.lookup(target).await {
                let _ = handle.stop();
                return;
            }
        }
        tracing::warn!(instance = %self.id, peer = %target, "stop request for unknown peer");
    }

    async fn publish(&mut self, notification: Notification) {
        self.subscribers
            .retain(|_, sink| sink.send(notification.clone()).is_ok());
        if let Some(orchestrator) = &self.orchestrator {
            orchestrator.publish(&notification).await;
        }
    }

    /// Abort timers, services, delayed sends; stop spawned children.
    fn cancel_everything(&mut self) {
        for (_, task) in self.timers.drain() {
            task.abort();
        }
        for (_, task) in self.services.drain() {
            task.abort();
        }
        for task in self.delayed_sends.drain(..) {
            task.abort();
        }
        for (_, child) in self.children.drain() {
            let _ = child.stop();
        }
    }
}

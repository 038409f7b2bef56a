//! Execution context — per-instance extended state plus the host
//! registries (actions, guards, services, peer mailboxes).
//!
//! Registries are populated before the first `Start` and frozen for the
//! read-optimised layouts; the peer table stays dynamic. Freezing against
//! a dense program also tabulates id-indexed callback tables so the hot
//! path resolves host code without hashing.

use crate::compiler::symbols::Symbols;
use crate::error::EngineError;
use crate::mailbox::MailboxHandle;
use crate::types::{ActionRef, EventObject, GuardRef};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// The extended state: a plain key→value map.
pub type Vars = BTreeMap<String, Value>;

/// Host action: mutates the extended state. Must be synchronous and short.
pub type ActionFn = dyn Fn(&mut Vars, &EventObject) -> anyhow::Result<()> + Send + Sync;

/// Host guard: a predicate over (context, event payload).
pub type GuardFn = dyn Fn(&Vars, &EventObject) -> anyhow::Result<bool> + Send + Sync;

/// An invoked service — the only sanctioned asynchronous boundary.
/// Completion or failure re-enters the instance as an internal event.
#[async_trait]
pub trait Service: Send + Sync {
    async fn call(&self, input: Value) -> anyhow::Result<Value>;
}

/// Adapter so plain async closures register as services.
pub struct ServiceFn<F>(pub F);

#[async_trait]
impl<F, Fut> Service for ServiceFn<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = anyhow::Result<Value>> + Send,
{
    async fn call(&self, input: Value) -> anyhow::Result<Value> {
        (self.0)(input).await
    }
}

/// Context key prefix marking a pending spawn request for the mailbox.
pub const SPAWN_REQUEST_PREFIX: &str = "_spawn_request_";

#[derive(Default)]
pub struct MachineContext {
    vars: Vars,
    actions: HashMap<String, Arc<ActionFn>>,
    guards: HashMap<String, Arc<GuardFn>>,
    services: HashMap<String, Arc<dyn Service>>,
    peers: HashMap<String, MailboxHandle>,
    frozen: bool,
    /// Id-indexed tables, present after `freeze_with`.
    actions_dense: Vec<Option<Arc<ActionFn>>>,
    guards_dense: Vec<Option<Arc<GuardFn>>>,
}

impl MachineContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_vars(vars: Vars) -> Self {
        Self {
            vars,
            ..Self::default()
        }
    }

    // ── Extended state ──

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.vars.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.vars.insert(key.into(), value);
    }

    /// Apply all pairs of `patch` as a single conceptual step.
    pub fn assign(&mut self, patch: &BTreeMap<String, Value>) {
        for (k, v) in patch {
            self.vars.insert(k.clone(), v.clone());
        }
    }

    pub fn vars(&self) -> &Vars {
        &self.vars
    }

    pub fn vars_mut(&mut self) -> &mut Vars {
        &mut self.vars
    }

    /// Replace the whole map (step rollback).
    pub fn restore_vars(&mut self, vars: Vars) {
        self.vars = vars;
    }

    pub fn record_error(&mut self, code: &str, message: &str) {
        self.vars
            .insert("error_code".into(), Value::String(code.into()));
        self.vars
            .insert("error_message".into(), Value::String(message.into()));
    }

    // ── Registries ──

    pub fn register_action<F>(&mut self, name: impl Into<String>, f: F) -> Result<(), EngineError>
    where
        F: Fn(&mut Vars, &EventObject) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        if self.frozen {
            return Err(EngineError::ContextFrozen);
        }
        self.actions.insert(name.into(), Arc::new(f));
        Ok(())
    }

    pub fn register_guard<F>(&mut self, name: impl Into<String>, f: F) -> Result<(), EngineError>
    where
        F: Fn(&Vars, &EventObject) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        if self.frozen {
            return Err(EngineError::ContextFrozen);
        }
        self.guards.insert(name.into(), Arc::new(f));
        Ok(())
    }

    pub fn register_service(
        &mut self,
        name: impl Into<String>,
        service: impl Service + 'static,
    ) -> Result<(), EngineError> {
        if self.frozen {
            return Err(EngineError::ContextFrozen);
        }
        self.services.insert(name.into(), Arc::new(service));
        Ok(())
    }

    /// Mark the registries read-only.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    /// Freeze and tabulate id-indexed callback tables for a dense program.
    pub fn freeze_with(&mut self, symbols: &Symbols) {
        self.actions_dense = symbols
            .actions
            .iter()
            .map(|(_, name)| self.actions.get(name.as_ref()).cloned())
            .collect();
        self.guards_dense = symbols
            .guards
            .iter()
            .map(|(_, name)| self.guards.get(name.as_ref()).cloned())
            .collect();
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    // ── Resolution ──

    pub fn action(&self, r: &ActionRef) -> Option<Arc<ActionFn>> {
        if let Some(id) = r.dense {
            if !self.actions_dense.is_empty() {
                return self.actions_dense.get(id as usize).cloned().flatten();
            }
        }
        self.actions.get(r.name.as_ref()).cloned()
    }

    pub fn guard(&self, r: &GuardRef) -> Option<Arc<GuardFn>> {
        if let Some(id) = r.dense {
            if !self.guards_dense.is_empty() {
                return self.guards_dense.get(id as usize).cloned().flatten();
            }
        }
        self.guards.get(r.name.as_ref()).cloned()
    }

    pub fn service(&self, name: &str) -> Option<Arc<dyn Service>> {
        self.services.get(name).cloned()
    }

    // ── Peers (dynamic, allowed after freeze) ──

    pub fn register_peer(&mut self, id: impl Into<String>, handle: MailboxHandle) {
        self.peers.insert(id.into(), handle);
    }

    pub fn peer(&self, id: &str) -> Option<&MailboxHandle> {
        self.peers.get(id)
    }

    pub fn remove_peer(&mut self, id: &str) -> Option<MailboxHandle> {
        self.peers.remove(id)
    }

    // ── Spawn requests ──

    pub fn note_spawn_request(&mut self, child_id: &str, src: &str) {
        self.vars.insert(
            format!("{SPAWN_REQUEST_PREFIX}{child_id}"),
            Value::String(src.into()),
        );
    }

    pub fn take_spawn_request(&mut self, child_id: &str) -> Option<Value> {
        self.vars.remove(&format!("{SPAWN_REQUEST_PREFIX}{child_id}"))
    }
}

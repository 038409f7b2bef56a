//! Engine facade — wires the compiler, mailboxes and orchestrator
//! together behind one entry point.
//!
//! A machine is registered once (parse → verify → baseline compile) and
//! instantiated many times; each instance picks its own program layout.
//! The facade also services `spawn` actions from running instances: child
//! mailboxes are created under `parent.child_id` ids and stopped during
//! the parent's teardown.

use crate::compiler::{self, desc::StateDesc, parser};
use crate::context::MachineContext;
use crate::error::{ChartError, EngineError};
use crate::mailbox::{spawn_instance, ChildSpawner, MailboxHandle};
use crate::orchestrator::Orchestrator;
use crate::types::{InterpOptions, Layout, Program, Snapshot};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Host hook run on the fresh context of every spawned child of a machine.
pub type ContextSetup = Arc<dyn Fn(&mut MachineContext) + Send + Sync>;

struct EngineInner {
    machines: RwLock<HashMap<String, Arc<StateDesc>>>,
    /// Compiled programs, cached per (machine, layout).
    programs: RwLock<HashMap<(String, Layout), Arc<Program>>>,
    setups: RwLock<HashMap<String, ContextSetup>>,
    orchestrator: Orchestrator,
    defaults: InterpOptions,
}

#[derive(Clone)]
pub struct StatechartEngine {
    inner: Arc<EngineInner>,
}

impl Default for StatechartEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl StatechartEngine {
    pub fn new() -> Self {
        Self::with_defaults(InterpOptions::default())
    }

    pub fn with_defaults(defaults: InterpOptions) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                machines: RwLock::new(HashMap::new()),
                programs: RwLock::new(HashMap::new()),
                setups: RwLock::new(HashMap::new()),
                orchestrator: Orchestrator::new(),
                defaults,
            }),
        }
    }

    pub fn orchestrator(&self) -> Orchestrator {
        self.inner.orchestrator.clone()
    }

    // ── Machine registry ──

    /// Parse, verify and register a JSON chart. Returns the machine id.
    pub async fn register_machine_json(&self, text: &str) -> Result<String, ChartError> {
        let desc = parser::parse_chart(text)?;
        self.register_machine(desc).await
    }

    /// Parse, verify and register a YAML chart.
    pub async fn register_machine_yaml(&self, text: &str) -> Result<String, ChartError> {
        let desc = parser::parse_chart_yaml(text)?;
        self.register_machine(desc).await
    }

    /// Register an already-built description. The baseline layout is
    /// compiled eagerly so structural errors surface here, not at spawn.
    pub async fn register_machine(&self, desc: StateDesc) -> Result<String, ChartError> {
        let program = compiler::compile(&desc, Layout::NameKeyed)?;
        let id = desc.name.clone();
        tracing::info!(machine = %id, version = %hex(&program.version[..4]), "machine registered");
        self.inner
            .machines
            .write()
            .await
            .insert(id.clone(), Arc::new(desc));
        self.inner
            .programs
            .write()
            .await
            .insert((id.clone(), Layout::NameKeyed), Arc::new(program));
        Ok(id)
    }

    /// Attach a context initializer used when this machine is spawned as
    /// a child.
    pub async fn register_machine_setup(&self, machine_id: impl Into<String>, setup: ContextSetup) {
        self.inner
            .setups
            .write()
            .await
            .insert(machine_id.into(), setup);
    }

    /// The compiled program for a machine in the given layout, cached.
    pub async fn program(
        &self,
        machine_id: &str,
        layout: Layout,
    ) -> Result<Arc<Program>, ChartError> {
        let key = (machine_id.to_string(), layout);
        if let Some(program) = self.inner.programs.read().await.get(&key) {
            return Ok(program.clone());
        }
        let desc = self
            .inner
            .machines
            .read()
            .await
            .get(machine_id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownMachine(machine_id.to_string()))?;
        let program = Arc::new(compiler::compile(&desc, layout)?);
        self.inner
            .programs
            .write()
            .await
            .insert(key, program.clone());
        Ok(program)
    }

    // ── Instances ──

    /// Spawn an instance of a registered machine. The context carries the
    /// host registrations; the layout choice comes from `options`.
    pub async fn spawn(
        &self,
        machine_id: &str,
        instance_id: &str,
        ctx: MachineContext,
        options: Option<InterpOptions>,
    ) -> Result<MailboxHandle, ChartError> {
        let options = options.unwrap_or_else(|| self.inner.defaults.clone());
        let program = self.program(machine_id, options.layout).await?;
        let handle = spawn_instance(
            instance_id,
            program,
            ctx,
            options,
            Some(self.inner.orchestrator.clone()),
            Some(Arc::new(self.clone()) as Arc<dyn ChildSpawner>),
        );
        self.inner.orchestrator.register(handle.clone()).await;
        Ok(handle)
    }

    /// Stop an instance and drop its route.
    pub async fn stop(&self, instance_id: &str) -> Result<(), EngineError> {
        let handle = self
            .inner
            .orchestrator
            .lookup(instance_id)
            .await
            .ok_or_else(|| EngineError::InstanceGone(instance_id.to_string()))?;
        handle.stop()?;
        self.inner.orchestrator.unregister(instance_id).await;
        Ok(())
    }

    pub async fn send(
        &self,
        from: &str,
        to: &str,
        name: &str,
        payload: Value,
    ) -> Result<(), EngineError> {
        self.inner.orchestrator.send_event(from, to, name, payload).await
    }

    pub async fn snapshot(&self, instance_id: &str) -> Result<Snapshot, EngineError> {
        let handle = self
            .inner
            .orchestrator
            .lookup(instance_id)
            .await
            .ok_or_else(|| EngineError::InstanceGone(instance_id.to_string()))?;
        handle.state().await
    }
}

#[async_trait::async_trait]
impl ChildSpawner for StatechartEngine {
    async fn spawn_child(
        &self,
        parent: &str,
        src: &str,
        child_id: &str,
    ) -> Result<MailboxHandle, EngineError> {
        let program = self
            .program(src, self.inner.defaults.layout)
            .await
            .map_err(|_| EngineError::UnknownMachine(src.to_string()))?;
        let mut ctx = MachineContext::new();
        if let Some(setup) = self.inner.setups.read().await.get(src) {
            setup(&mut ctx);
        }
        let instance_id = format!("{parent}.{child_id}");
        tracing::debug!(%parent, %src, instance = %instance_id, "spawning child instance");
        let handle = spawn_instance(
            instance_id.as_str(),
            program,
            ctx,
            self.inner.defaults.clone(),
            Some(self.inner.orchestrator.clone()),
            Some(Arc::new(self.clone()) as Arc<dyn ChildSpawner>),
        );
        self.inner.orchestrator.register(handle.clone()).await;
        Ok(handle)
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

//! Interpreter core — the per-instance step engine.
//!
//! A step is synchronous and suspension-free: it reads the shared
//! `Program`, mutates the configuration vector and the execution context,
//! and reports everything with an outside effect (timers, services, sends,
//! spawns, notifications) as `Effect`s for the mailbox to perform. A step
//! that fails mid-commit restores the pre-step configuration and context
//! before returning.

use crate::context::MachineContext;
use crate::error::EngineError;
use crate::events::Notification;
use crate::types::{
    now_ms, EventObject, InterpOptions, Program, Snapshot, StateIdx, StateKind, Status, TransList,
    Transition,
};
use crate::types::{ActionOp, InvokeRec};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

// ─── Effects ──────────────────────────────────────────────────

/// Work the mailbox performs after the step returns, in order.
#[derive(Clone, Debug)]
pub enum Effect {
    ArmTimer {
        state: StateIdx,
        index: usize,
        delay_ms: u64,
        generation: u64,
    },
    /// Abort every armed timer task belonging to `state`.
    CancelTimers { state: StateIdx },
    StartService {
        state: StateIdx,
        invocation: Uuid,
        src: Arc<str>,
        input: Value,
    },
    CancelService { invocation: Uuid },
    /// Dispatch to a peer mailbox, optionally after a delay.
    SendPeer {
        to: Arc<str>,
        event: EventObject,
        delay_ms: Option<u64>,
    },
    /// Queue an event on this instance ahead of pending external sends;
    /// processed in the next step.
    Raise { event: EventObject },
    SpawnChild { src: Arc<str>, child_id: Arc<str> },
    StopPeer { target: Arc<str> },
    Notify(Notification),
}

/// Outcome of one step.
#[derive(Debug, Default)]
pub struct StepReport {
    pub effects: Vec<Effect>,
}

// ─── Interpreter ──────────────────────────────────────────────

/// A selected transition: a shared list plus an index into it.
#[derive(Clone)]
struct Sel {
    list: TransList,
    index: usize,
}

impl Sel {
    fn transition(&self) -> &Transition {
        &self.list[self.index]
    }
}

/// Rollback image taken at the start of every step.
struct Saved {
    config: Vec<StateIdx>,
    vars: crate::context::Vars,
    timers: HashMap<(StateIdx, usize), u64>,
    invocations: HashMap<Uuid, (StateIdx, Arc<str>)>,
    invocation_by_state: HashMap<StateIdx, Uuid>,
    completed_regions: BTreeSet<StateIdx>,
    status: Status,
    output: Option<Value>,
}

pub struct Interp {
    program: Arc<Program>,
    instance: Arc<str>,
    options: InterpOptions,
    /// Active leaves, ascending document order.
    config: Vec<StateIdx>,
    status: Status,
    started: bool,
    /// Armed delayed transitions: (state, after index) → generation.
    timers: HashMap<(StateIdx, usize), u64>,
    timer_generation: u64,
    /// Running invoked services.
    invocations: HashMap<Uuid, (StateIdx, Arc<str>)>,
    invocation_by_state: HashMap<StateIdx, Uuid>,
    /// Parallel regions whose final state has been reached.
    completed_regions: BTreeSet<StateIdx>,
    /// Output of the top-level final state once reached.
    output: Option<Value>,
}

impl Interp {
    pub fn new(program: Arc<Program>, instance: Arc<str>, options: InterpOptions) -> Self {
        Self {
            program,
            instance,
            options,
            config: Vec::new(),
            status: Status::Stopped,
            started: false,
            timers: HashMap::new(),
            timer_generation: 0,
            invocations: HashMap::new(),
            invocation_by_state: HashMap::new(),
            completed_regions: BTreeSet::new(),
            output: None,
        }
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn program(&self) -> &Arc<Program> {
        &self.program
    }

    /// Current active leaf paths, one per region.
    pub fn configuration(&self) -> Vec<String> {
        self.paths(&self.config)
    }

    // ── Lifecycle ──

    /// Enter the initial configuration, firing entry actions top-down.
    pub fn start(&mut self, ctx: &mut MachineContext) -> StepReport {
        if self.started && self.status == Status::Active {
            tracing::debug!(instance = %self.instance, "start ignored: already running");
            return StepReport::default();
        }

        // Seed declared context defaults without clobbering host-set keys.
        for (k, v) in &self.program.initial_context {
            if ctx.get(k).is_none() {
                ctx.set(k.clone(), v.clone());
            }
        }

        self.started = true;
        self.status = Status::Active;
        self.config.clear();
        self.timers.clear();
        self.invocations.clear();
        self.invocation_by_state.clear();
        self.completed_regions.clear();
        self.output = None;

        let saved = self.save(ctx);
        let mut effects = Vec::new();
        let event = EventObject::bare("statechart.start");

        let result = (|| -> Result<(), EngineError> {
            let t0 = Instant::now();
            let mut entry = BTreeSet::new();
            entry.insert(self.program.root);
            self.complete_entry_set(&mut entry);
            self.enter_states(ctx, &entry, &event, &mut effects)?;
            self.always_fixpoint(ctx, &event, &mut effects, t0)?;
            Ok(())
        })();

        match result {
            Ok(()) => {
                effects.insert(
                    0,
                    Effect::Notify(Notification::Started {
                        instance: self.instance.to_string(),
                        configuration: self.configuration(),
                    }),
                );
                StepReport { effects }
            }
            Err(e) => self.abort_step(ctx, saved, e),
        }
    }

    /// Exit every active state inner→outer and cancel all owned work.
    pub fn stop(&mut self, ctx: &mut MachineContext) -> StepReport {
        if self.status == Status::Stopped && self.config.is_empty() {
            // Stop after Stop is a no-op.
            return StepReport::default();
        }

        let mut effects = Vec::new();
        let event = EventObject::bare("statechart.stop");

        let mut exit: Vec<StateIdx> = self.active_set().into_iter().collect();
        exit.sort_by_key(|&s| (std::cmp::Reverse(self.program.state(s).depth), s));
        for &state in &exit {
            // A failing exit action cannot abort a stop; record and keep going.
            if let Err(e) = self.run_exit_actions(ctx, state, &event, &mut effects) {
                ctx.record_error(e.code(), &e.to_string());
                tracing::warn!(instance = %self.instance, error = %e, "exit action failed during stop");
            }
            self.cancel_state_work(state, &mut effects);
        }

        self.config.clear();
        self.completed_regions.clear();
        self.status = Status::Stopped;
        effects.push(Effect::Notify(Notification::Stopped {
            instance: self.instance.to_string(),
        }));
        StepReport { effects }
    }

    // ── Event steps ──

    /// Process one external (or raised) event to completion.
    pub fn handle_event(&mut self, ctx: &mut MachineContext, event: &EventObject) -> StepReport {
        if self.status != Status::Active {
            tracing::debug!(
                instance = %self.instance,
                event = %event.name,
                status = ?self.status,
                "event ignored: instance not active"
            );
            return StepReport::default();
        }

        let saved = self.save(ctx);
        let before = self.config.clone();
        let mut effects = Vec::new();

        let result = (|| -> Result<bool, EngineError> {
            let t0 = Instant::now();
            let selected = self.select_for_event(ctx, event)?;
            if selected.is_empty() {
                return Ok(false);
            }
            self.commit(ctx, selected, event, &mut effects)?;
            self.always_fixpoint(ctx, event, &mut effects, t0)?;
            Ok(true)
        })();

        match result {
            Ok(false) => {
                tracing::debug!(instance = %self.instance, event = %event.name, "event dropped: no active state accepts it");
                effects.push(Effect::Notify(Notification::EventDropped {
                    instance: self.instance.to_string(),
                    event: event.name.clone(),
                }));
                StepReport { effects }
            }
            Ok(true) => {
                if self.config != before {
                    effects.push(Effect::Notify(Notification::StateChanged {
                        instance: self.instance.to_string(),
                        from: self.paths(&before),
                        to: self.configuration(),
                        event: event.name.clone(),
                    }));
                }
                StepReport { effects }
            }
            Err(e) => self.abort_step(ctx, saved, e),
        }
    }

    /// An armed `after` timer elapsed.
    pub fn handle_timer(
        &mut self,
        ctx: &mut MachineContext,
        state: StateIdx,
        index: usize,
        generation: u64,
    ) -> StepReport {
        if self.status != Status::Active {
            return StepReport::default();
        }
        if self.timers.get(&(state, index)) != Some(&generation) {
            tracing::debug!(instance = %self.instance, state = %self.program.state(state).path, "stale timer ignored");
            return StepReport::default();
        }
        self.timers.remove(&(state, index));

        let rec = &self.program.state(state).after[index];
        let delay_ms = rec.delay_ms;
        let list = rec.transitions.clone();
        let event = EventObject::bare(format!("after.{delay_ms}"));

        let effects = vec![Effect::Notify(Notification::TimerFired {
            instance: self.instance.to_string(),
            state: self.program.state(state).path.to_string(),
            delay_ms,
        })];
        self.run_list_step(ctx, list, &event, effects)
    }

    /// An invoked service completed.
    pub fn handle_service_done(
        &mut self,
        ctx: &mut MachineContext,
        invocation: Uuid,
        output: Value,
    ) -> StepReport {
        if self.status != Status::Active {
            return StepReport::default();
        }
        let Some((state, src)) = self.invocations.remove(&invocation) else {
            tracing::debug!(instance = %self.instance, %invocation, "stale service completion ignored");
            return StepReport::default();
        };
        self.invocation_by_state.remove(&state);

        let invoke = self.invoke_of(state);
        let event = EventObject::new(format!("done.invoke.{src}"), output);
        let effects = vec![Effect::Notify(Notification::ServiceDone {
            instance: self.instance.to_string(),
            src: src.to_string(),
            invocation,
        })];
        match invoke {
            Some(invoke) => self.run_list_step(ctx, invoke.on_done, &event, effects),
            None => StepReport { effects },
        }
    }

    /// An invoked service failed.
    pub fn handle_service_error(
        &mut self,
        ctx: &mut MachineContext,
        invocation: Uuid,
        message: String,
    ) -> StepReport {
        if self.status != Status::Active {
            return StepReport::default();
        }
        let Some((state, src)) = self.invocations.remove(&invocation) else {
            tracing::debug!(instance = %self.instance, %invocation, "stale service failure ignored");
            return StepReport::default();
        };
        self.invocation_by_state.remove(&state);

        ctx.record_error("service_error", &message);
        let invoke = self.invoke_of(state);
        let event = EventObject::new(
            format!("error.invoke.{src}"),
            Value::String(message.clone()),
        );
        let effects = vec![Effect::Notify(Notification::ServiceFailed {
            instance: self.instance.to_string(),
            src: src.to_string(),
            invocation,
            message,
        })];
        match invoke {
            Some(invoke) => self.run_list_step(ctx, invoke.on_error, &event, effects),
            None => StepReport { effects },
        }
    }

    fn invoke_of(&self, state: StateIdx) -> Option<InvokeRec> {
        self.program.state(state).invoke.clone()
    }

    /// Drive one step whose candidate transitions come from a fixed list
    /// (delayed transitions, service onDone/onError).
    fn run_list_step(
        &mut self,
        ctx: &mut MachineContext,
        list: TransList,
        event: &EventObject,
        mut effects: Vec<Effect>,
    ) -> StepReport {
        let saved = self.save(ctx);
        let before = self.config.clone();

        let result = (|| -> Result<(), EngineError> {
            let t0 = Instant::now();
            if let Some(sel) = self.select_from_list(ctx, &list, event)? {
                self.commit(ctx, vec![sel], event, &mut effects)?;
                self.always_fixpoint(ctx, event, &mut effects, t0)?;
            }
            Ok(())
        })();

        match result {
            Ok(()) => {
                if self.config != before {
                    effects.push(Effect::Notify(Notification::StateChanged {
                        instance: self.instance.to_string(),
                        from: self.paths(&before),
                        to: self.configuration(),
                        event: event.name.clone(),
                    }));
                }
                StepReport { effects }
            }
            Err(e) => self.abort_step(ctx, saved, e),
        }
    }

    // ── Snapshot ──

    /// Pure function of configuration + context.
    pub fn snapshot(&self, ctx: &MachineContext) -> Snapshot {
        let current_state = match self.config.len() {
            0 => Value::Null,
            1 => Value::String(self.program.state(self.config[0]).path.to_string()),
            _ => Value::Array(
                self.config
                    .iter()
                    .map(|&s| Value::String(self.program.state(s).path.to_string()))
                    .collect(),
            ),
        };
        let leaf = self.config.first().map(|&s| self.program.state(s));
        Snapshot {
            current_state,
            context: ctx.vars().clone(),
            is_running: self.status == Status::Active,
            status: self.status,
            meta: leaf.and_then(|s| s.meta.as_deref().cloned()),
            tags: leaf.and_then(|s| s.tags.as_deref().cloned()),
            output: self.output.clone(),
            description: leaf.and_then(|s| s.description.as_deref().map(str::to_owned)),
        }
    }

    // ── Selection ──

    /// Inner-first lookup across every active region; each state's
    /// transition list is consulted at most once per step.
    fn select_for_event(
        &self,
        ctx: &MachineContext,
        event: &EventObject,
    ) -> Result<Vec<Sel>, EngineError> {
        let mut selected = Vec::new();
        // state → whether it selected a transition, memoized so no guard
        // runs twice across a parallel broadcast.
        let mut considered: HashMap<StateIdx, bool> = HashMap::new();

        for &leaf in &self.config {
            for state in self.program.chain(leaf) {
                match considered.get(&state) {
                    Some(true) => break,
                    Some(false) => continue,
                    None => {}
                }
                let hit = match self.program.transitions_on(state, &event.name) {
                    Some(list) => self.first_enabled(ctx, list, event)?,
                    None => None,
                };
                match hit {
                    Some(sel) => {
                        considered.insert(state, true);
                        selected.push(sel);
                        break;
                    }
                    None => {
                        considered.insert(state, false);
                    }
                }
            }
        }
        Ok(selected)
    }

    /// Eventless transitions on active states, innermost first.
    fn select_always(
        &self,
        ctx: &MachineContext,
        event: &EventObject,
    ) -> Result<Vec<Sel>, EngineError> {
        let mut selected = Vec::new();
        let mut considered: HashMap<StateIdx, bool> = HashMap::new();

        for &leaf in &self.config {
            for state in self.program.chain(leaf) {
                match considered.get(&state) {
                    Some(true) => break,
                    Some(false) => continue,
                    None => {}
                }
                let list = self.program.state(state).always.clone();
                let hit = if list.is_empty() {
                    None
                } else {
                    self.first_enabled(ctx, &list, event)?
                };
                match hit {
                    Some(sel) => {
                        considered.insert(state, true);
                        selected.push(sel);
                        break;
                    }
                    None => {
                        considered.insert(state, false);
                    }
                }
            }
        }
        Ok(selected)
    }

    /// Declaration order, first passing guard wins.
    fn first_enabled(
        &self,
        ctx: &MachineContext,
        list: &TransList,
        event: &EventObject,
    ) -> Result<Option<Sel>, EngineError> {
        for (index, t) in list.iter().enumerate() {
            if self.guard_passes(ctx, t, event)? {
                return Ok(Some(Sel {
                    list: list.clone(),
                    index,
                }));
            }
        }
        Ok(None)
    }

    fn select_from_list(
        &self,
        ctx: &MachineContext,
        list: &TransList,
        event: &EventObject,
    ) -> Result<Option<Sel>, EngineError> {
        if list.is_empty() {
            return Ok(None);
        }
        self.first_enabled(ctx, list, event)
    }

    fn guard_passes(
        &self,
        ctx: &MachineContext,
        t: &Transition,
        event: &EventObject,
    ) -> Result<bool, EngineError> {
        let Some(gref) = &t.guard else {
            return Ok(true);
        };
        let guard = ctx
            .guard(gref)
            .ok_or_else(|| EngineError::UnknownGuard(gref.name.to_string()))?;
        guard(ctx.vars(), event).map_err(|e| EngineError::HostFault {
            kind: "guard",
            name: gref.name.to_string(),
            message: format!("{e:#}"),
        })
    }

    // ── Commit ──

    /// Apply the selected transitions as one joint commit: exits
    /// inner→outer, transition actions in selection order, entries
    /// outer→inner with initial completion.
    fn commit(
        &mut self,
        ctx: &mut MachineContext,
        selected: Vec<Sel>,
        event: &EventObject,
        effects: &mut Vec<Effect>,
    ) -> Result<(), EngineError> {
        let active = self.active_set();

        // Conflict resolution: selection order (region declaration order)
        // wins; a transition whose exit set overlaps an earlier one's is
        // discarded.
        let mut union_exit: BTreeSet<StateIdx> = BTreeSet::new();
        let mut union_entry: BTreeSet<StateIdx> = BTreeSet::new();
        let mut kept: Vec<Sel> = Vec::new();
        for sel in selected {
            let t = sel.transition();
            if t.targets.is_empty() {
                kept.push(sel);
                continue;
            }
            let (exit_set, entry_set) = self.transition_sets(t, &active);
            if !exit_set.is_disjoint(&union_exit) {
                effects.push(Effect::Notify(Notification::Diagnostic {
                    instance: self.instance.to_string(),
                    code: "transition_conflict".into(),
                    message: format!(
                        "transition from `{}` dropped: exit set collides with an earlier region's selection",
                        self.program.state(t.source).path
                    ),
                    at: now_ms(),
                }));
                continue;
            }
            union_exit.extend(exit_set);
            union_entry.extend(entry_set);
            kept.push(sel);
        }

        // Exit inner→outer; regions leave in declaration order.
        let mut exit_order: Vec<StateIdx> = union_exit.iter().copied().collect();
        exit_order.sort_by_key(|&s| (std::cmp::Reverse(self.program.state(s).depth), s));
        for &state in &exit_order {
            self.run_exit_actions(ctx, state, event, effects)?;
            self.cancel_state_work(state, effects);
        }
        self.config.retain(|leaf| !union_exit.contains(leaf));
        self.completed_regions
            .retain(|region| !union_exit.contains(region));

        // Transition actions, in selection order.
        for sel in &kept {
            let t = sel.transition();
            effects.push(Effect::Notify(Notification::TransitionTaken {
                instance: self.instance.to_string(),
                source: self.program.state(t.source).path.to_string(),
                targets: t
                    .targets
                    .iter()
                    .map(|&tg| self.program.state(tg).path.to_string())
                    .collect(),
                event: event.name.clone(),
            }));
            for op in t.actions.iter() {
                self.run_action_op(ctx, op, event, effects)?;
            }
        }

        // Enter outer→inner (preorder arena index is document order).
        self.enter_states(ctx, &union_entry, event, effects)?;
        Ok(())
    }

    /// Exit/entry sets for one transition against the active set.
    fn transition_sets(
        &self,
        t: &Transition,
        active: &BTreeSet<StateIdx>,
    ) -> (BTreeSet<StateIdx>, BTreeSet<StateIdx>) {
        // Internal self-transition: no exits, no entries.
        if t.internal && t.targets.iter().all(|&tg| tg == t.source) {
            return (BTreeSet::new(), BTreeSet::new());
        }

        let domain = self.transition_domain(t);
        let exit_set: BTreeSet<StateIdx> = active
            .iter()
            .copied()
            .filter(|&s| self.program.is_ancestor(domain, s))
            .collect();

        let mut entry_set = BTreeSet::new();
        for &target in t.targets.iter() {
            let mut cur = target;
            while cur != domain {
                entry_set.insert(cur);
                match self.program.state(cur).parent {
                    Some(p) => cur = p,
                    None => break,
                }
            }
        }
        self.complete_entry_set(&mut entry_set);
        (exit_set, entry_set)
    }

    fn transition_domain(&self, t: &Transition) -> StateIdx {
        // Internal transition into the source's own descendants keeps the
        // source active.
        if t.internal
            && t.targets
                .iter()
                .all(|&tg| tg == t.source || self.program.is_ancestor(t.source, tg))
        {
            return t.source;
        }
        let mut domain = t.source;
        for &target in t.targets.iter() {
            domain = self.program.lca(domain, target);
        }
        if domain == t.source {
            // External transitions exit their source.
            if let Some(parent) = self.program.state(t.source).parent {
                domain = parent;
            }
        }
        domain
    }

    /// Close an entry set under initial-completion: compound members pull
    /// in their initial chain unless a more specific target is present,
    /// parallel members pull in every region.
    fn complete_entry_set(&self, entry: &mut BTreeSet<StateIdx>) {
        let mut queue: Vec<StateIdx> = entry.iter().copied().collect();
        while let Some(state) = queue.pop() {
            let rec = self.program.state(state);
            match rec.kind {
                StateKind::Compound => {
                    let has_specific = rec.children.iter().any(|c| entry.contains(c));
                    if !has_specific {
                        if let Some(initial) = rec.initial {
                            if entry.insert(initial) {
                                queue.push(initial);
                            }
                        }
                    }
                }
                StateKind::Parallel => {
                    for &child in rec.children.iter() {
                        if entry.insert(child) {
                            queue.push(child);
                        }
                    }
                }
                StateKind::Atomic | StateKind::Final => {}
            }
        }
    }

    /// Enter states outer→inner, run entry actions, arm timers, start
    /// services, and fold final states into region/instance completion.
    fn enter_states(
        &mut self,
        ctx: &mut MachineContext,
        entry: &BTreeSet<StateIdx>,
        event: &EventObject,
        effects: &mut Vec<Effect>,
    ) -> Result<(), EngineError> {
        for &state in entry {
            let rec = self.program.state(state).clone();
            for op in rec.entry.iter() {
                self.run_action_op(ctx, op, event, effects)?;
            }

            for (index, after) in rec.after.iter().enumerate() {
                self.timer_generation += 1;
                self.timers.insert((state, index), self.timer_generation);
                effects.push(Effect::ArmTimer {
                    state,
                    index,
                    delay_ms: after.delay_ms,
                    generation: self.timer_generation,
                });
                effects.push(Effect::Notify(Notification::TimerArmed {
                    instance: self.instance.to_string(),
                    state: rec.path.to_string(),
                    delay_ms: after.delay_ms,
                }));
            }

            if let Some(invoke) = &rec.invoke {
                let invocation = Uuid::now_v7();
                self.invocations
                    .insert(invocation, (state, invoke.src.clone()));
                self.invocation_by_state.insert(state, invocation);
                effects.push(Effect::StartService {
                    state,
                    invocation,
                    src: invoke.src.clone(),
                    input: invoke.data.as_deref().cloned().unwrap_or(Value::Null),
                });
                effects.push(Effect::Notify(Notification::ServiceStarted {
                    instance: self.instance.to_string(),
                    state: rec.path.to_string(),
                    src: invoke.src.to_string(),
                    invocation,
                }));
            }

            if rec.kind == StateKind::Final {
                self.on_final_entered(state, effects);
            }
        }

        // New leaves: entered or surviving states with no active child.
        let mut new_active = self.active_set();
        new_active.extend(entry.iter().copied());
        self.config = new_active
            .iter()
            .copied()
            .filter(|&s| {
                !self
                    .program
                    .state(s)
                    .children
                    .iter()
                    .any(|c| new_active.contains(c))
            })
            .collect();
        self.config.sort_unstable();
        Ok(())
    }

    /// Final-state bookkeeping: top-level final completes the instance;
    /// a final region child marks the region and, once every sibling
    /// region is complete, raises the parallel parent's done event.
    fn on_final_entered(&mut self, state: StateIdx, effects: &mut Vec<Effect>) {
        let rec = self.program.state(state);
        let Some(parent) = rec.parent else {
            return;
        };

        if parent == self.program.root {
            self.status = Status::Done;
            self.output = rec.output.as_deref().cloned();
            effects.push(Effect::Notify(Notification::Done {
                instance: self.instance.to_string(),
                output: self.output.clone(),
            }));
            return;
        }

        let parent_rec = self.program.state(parent);
        let done_event = format!("done.state.{}", parent_rec.path.trim_start_matches('#'));
        effects.push(Effect::Raise {
            event: EventObject::bare(done_event),
        });

        if let Some(grandparent) = parent_rec.parent {
            if self.program.state(grandparent).kind == StateKind::Parallel {
                self.completed_regions.insert(parent);
                effects.push(Effect::Notify(Notification::RegionCompleted {
                    instance: self.instance.to_string(),
                    region: parent_rec.path.to_string(),
                }));
                let all_done = self
                    .program
                    .state(grandparent)
                    .children
                    .iter()
                    .all(|region| self.completed_regions.contains(region));
                if all_done {
                    let done_event = format!(
                        "done.state.{}",
                        self.program.state(grandparent).path.trim_start_matches('#')
                    );
                    effects.push(Effect::Raise {
                        event: EventObject::bare(done_event),
                    });
                }
            }
        }
    }

    // ── Microstep fixpoint ──

    /// Re-evaluate eventless transitions until none fire, bounded by the
    /// microstep cap and the optional step wall bound.
    fn always_fixpoint(
        &mut self,
        ctx: &mut MachineContext,
        event: &EventObject,
        effects: &mut Vec<Effect>,
        t0: Instant,
    ) -> Result<(), EngineError> {
        let mut rounds: u32 = 0;
        loop {
            if self.status != Status::Active {
                return Ok(());
            }
            if let Some(bound) = self.options.step_timeout_ms {
                if t0.elapsed().as_millis() as u64 > bound {
                    return Err(EngineError::StepTimeout(bound));
                }
            }
            rounds += 1;
            if rounds > self.options.microstep_cap {
                return Err(EngineError::MicrostepOverflow(self.options.microstep_cap));
            }
            let selected = self.select_always(ctx, event)?;
            if selected.is_empty() {
                return Ok(());
            }
            self.commit(ctx, selected, event, effects)?;
        }
    }

    // ── Actions ──

    fn run_exit_actions(
        &mut self,
        ctx: &mut MachineContext,
        state: StateIdx,
        event: &EventObject,
        effects: &mut Vec<Effect>,
    ) -> Result<(), EngineError> {
        let rec = self.program.state(state).clone();
        for op in rec.exit.iter() {
            self.run_action_op(ctx, op, event, effects)?;
        }
        Ok(())
    }

    /// Drop timers and the running service of an exited state.
    fn cancel_state_work(&mut self, state: StateIdx, effects: &mut Vec<Effect>) {
        let had_timers = self
            .timers
            .keys()
            .any(|&(timer_state, _)| timer_state == state);
        if had_timers {
            self.timers.retain(|&(timer_state, _), _| timer_state != state);
            effects.push(Effect::CancelTimers { state });
            effects.push(Effect::Notify(Notification::TimerCancelled {
                instance: self.instance.to_string(),
                state: self.program.state(state).path.to_string(),
            }));
        }
        if let Some(invocation) = self.invocation_by_state.remove(&state) {
            self.invocations.remove(&invocation);
            effects.push(Effect::CancelService { invocation });
        }
    }

    fn run_action_op(
        &mut self,
        ctx: &mut MachineContext,
        op: &ActionOp,
        event: &EventObject,
        effects: &mut Vec<Effect>,
    ) -> Result<(), EngineError> {
        match op {
            ActionOp::App(aref) => {
                let action = ctx
                    .action(aref)
                    .ok_or_else(|| EngineError::UnknownAction(aref.name.to_string()))?;
                action(ctx.vars_mut(), event).map_err(|e| EngineError::HostFault {
                    kind: "action",
                    name: aref.name.to_string(),
                    message: format!("{e:#}"),
                })
            }
            ActionOp::Assign(patch) => {
                ctx.assign(patch);
                Ok(())
            }
            ActionOp::Send {
                event: name,
                to,
                delay_ms,
                payload,
            } => {
                effects.push(Effect::SendPeer {
                    to: to.clone(),
                    event: EventObject::new(
                        name.to_string(),
                        payload.as_deref().cloned().unwrap_or(Value::Null),
                    ),
                    delay_ms: *delay_ms,
                });
                Ok(())
            }
            ActionOp::Raise {
                event: name,
                payload,
            } => {
                effects.push(Effect::Raise {
                    event: EventObject::new(
                        name.to_string(),
                        payload.as_deref().cloned().unwrap_or(Value::Null),
                    ),
                });
                Ok(())
            }
            ActionOp::Spawn { src, child_id } => {
                ctx.note_spawn_request(child_id, src);
                effects.push(Effect::SpawnChild {
                    src: src.clone(),
                    child_id: child_id.clone(),
                });
                effects.push(Effect::Notify(Notification::SpawnRequested {
                    instance: self.instance.to_string(),
                    child_id: child_id.to_string(),
                    src: src.to_string(),
                }));
                Ok(())
            }
            ActionOp::StopPeer { target } => {
                effects.push(Effect::StopPeer {
                    target: target.clone(),
                });
                Ok(())
            }
        }
    }

    // ── Step failure ──

    /// Restore the pre-step image, record the fault, and surface a
    /// diagnostic. Infrastructure faults park the instance in `error`.
    fn abort_step(
        &mut self,
        ctx: &mut MachineContext,
        saved: Saved,
        error: EngineError,
    ) -> StepReport {
        self.config = saved.config;
        ctx.restore_vars(saved.vars);
        self.timers = saved.timers;
        self.invocations = saved.invocations;
        self.invocation_by_state = saved.invocation_by_state;
        self.completed_regions = saved.completed_regions;
        self.status = saved.status;
        self.output = saved.output;

        ctx.record_error(error.code(), &error.to_string());
        if error.is_fatal() {
            self.status = Status::Error;
        }
        tracing::warn!(instance = %self.instance, error = %error, "step aborted");

        StepReport {
            effects: vec![Effect::Notify(Notification::Diagnostic {
                instance: self.instance.to_string(),
                code: error.code().into(),
                message: error.to_string(),
                at: now_ms(),
            })],
        }
    }

    // ── Helpers ──

    fn save(&self, ctx: &MachineContext) -> Saved {
        Saved {
            config: self.config.clone(),
            vars: ctx.vars().clone(),
            timers: self.timers.clone(),
            invocations: self.invocations.clone(),
            invocation_by_state: self.invocation_by_state.clone(),
            completed_regions: self.completed_regions.clone(),
            status: self.status,
            output: self.output.clone(),
        }
    }

    /// Leaves plus every ancestor.
    fn active_set(&self) -> BTreeSet<StateIdx> {
        let mut set = BTreeSet::new();
        for &leaf in &self.config {
            for state in self.program.chain(leaf) {
                set.insert(state);
            }
        }
        set
    }

    fn paths(&self, states: &[StateIdx]) -> Vec<String> {
        states
            .iter()
            .map(|&s| self.program.state(s).path.to_string())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{self, parser::parse_chart};
    use crate::types::Layout;
    use serde_json::json;

    fn build(json: &str, layout: Layout) -> (Interp, MachineContext) {
        let desc = parse_chart(json).unwrap();
        let program = Arc::new(compiler::compile(&desc, layout).unwrap());
        let symbols = program.symbols().cloned();
        let interp = Interp::new(program, Arc::from("test"), InterpOptions {
            layout,
            ..InterpOptions::default()
        });
        let mut ctx = MachineContext::new();
        if let Some(symbols) = symbols {
            ctx.freeze_with(&symbols);
        }
        (interp, ctx)
    }

    const LIGHT: &str = r#"{
        "id": "light",
        "initial": "red",
        "states": {
            "red": { "on": { "TIMER": "green" } },
            "green": { "on": { "TIMER": "yellow" } },
            "yellow": { "on": { "TIMER": "red" } }
        }
    }"#;

    fn leaf(interp: &Interp) -> String {
        interp.configuration().join(",")
    }

    #[test]
    fn test_traffic_light_cycle() {
        for layout in [Layout::NameKeyed, Layout::Frozen, Layout::Dense] {
            let (mut interp, mut ctx) = build(LIGHT, layout);
            interp.start(&mut ctx);
            let mut seen = vec![leaf(&interp)];
            for _ in 0..4 {
                interp.handle_event(&mut ctx, &EventObject::bare("TIMER"));
                seen.push(leaf(&interp));
            }
            assert_eq!(
                seen,
                vec![
                    "#light.red",
                    "#light.green",
                    "#light.yellow",
                    "#light.red",
                    "#light.green"
                ],
                "layout {layout:?}"
            );
        }
    }

    #[test]
    fn test_unknown_event_drops_silently() {
        let (mut interp, mut ctx) = build(LIGHT, Layout::NameKeyed);
        interp.start(&mut ctx);
        let report = interp.handle_event(&mut ctx, &EventObject::bare("NOPE"));
        assert_eq!(leaf(&interp), "#light.red");
        assert!(report.effects.iter().any(|e| matches!(
            e,
            Effect::Notify(Notification::EventDropped { .. })
        )));
    }

    #[test]
    fn test_guarded_transition_first_match_wins() {
        let chart = r#"{
            "id": "m",
            "initial": "op",
            "context": { "canGo": true },
            "states": {
                "op": {
                    "initial": "idle",
                    "states": {
                        "idle": { "on": { "GO": { "target": "busy", "cond": "canGo" } } },
                        "busy": { "on": { "DONE": "idle" } }
                    }
                }
            }
        }"#;
        let (mut interp, mut ctx) = build(chart, Layout::NameKeyed);
        ctx.register_guard("canGo", |vars, _| {
            Ok(vars.get("canGo").and_then(|v| v.as_bool()).unwrap_or(false))
        })
        .unwrap();
        interp.start(&mut ctx);
        assert_eq!(leaf(&interp), "#m.op.idle");

        interp.handle_event(&mut ctx, &EventObject::bare("GO"));
        assert_eq!(leaf(&interp), "#m.op.busy");
        interp.handle_event(&mut ctx, &EventObject::bare("DONE"));
        assert_eq!(leaf(&interp), "#m.op.idle");

        // Guard now denies: the configuration must not change.
        ctx.set("canGo", json!(false));
        let report = interp.handle_event(&mut ctx, &EventObject::bare("GO"));
        assert_eq!(leaf(&interp), "#m.op.idle");
        assert!(report.effects.iter().any(|e| matches!(
            e,
            Effect::Notify(Notification::EventDropped { .. })
        )));
    }

    #[test]
    fn test_entry_exit_ordering_nested() {
        let chart = r##"{
            "id": "m",
            "initial": "a",
            "states": {
                "a": {
                    "initial": "a1",
                    "entry": { "type": "assign", "values": { "unused": 0 } },
                    "exit": "traceExitA",
                    "states": {
                        "a1": { "exit": "traceExitA1", "on": { "JUMP": "#m.b.b1" } }
                    }
                },
                "b": {
                    "initial": "b1",
                    "entry": "traceEnterB",
                    "states": {
                        "b1": { "entry": "traceEnterB1" }
                    }
                }
            }
        }"##;
        let (mut interp, mut ctx) = build(chart, Layout::NameKeyed);
        for name in ["traceExitA", "traceExitA1", "traceEnterB", "traceEnterB1"] {
            ctx.register_action(name, move |vars, _| {
                let trail = vars.entry("trail".to_string()).or_insert_with(|| json!([]));
                trail.as_array_mut().unwrap().push(json!(name));
                Ok(())
            })
            .unwrap();
        }
        interp.start(&mut ctx);
        interp.handle_event(&mut ctx, &EventObject::bare("JUMP"));
        // Exit inner→outer, enter outer→inner.
        assert_eq!(
            ctx.get("trail").unwrap(),
            &json!(["traceExitA1", "traceExitA", "traceEnterB", "traceEnterB1"])
        );
    }

    #[test]
    fn test_parallel_multi_target_joint_commit() {
        let chart = r#"{
            "id": "m",
            "initial": "p",
            "on": { "SYNC": { "target": ["a2", "b2"] } },
            "states": {
                "p": {
                    "type": "parallel",
                    "states": {
                        "A": { "initial": "a1", "states": { "a1": {}, "a2": {} } },
                        "B": { "initial": "b1", "states": { "b1": {}, "b2": {} } }
                    }
                }
            }
        }"#;
        let (mut interp, mut ctx) = build(chart, Layout::NameKeyed);
        interp.start(&mut ctx);
        assert_eq!(interp.configuration(), vec!["#m.p.A.a1", "#m.p.B.b1"]);

        interp.handle_event(&mut ctx, &EventObject::bare("SYNC"));
        assert_eq!(interp.configuration(), vec!["#m.p.A.a2", "#m.p.B.b2"]);
    }

    #[test]
    fn test_parallel_broadcast_each_region_selects() {
        let chart = r#"{
            "id": "m",
            "initial": "p",
            "states": {
                "p": {
                    "type": "parallel",
                    "states": {
                        "A": {
                            "initial": "a1",
                            "states": { "a1": { "on": { "PING": "a2" } }, "a2": {} }
                        },
                        "B": {
                            "initial": "b1",
                            "states": { "b1": { "on": { "PING": "b2" } }, "b2": {} }
                        }
                    }
                }
            }
        }"#;
        let (mut interp, mut ctx) = build(chart, Layout::NameKeyed);
        interp.start(&mut ctx);
        interp.handle_event(&mut ctx, &EventObject::bare("PING"));
        assert_eq!(interp.configuration(), vec!["#m.p.A.a2", "#m.p.B.b2"]);
    }

    #[test]
    fn test_internal_self_transition_skips_exit_entry() {
        let chart = r#"{
            "id": "m",
            "initial": "a",
            "states": {
                "a": {
                    "entry": "traceEnter",
                    "exit": "traceExit",
                    "on": {
                        "BUMP": { "target": "a", "internal": true, "actions": "bump" }
                    }
                }
            }
        }"#;
        let (mut interp, mut ctx) = build(chart, Layout::NameKeyed);
        ctx.register_action("traceEnter", |vars, _| {
            let n = vars.get("enters").and_then(|v| v.as_i64()).unwrap_or(0);
            vars.insert("enters".into(), json!(n + 1));
            Ok(())
        })
        .unwrap();
        ctx.register_action("traceExit", |vars, _| {
            let n = vars.get("exits").and_then(|v| v.as_i64()).unwrap_or(0);
            vars.insert("exits".into(), json!(n + 1));
            Ok(())
        })
        .unwrap();
        ctx.register_action("bump", |vars, _| {
            let n = vars.get("bumps").and_then(|v| v.as_i64()).unwrap_or(0);
            vars.insert("bumps".into(), json!(n + 1));
            Ok(())
        })
        .unwrap();

        interp.start(&mut ctx);
        interp.handle_event(&mut ctx, &EventObject::bare("BUMP"));
        assert_eq!(ctx.get("enters"), Some(&json!(1)));
        assert_eq!(ctx.get("exits"), None);
        assert_eq!(ctx.get("bumps"), Some(&json!(1)));
        assert_eq!(leaf(&interp), "#m.a");
    }

    #[test]
    fn test_always_fixpoint_chains() {
        let chart = r#"{
            "id": "m",
            "initial": "a",
            "states": {
                "a": { "on": { "GO": "b" } },
                "b": { "always": "c" },
                "c": { "always": { "target": "d", "cond": "ready" } },
                "d": {}
            }
        }"#;
        let (mut interp, mut ctx) = build(chart, Layout::NameKeyed);
        ctx.register_guard("ready", |vars, _| {
            Ok(vars.get("ready").and_then(|v| v.as_bool()).unwrap_or(false))
        })
        .unwrap();
        interp.start(&mut ctx);

        // `ready` is false: the chain stops at c.
        interp.handle_event(&mut ctx, &EventObject::bare("GO"));
        assert_eq!(leaf(&interp), "#m.c");

        // Context change is observed at the next step's fixpoint.
        ctx.set("ready", json!(true));
        interp.handle_event(&mut ctx, &EventObject::bare("NUDGE"));
        // NUDGE itself is unknown, so nothing fires from it; eventless
        // re-evaluation only happens inside a step that fired.
        assert_eq!(leaf(&interp), "#m.c");
    }

    #[test]
    fn test_microstep_overflow_is_fatal() {
        let chart = r#"{
            "id": "m",
            "initial": "ping",
            "states": {
                "ping": { "always": "pong" },
                "pong": { "always": "ping" }
            }
        }"#;
        let desc = parse_chart(chart).unwrap();
        let program = Arc::new(compiler::compile(&desc, Layout::NameKeyed).unwrap());
        let mut interp = Interp::new(
            program,
            Arc::from("test"),
            InterpOptions {
                microstep_cap: 32,
                ..InterpOptions::default()
            },
        );
        let mut ctx = MachineContext::new();
        let report = interp.start(&mut ctx);
        assert_eq!(interp.status(), Status::Error);
        assert!(report.effects.iter().any(|e| matches!(
            e,
            Effect::Notify(Notification::Diagnostic { code, .. }) if code == "microstep_overflow"
        )));
        assert_eq!(
            ctx.get("error_code"),
            Some(&json!("microstep_overflow"))
        );

        // No further events are processed while in error.
        let report = interp.handle_event(&mut ctx, &EventObject::bare("GO"));
        assert!(report.effects.is_empty());
    }

    #[test]
    fn test_step_timeout_parks_instance_in_error() {
        let chart = r#"{
            "id": "m",
            "initial": "a",
            "states": {
                "a": { "on": { "GO": { "target": "b", "actions": "slow" } } },
                "b": {}
            }
        }"#;
        let desc = parse_chart(chart).unwrap();
        let program = Arc::new(compiler::compile(&desc, Layout::NameKeyed).unwrap());
        let mut interp = Interp::new(
            program,
            Arc::from("test"),
            InterpOptions {
                step_timeout_ms: Some(1),
                ..InterpOptions::default()
            },
        );
        let mut ctx = MachineContext::new();
        ctx.register_action("slow", |_, _| {
            std::thread::sleep(std::time::Duration::from_millis(20));
            Ok(())
        })
        .unwrap();
        interp.start(&mut ctx);

        interp.handle_event(&mut ctx, &EventObject::bare("GO"));
        // The wall bound tripped at the fixpoint boundary: configuration
        // restored, instance parked in error.
        assert_eq!(leaf(&interp), "#m.a");
        assert_eq!(interp.status(), Status::Error);
        assert_eq!(ctx.get("error_code"), Some(&json!("step_timeout")));
    }

    #[test]
    fn test_failed_action_restores_configuration() {
        let chart = r#"{
            "id": "m",
            "initial": "a",
            "states": {
                "a": { "on": { "GO": { "target": "b", "actions": "explode" } } },
                "b": { "entry": "neverRuns" }
            }
        }"#;
        let (mut interp, mut ctx) = build(chart, Layout::NameKeyed);
        ctx.register_action("explode", |_, _| anyhow::bail!("boom"))
            .unwrap();
        ctx.register_action("neverRuns", |vars, _| {
            vars.insert("entered_b".into(), json!(true));
            Ok(())
        })
        .unwrap();
        interp.start(&mut ctx);

        let report = interp.handle_event(&mut ctx, &EventObject::bare("GO"));
        // Step aborted: configuration restored, instance alive.
        assert_eq!(leaf(&interp), "#m.a");
        assert_eq!(interp.status(), Status::Active);
        assert!(ctx.get("entered_b").is_none());
        assert_eq!(ctx.get("error_code"), Some(&json!("host_fault")));
        let message = ctx.get("error_message").unwrap().as_str().unwrap();
        assert!(message.contains("boom"));
        assert!(report.effects.iter().any(|e| matches!(
            e,
            Effect::Notify(Notification::Diagnostic { .. })
        )));
    }

    #[test]
    fn test_unregistered_action_aborts_step_but_not_instance() {
        let chart = r#"{
            "id": "m",
            "initial": "a",
            "states": {
                "a": { "on": { "GO": { "target": "b", "actions": "ghost" } } },
                "b": {}
            }
        }"#;
        let (mut interp, mut ctx) = build(chart, Layout::NameKeyed);
        interp.start(&mut ctx);
        interp.handle_event(&mut ctx, &EventObject::bare("GO"));
        assert_eq!(leaf(&interp), "#m.a");
        assert_eq!(interp.status(), Status::Active);
        assert_eq!(ctx.get("error_code"), Some(&json!("unknown_action")));
    }

    #[test]
    fn test_top_level_final_reports_done_with_output() {
        let chart = r#"{
            "id": "m",
            "initial": "work",
            "states": {
                "work": { "on": { "FINISH": "end" } },
                "end": { "type": "final", "output": { "ok": true } }
            }
        }"#;
        let (mut interp, mut ctx) = build(chart, Layout::NameKeyed);
        interp.start(&mut ctx);
        interp.handle_event(&mut ctx, &EventObject::bare("FINISH"));
        assert_eq!(interp.status(), Status::Done);
        let snap = interp.snapshot(&ctx);
        assert_eq!(snap.status, Status::Done);
        assert!(!snap.is_running);
        assert_eq!(snap.output, Some(json!({ "ok": true })));
    }

    #[test]
    fn test_timer_arming_and_stale_generation() {
        let chart = r#"{
            "id": "m",
            "initial": "waiting",
            "states": {
                "waiting": {
                    "after": { "500": "timedOut" },
                    "on": { "ABORT": "idle" }
                },
                "timedOut": {},
                "idle": { "on": { "BACK": "waiting" } }
            }
        }"#;
        let (mut interp, mut ctx) = build(chart, Layout::NameKeyed);
        let report = interp.start(&mut ctx);
        let armed = report
            .effects
            .iter()
            .find_map(|e| match e {
                Effect::ArmTimer {
                    state,
                    index,
                    generation,
                    delay_ms,
                } => Some((*state, *index, *generation, *delay_ms)),
                _ => None,
            })
            .expect("timer armed on entry");
        assert_eq!(armed.3, 500);

        // Leaving the state cancels the timer.
        let report = interp.handle_event(&mut ctx, &EventObject::bare("ABORT"));
        assert!(report
            .effects
            .iter()
            .any(|e| matches!(e, Effect::CancelTimers { .. })));

        // A late fire with the old generation is ignored.
        let report = interp.handle_timer(&mut ctx, armed.0, armed.1, armed.2);
        assert!(report.effects.is_empty());
        assert_eq!(leaf(&interp), "#m.idle");

        // Re-entering arms a fresh generation that does fire.
        let report = interp.handle_event(&mut ctx, &EventObject::bare("BACK"));
        let rearmed = report
            .effects
            .iter()
            .find_map(|e| match e {
                Effect::ArmTimer {
                    state,
                    index,
                    generation,
                    ..
                } => Some((*state, *index, *generation)),
                _ => None,
            })
            .unwrap();
        interp.handle_timer(&mut ctx, rearmed.0, rearmed.1, rearmed.2);
        assert_eq!(leaf(&interp), "#m.timedOut");
    }

    #[test]
    fn test_snapshot_is_pure() {
        let (mut interp, mut ctx) = build(LIGHT, Layout::NameKeyed);
        interp.start(&mut ctx);
        let a = serde_json::to_string(&interp.snapshot(&ctx)).unwrap();
        let b = serde_json::to_string(&interp.snapshot(&ctx)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_stop_twice_is_noop() {
        let (mut interp, mut ctx) = build(LIGHT, Layout::NameKeyed);
        interp.start(&mut ctx);
        let first = interp.stop(&mut ctx);
        assert!(first.effects.iter().any(|e| matches!(
            e,
            Effect::Notify(Notification::Stopped { .. })
        )));
        assert_eq!(interp.status(), Status::Stopped);
        let second = interp.stop(&mut ctx);
        assert!(second.effects.is_empty());
    }

    #[test]
    fn test_raise_action_defers_to_next_step() {
        let chart = r#"{
            "id": "m",
            "initial": "a",
            "states": {
                "a": {
                    "on": {
                        "GO": { "target": "b", "actions": { "type": "raise", "event": "KICK" } }
                    }
                },
                "b": { "on": { "KICK": "c" } },
                "c": {}
            }
        }"#;
        let (mut interp, mut ctx) = build(chart, Layout::NameKeyed);
        interp.start(&mut ctx);
        let report = interp.handle_event(&mut ctx, &EventObject::bare("GO"));
        // The raise is an effect for the mailbox, not an in-step jump.
        assert_eq!(leaf(&interp), "#m.b");
        let raised = report
            .effects
            .iter()
            .find_map(|e| match e {
                Effect::Raise { event } => Some(event.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(raised.name, "KICK");
        interp.handle_event(&mut ctx, &raised);
        assert_eq!(leaf(&interp), "#m.c");
    }
}

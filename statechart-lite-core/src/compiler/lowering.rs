//! Lowering — compiles a verified description tree into an executable
//! `Program` in one of the three layouts.
//!
//! A `Builder` owns the mutable tables while they grow; `finish` is the
//! ownership transfer into the immutable `Program`. All layouts share the
//! state arena (preorder, so arena index is document order); they differ
//! in the dispatch structures built at the end.

use super::desc::{ActionDesc, StateDesc, TransitionDesc};
use super::symbols::Symbols;
use super::verifier::Skeleton;
use crate::error::CompileError;
use crate::types::{
    ActionOp, ActionRef, AfterRec, Dispatch, GuardRef, InvokeRec, Layout, Program, StateIdx,
    StateKind, StateRecord, TransList, Transition, DENSE_ID_CEILING,
};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;

/// Lower a verified chart into the requested layout.
pub fn lower(
    desc: &StateDesc,
    skeleton: &Skeleton<'_>,
    layout: Layout,
) -> Result<Program, CompileError> {
    Builder::new(skeleton, layout).finish(desc)
}

struct Builder<'a, 'd> {
    skeleton: &'a Skeleton<'d>,
    layout: Layout,
    symbols: Option<Symbols>,
    records: Vec<StateRecord>,
    /// Per-state event tables, name-keyed while building.
    on_tables: Vec<HashMap<String, TransList>>,
    spawn_counter: u32,
}

impl<'a, 'd> Builder<'a, 'd> {
    fn new(skeleton: &'a Skeleton<'d>, layout: Layout) -> Self {
        let symbols = match layout {
            Layout::Dense => {
                let mut symbols = Symbols::new();
                // Arena order, so state id == arena index.
                for state in &skeleton.states {
                    symbols.states.intern(&state.path);
                }
                Some(symbols)
            }
            _ => None,
        };
        Self {
            skeleton,
            layout,
            symbols,
            records: Vec::new(),
            on_tables: Vec::new(),
            spawn_counter: 0,
        }
    }

    fn finish(mut self, desc: &StateDesc) -> Result<Program, CompileError> {
        for idx in 0..self.skeleton.states.len() {
            let record = self.build_record(idx as StateIdx)?;
            self.records.push(record);
            let table = self.build_on_table(idx as StateIdx)?;
            self.on_tables.push(table);
        }

        if let Some(symbols) = &self.symbols {
            if let Some((namespace, count)) = symbols.over_dense_ceiling(DENSE_ID_CEILING) {
                return Err(CompileError::IdOverflow {
                    namespace,
                    count,
                    ceiling: DENSE_ID_CEILING,
                });
            }
        }

        let dispatch = self.build_dispatch();
        Ok(Program {
            machine_id: Arc::from(self.skeleton.machine_id.as_str()),
            version: chart_version(desc),
            layout: self.layout,
            root: 0,
            states: self.records.into_boxed_slice(),
            dispatch,
            initial_context: desc.context.clone(),
        })
    }

    fn build_record(&mut self, idx: StateIdx) -> Result<StateRecord, CompileError> {
        let state = self.skeleton.state(idx);
        let desc = state.desc;

        let initial = match (&desc.kind, &desc.initial) {
            (StateKind::Compound, Some(name)) => Some(
                *state
                    .children
                    .iter()
                    .find(|&&c| self.skeleton.state(c).desc.name == *name)
                    .expect("verified: initial names an existing child"),
            ),
            _ => None,
        };

        let entry = self.compile_actions(&desc.entry)?;
        let exit = self.compile_actions(&desc.exit)?;
        let always = self.compile_transitions(idx, &desc.always)?;
        let after = desc
            .after
            .iter()
            .map(|a| {
                Ok(AfterRec {
                    delay_ms: a.delay_ms,
                    transitions: self.compile_transitions(idx, &a.transitions)?,
                })
            })
            .collect::<Result<Vec<_>, CompileError>>()?;
        let invoke = desc
            .invoke
            .as_ref()
            .map(|inv| {
                Ok(InvokeRec {
                    src: Arc::from(inv.src.as_str()),
                    on_done: self.compile_transitions(idx, &inv.on_done)?,
                    on_error: self.compile_transitions(idx, &inv.on_error)?,
                    data: inv.data.clone().map(Arc::new),
                })
            })
            .transpose()?;

        Ok(StateRecord {
            path: Arc::from(state.path.as_str()),
            local: Arc::from(desc.name.as_str()),
            kind: desc.kind,
            parent: state.parent,
            depth: state.depth,
            order: idx,
            children: state.children.clone().into_boxed_slice(),
            initial,
            entry: entry.into_boxed_slice(),
            exit: exit.into_boxed_slice(),
            always,
            after: after.into_boxed_slice(),
            invoke,
            meta: desc.meta.clone().map(Arc::new),
            tags: desc.tags.clone().map(Arc::new),
            description: desc.description.as_deref().map(Arc::from),
            output: desc.output.clone().map(Arc::new),
        })
    }

    fn build_on_table(
        &mut self,
        idx: StateIdx,
    ) -> Result<HashMap<String, TransList>, CompileError> {
        let desc = self.skeleton.state(idx).desc;
        let mut table = HashMap::with_capacity(desc.on.len());
        for on in &desc.on {
            if let Some(symbols) = &mut self.symbols {
                symbols.events.intern(&on.event);
            }
            let compiled = self.compile_transitions(idx, &on.transitions)?;
            table.insert(on.event.clone(), compiled);
        }
        Ok(table)
    }

    fn compile_transitions(
        &mut self,
        source: StateIdx,
        transitions: &[TransitionDesc],
    ) -> Result<TransList, CompileError> {
        let compiled = transitions
            .iter()
            .map(|t| self.compile_transition(source, t))
            .collect::<Result<Vec<_>, CompileError>>()?;
        Ok(compiled.into())
    }

    fn compile_transition(
        &mut self,
        source: StateIdx,
        t: &TransitionDesc,
    ) -> Result<Transition, CompileError> {
        let targets = t
            .targets
            .iter()
            .map(|raw| self.skeleton.resolve(source, raw))
            .collect::<Result<Vec<_>, CompileError>>()?;
        let guard = t.guard.as_deref().map(|name| GuardRef {
            name: Arc::from(name),
            dense: self
                .symbols
                .as_mut()
                .map(|s| s.guards.intern(name) as u8),
        });
        let actions = self.compile_actions(&t.actions)?;
        Ok(Transition {
            source,
            targets: targets.into_boxed_slice(),
            guard,
            actions: actions.into_boxed_slice(),
            internal: t.internal,
        })
    }

    fn compile_actions(&mut self, actions: &[ActionDesc]) -> Result<Vec<ActionOp>, CompileError> {
        actions.iter().map(|a| self.compile_action(a)).collect()
    }

    fn compile_action(&mut self, action: &ActionDesc) -> Result<ActionOp, CompileError> {
        Ok(match action {
            ActionDesc::Named(name) => ActionOp::App(ActionRef {
                name: Arc::from(name.as_str()),
                dense: self
                    .symbols
                    .as_mut()
                    .map(|s| s.actions.intern(name) as u8),
            }),
            ActionDesc::Assign(patch) => ActionOp::Assign(Arc::new(patch.clone())),
            ActionDesc::Send {
                event,
                to,
                delay_ms,
                payload,
            } => ActionOp::Send {
                event: Arc::from(event.as_str()),
                to: Arc::from(to.as_str()),
                delay_ms: *delay_ms,
                payload: payload.clone().map(Arc::new),
            },
            ActionDesc::Raise { event, payload } => ActionOp::Raise {
                event: Arc::from(event.as_str()),
                payload: payload.clone().map(Arc::new),
            },
            ActionDesc::Spawn { src, child_id } => {
                let child_id = match child_id {
                    Some(id) => id.clone(),
                    None => {
                        self.spawn_counter += 1;
                        format!("{src}_{}", self.spawn_counter)
                    }
                };
                ActionOp::Spawn {
                    src: Arc::from(src.as_str()),
                    child_id: Arc::from(child_id.as_str()),
                }
            }
            ActionDesc::Stop { target } => ActionOp::StopPeer {
                target: Arc::from(target.as_str()),
            },
        })
    }

    fn build_dispatch(&mut self) -> Dispatch {
        match self.layout {
            Layout::NameKeyed => Dispatch::NameKeyed {
                by_path: self.skeleton.by_path.clone(),
                on: std::mem::take(&mut self.on_tables).into_boxed_slice(),
            },
            Layout::Frozen => {
                let mut by_path: Vec<(Box<str>, StateIdx)> = self
                    .skeleton
                    .by_path
                    .iter()
                    .map(|(p, &i)| (p.clone().into_boxed_str(), i))
                    .collect();
                by_path.sort_by(|a, b| a.0.cmp(&b.0));

                let on = std::mem::take(&mut self.on_tables)
                    .into_iter()
                    .map(|table| {
                        let mut entries: Vec<(Box<str>, TransList)> = table
                            .into_iter()
                            .map(|(e, t)| (e.into_boxed_str(), t))
                            .collect();
                        entries.sort_by(|a, b| a.0.cmp(&b.0));
                        entries.into_boxed_slice()
                    })
                    .collect();

                Dispatch::Frozen {
                    by_path: by_path.into_boxed_slice(),
                    on,
                }
            }
            Layout::Dense => {
                let symbols = self.symbols.take().expect("dense layout interns symbols");
                let n_events = symbols.events.len();
                let on = std::mem::take(&mut self.on_tables)
                    .into_iter()
                    .map(|table| {
                        let mut row: Vec<Option<TransList>> = vec![None; n_events];
                        for (event, transitions) in table {
                            let eid = symbols
                                .events
                                .get(&event)
                                .expect("event interned while building");
                            row[eid as usize] = Some(transitions);
                        }
                        row.into_boxed_slice()
                    })
                    .collect();
                Dispatch::Dense { symbols, on }
            }
        }
    }
}

/// SHA-256 of the canonical serialized description. Content-addressed
/// version key for the compiled program.
fn chart_version(desc: &StateDesc) -> [u8; 32] {
    let canonical = serde_json::to_vec(&desc.to_json()).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&canonical);
    hasher.finalize().into()
}

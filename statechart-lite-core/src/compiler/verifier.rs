//! Structural verification of a loaded chart, plus the path index and
//! target resolution the lowering pass shares.

use super::desc::{StateDesc, TransitionDesc};
use crate::error::CompileError;
use crate::types::{StateIdx, StateKind};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use std::collections::{HashMap, HashSet};

/// Preorder index over the description tree: absolute paths, parent/child
/// topology, depth and document order. Built once, used by verification,
/// reachability and lowering.
pub struct Skeleton<'a> {
    pub states: Vec<SkelState<'a>>,
    pub by_path: HashMap<String, StateIdx>,
    pub machine_id: String,
}

pub struct SkelState<'a> {
    pub desc: &'a StateDesc,
    pub path: String,
    pub parent: Option<StateIdx>,
    pub children: Vec<StateIdx>,
    pub depth: u16,
}

impl<'a> Skeleton<'a> {
    pub fn build(root: &'a StateDesc) -> Result<Skeleton<'a>, CompileError> {
        let mut skeleton = Skeleton {
            states: Vec::new(),
            by_path: HashMap::new(),
            machine_id: root.name.clone(),
        };
        let root_path = format!("#{}", root.name);
        skeleton.push(root, root_path, None, 0)?;
        Ok(skeleton)
    }

    fn push(
        &mut self,
        desc: &'a StateDesc,
        path: String,
        parent: Option<StateIdx>,
        depth: u16,
    ) -> Result<StateIdx, CompileError> {
        let idx = self.states.len() as StateIdx;
        if self.by_path.insert(path.clone(), idx).is_some() {
            return Err(CompileError::DuplicateState { path });
        }
        self.states.push(SkelState {
            desc,
            path,
            parent,
            children: Vec::new(),
            depth,
        });
        for child in &desc.children {
            let child_path = format!("{}.{}", self.states[idx as usize].path, child.name);
            let child_idx = self.push(child, child_path, Some(idx), depth + 1)?;
            self.states[idx as usize].children.push(child_idx);
        }
        Ok(idx)
    }

    pub fn state(&self, idx: StateIdx) -> &SkelState<'a> {
        &self.states[idx as usize]
    }

    /// Resolve one target reference from `source`.
    ///
    /// Absolute `#…` references look up the path index (a foreign machine
    /// prefix cannot name a state of this chart). Bare names search
    /// upward: the source's siblings first, then each ancestor's children;
    /// as a last resort a globally unique local name matches.
    pub fn resolve(&self, source: StateIdx, raw: &str) -> Result<StateIdx, CompileError> {
        let unresolved = || CompileError::UnresolvedTarget {
            from_path: self.state(source).path.clone(),
            target: raw.to_owned(),
        };

        if raw.starts_with('#') {
            return self.by_path.get(raw).copied().ok_or_else(unresolved);
        }

        // Upward sibling search.
        let mut scope = self.state(source).parent;
        while let Some(anc) = scope {
            if let Some(&found) = self
                .state(anc)
                .children
                .iter()
                .find(|&&c| self.state(c).desc.name == raw)
            {
                return Ok(found);
            }
            scope = self.state(anc).parent;
        }

        // Globally unique local name.
        let mut matches = self
            .states
            .iter()
            .enumerate()
            .filter(|(_, s)| s.desc.name == raw)
            .map(|(i, _)| i as StateIdx);
        match (matches.next(), matches.next()) {
            (Some(only), None) => Ok(only),
            _ => Err(unresolved()),
        }
    }

    /// All transition lists a state defines, with their kind for error
    /// reporting.
    fn outgoing(&self, idx: StateIdx) -> Vec<(&'static str, &'a [TransitionDesc])> {
        let desc = self.state(idx).desc;
        let mut out: Vec<(&'static str, &[TransitionDesc])> = Vec::new();
        for on in &desc.on {
            out.push(("on", &on.transitions));
        }
        for after in &desc.after {
            out.push(("after", &after.transitions));
        }
        if !desc.always.is_empty() {
            out.push(("always", &desc.always));
        }
        if let Some(invoke) = &desc.invoke {
            out.push(("onDone", &invoke.on_done));
            out.push(("onError", &invoke.on_error));
        }
        out
    }
}

/// One verification finding, anchored to a node path.
#[derive(Debug, Clone)]
pub struct VerifyError {
    pub path: String,
    pub detail: String,
}

impl std::fmt::Display for VerifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.path, self.detail)
    }
}

/// Verify structural invariants. Empty list means the chart is valid.
pub fn verify(skeleton: &Skeleton<'_>) -> Vec<VerifyError> {
    let mut errors = Vec::new();

    for (i, state) in skeleton.states.iter().enumerate() {
        let idx = i as StateIdx;
        let desc = state.desc;

        // Sibling names must be unique (programmatic construction can
        // produce duplicates the map-keyed loader cannot).
        let mut seen = HashSet::new();
        for &child in &state.children {
            let name = &skeleton.state(child).desc.name;
            if !seen.insert(name.clone()) {
                errors.push(VerifyError {
                    path: state.path.clone(),
                    detail: format!("duplicate child state `{name}`"),
                });
            }
        }

        match desc.kind {
            StateKind::Compound => {
                if state.children.is_empty() {
                    errors.push(VerifyError {
                        path: state.path.clone(),
                        detail: "compound state has no children".into(),
                    });
                } else {
                    match &desc.initial {
                        None => errors.push(VerifyError {
                            path: state.path.clone(),
                            detail: "compound state requires `initial`".into(),
                        }),
                        Some(initial) if desc.child(initial).is_none() => {
                            errors.push(VerifyError {
                                path: state.path.clone(),
                                detail: format!("`initial` names unknown child `{initial}`"),
                            })
                        }
                        Some(_) => {}
                    }
                }
            }
            StateKind::Parallel => {
                if desc.initial.is_some() {
                    errors.push(VerifyError {
                        path: state.path.clone(),
                        detail: "parallel state may not declare `initial`".into(),
                    });
                }
                if state.children.is_empty() {
                    errors.push(VerifyError {
                        path: state.path.clone(),
                        detail: "parallel state has no regions".into(),
                    });
                }
            }
            StateKind::Final => {
                if !skeleton.outgoing(idx).is_empty() {
                    errors.push(VerifyError {
                        path: state.path.clone(),
                        detail: "final state may not define outgoing transitions".into(),
                    });
                }
                if !state.children.is_empty() {
                    errors.push(VerifyError {
                        path: state.path.clone(),
                        detail: "final state may not have children".into(),
                    });
                }
            }
            StateKind::Atomic => {
                if !state.children.is_empty() {
                    errors.push(VerifyError {
                        path: state.path.clone(),
                        detail: "atomic state may not have children".into(),
                    });
                }
            }
        }

        // Every target must resolve.
        for (kind, transitions) in skeleton.outgoing(idx) {
            for t in transitions {
                for target in &t.targets {
                    if let Err(e) = skeleton.resolve(idx, target) {
                        errors.push(VerifyError {
                            path: state.path.clone(),
                            detail: format!("{kind} target `{target}` does not resolve: {e}"),
                        });
                    }
                }
            }
        }
    }

    errors.extend(unreachable_states(skeleton));
    errors
}

/// Flag states no initial-entry or transition chain can activate.
fn unreachable_states(skeleton: &Skeleton<'_>) -> Vec<VerifyError> {
    let mut graph: DiGraph<StateIdx, ()> = DiGraph::new();
    let nodes: Vec<NodeIndex> = (0..skeleton.states.len())
        .map(|i| graph.add_node(i as StateIdx))
        .collect();

    for (i, state) in skeleton.states.iter().enumerate() {
        let idx = i as StateIdx;
        let desc = state.desc;
        match desc.kind {
            // Entering a compound recurses into its initial child.
            StateKind::Compound => {
                if let Some(initial) = &desc.initial {
                    if let Some(pos) = state
                        .children
                        .iter()
                        .find(|&&c| &skeleton.state(c).desc.name == initial)
                    {
                        graph.add_edge(nodes[i], nodes[*pos as usize], ());
                    }
                }
            }
            // Entering a parallel enters every region.
            StateKind::Parallel => {
                for &child in &state.children {
                    graph.add_edge(nodes[i], nodes[child as usize], ());
                }
            }
            _ => {}
        }
        for (_, transitions) in skeleton.outgoing(idx) {
            for t in transitions {
                for target in &t.targets {
                    if let Ok(resolved) = skeleton.resolve(idx, target) {
                        // A transition activates the target and everything
                        // the target's entry completion activates.
                        graph.add_edge(nodes[i], nodes[resolved as usize], ());
                        // Ancestors of the target become active too.
                        let mut parent = skeleton.state(resolved).parent;
                        while let Some(p) = parent {
                            graph.add_edge(nodes[i], nodes[p as usize], ());
                            parent = skeleton.state(p).parent;
                        }
                    }
                }
            }
        }
    }

    let mut reachable = HashSet::new();
    let mut dfs = Dfs::new(&graph, nodes[0]);
    while let Some(nx) = dfs.next(&graph) {
        reachable.insert(nx);
    }

    skeleton
        .states
        .iter()
        .enumerate()
        .filter(|(i, _)| !reachable.contains(&nodes[*i]))
        .map(|(_, s)| VerifyError {
            path: s.path.clone(),
            detail: "state is unreachable".into(),
        })
        .collect()
}

/// Verify and collapse the findings into a single `CompileError`.
pub fn verify_or_err(skeleton: &Skeleton<'_>) -> Result<(), CompileError> {
    let errors = verify(skeleton);
    if errors.is_empty() {
        Ok(())
    } else {
        let msgs: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        Err(CompileError::Structural {
            path: errors[0].path.clone(),
            detail: msgs.join("; "),
        })
    }
}

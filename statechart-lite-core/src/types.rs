use crate::compiler::symbols::Symbols;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

// ─── Scalar aliases ───────────────────────────────────────────

/// Arena index of a state inside a compiled `Program`.
pub type StateIdx = u16;

/// Epoch milliseconds (UTC).
pub type Timestamp = i64;

/// Largest id the dense layout accepts per namespace.
pub const DENSE_ID_CEILING: usize = 255;

pub fn now_ms() -> Timestamp {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Timestamp)
        .unwrap_or(0)
}

// ─── Events ───────────────────────────────────────────────────

/// An event as seen by the interpreter: a name plus an opaque payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventObject {
    pub name: String,
    #[serde(default)]
    pub payload: Value,
}

impl EventObject {
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }

    /// An event with no payload.
    pub fn bare(name: impl Into<String>) -> Self {
        Self::new(name, Value::Null)
    }
}

// ─── Program layout selection ─────────────────────────────────

/// Executable representation chosen per instance at creation time.
///
/// All three produce identical observable behaviour; they trade lookup
/// machinery for throughput.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Layout {
    /// String-keyed hash maps. Baseline; tolerates late-bound names.
    NameKeyed,
    /// Same content, built once and converted to sorted immutable slices.
    Frozen,
    /// Small-integer ids with direct double-index dispatch. Requires the
    /// referenced name set to be closed at compile time.
    Dense,
}

impl Default for Layout {
    fn default() -> Self {
        Layout::NameKeyed
    }
}

/// Per-instance interpreter knobs.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InterpOptions {
    #[serde(default)]
    pub layout: Layout,
    /// Bound on eventless-transition rounds within one step.
    pub microstep_cap: u32,
    /// Optional wall bound on a single step, in milliseconds.
    pub step_timeout_ms: Option<u64>,
}

impl Default for InterpOptions {
    fn default() -> Self {
        Self {
            layout: Layout::NameKeyed,
            microstep_cap: 1024,
            step_timeout_ms: None,
        }
    }
}

// ─── Compiled chart ───────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateKind {
    Atomic,
    Compound,
    Parallel,
    Final,
}

/// Reference to a host-registered action. The dense id is populated only
/// under the dense layout.
#[derive(Clone, Debug)]
pub struct ActionRef {
    pub name: Arc<str>,
    pub dense: Option<u8>,
}

/// Reference to a host-registered guard predicate.
#[derive(Clone, Debug)]
pub struct GuardRef {
    pub name: Arc<str>,
    pub dense: Option<u8>,
}

/// One compiled action slot: either a call into the host registry or a
/// built-in effectful operation.
#[derive(Clone, Debug)]
pub enum ActionOp {
    /// Host action looked up in the execution context.
    App(ActionRef),
    /// Context patch applied as a single conceptual step.
    Assign(Arc<BTreeMap<String, Value>>),
    /// Event dispatch to a registered peer mailbox, optionally delayed.
    Send {
        event: Arc<str>,
        to: Arc<str>,
        delay_ms: Option<u64>,
        payload: Option<Arc<Value>>,
    },
    /// Event to self, queued ahead of external sends for the next step.
    Raise {
        event: Arc<str>,
        payload: Option<Arc<Value>>,
    },
    /// Request creation of a child mailbox from a registered machine source.
    Spawn { src: Arc<str>, child_id: Arc<str> },
    /// Stop a peer mailbox by id.
    StopPeer { target: Arc<str> },
}

/// A compiled transition. Targets are arena indices; an empty target list
/// marks a targetless (pure-action) transition.
#[derive(Clone, Debug)]
pub struct Transition {
    pub source: StateIdx,
    pub targets: Box<[StateIdx]>,
    pub guard: Option<GuardRef>,
    pub actions: Box<[ActionOp]>,
    pub internal: bool,
}

/// Shared, immutable transition list.
pub type TransList = Arc<[Transition]>;

#[derive(Clone, Debug)]
pub struct AfterRec {
    pub delay_ms: u64,
    pub transitions: TransList,
}

#[derive(Clone, Debug)]
pub struct InvokeRec {
    pub src: Arc<str>,
    pub on_done: TransList,
    pub on_error: TransList,
    pub data: Option<Arc<Value>>,
}

/// One state in the compiled arena. Topology (parent, children, depth,
/// document order) is tabulated here so entry/exit set computation is
/// arena arithmetic rather than tree walking.
#[derive(Clone, Debug)]
pub struct StateRecord {
    /// Absolute path, `#machine.parent.child`.
    pub path: Arc<str>,
    /// Local name within the parent.
    pub local: Arc<str>,
    pub kind: StateKind,
    pub parent: Option<StateIdx>,
    pub depth: u16,
    /// Document order (preorder position).
    pub order: u16,
    pub children: Box<[StateIdx]>,
    pub initial: Option<StateIdx>,
    pub entry: Box<[ActionOp]>,
    pub exit: Box<[ActionOp]>,
    pub always: TransList,
    pub after: Box<[AfterRec]>,
    pub invoke: Option<InvokeRec>,
    pub meta: Option<Arc<Value>>,
    pub tags: Option<Arc<Value>>,
    pub description: Option<Arc<str>>,
    pub output: Option<Arc<Value>>,
}

/// Layout-specific dispatch tables. The arena is shared; what differs is
/// how `state-by-path` and `transitions-by-event` are represented.
#[derive(Clone, Debug)]
pub enum Dispatch {
    NameKeyed {
        by_path: HashMap<String, StateIdx>,
        /// Per-state event → transitions.
        on: Box<[HashMap<String, TransList>]>,
    },
    Frozen {
        /// Sorted by path; binary search.
        by_path: Box<[(Box<str>, StateIdx)]>,
        /// Per-state, sorted by event name; binary search.
        on: Box<[Box<[(Box<str>, TransList)]>]>,
    },
    Dense {
        symbols: Symbols,
        /// `on[state][event_id]` — two direct index reads.
        on: Box<[Box<[Option<TransList>]>]>,
    },
}

/// An immutable, compiled statechart. Created once, shared read-only
/// between every instance that runs it.
#[derive(Clone, Debug)]
pub struct Program {
    pub machine_id: Arc<str>,
    /// SHA-256 of the canonical serialized description.
    pub version: [u8; 32],
    pub layout: Layout,
    pub root: StateIdx,
    pub(crate) states: Box<[StateRecord]>,
    pub(crate) dispatch: Dispatch,
    /// Initial context declared on the chart root.
    pub initial_context: BTreeMap<String, Value>,
}

impl Program {
    pub fn state(&self, idx: StateIdx) -> &StateRecord {
        &self.states[idx as usize]
    }

    pub fn state_count(&self) -> usize {
        self.states.len()
    }

    /// Resolve an absolute path to its arena index, through whichever
    /// lookup structure the layout carries.
    pub fn state_by_path(&self, path: &str) -> Option<StateIdx> {
        match &self.dispatch {
            Dispatch::NameKeyed { by_path, .. } => by_path.get(path).copied(),
            Dispatch::Frozen { by_path, .. } => by_path
                .binary_search_by(|(p, _)| p.as_ref().cmp(path))
                .ok()
                .map(|i| by_path[i].1),
            Dispatch::Dense { symbols, .. } => symbols.states.get(path).map(|id| id as StateIdx),
        }
    }

    /// Transitions `state` defines for `event`, if any.
    pub fn transitions_on(&self, state: StateIdx, event: &str) -> Option<&TransList> {
        match &self.dispatch {
            Dispatch::NameKeyed { on, .. } => on[state as usize].get(event),
            Dispatch::Frozen { on, .. } => {
                let table = &on[state as usize];
                table
                    .binary_search_by(|(e, _)| e.as_ref().cmp(event))
                    .ok()
                    .map(|i| &table[i].1)
            }
            Dispatch::Dense { symbols, on } => {
                let eid = symbols.events.get(event)?;
                on[state as usize][eid as usize].as_ref()
            }
        }
    }

    /// Dense symbol tables, when this program carries them.
    pub fn symbols(&self) -> Option<&Symbols> {
        match &self.dispatch {
            Dispatch::Dense { symbols, .. } => Some(symbols),
            _ => None,
        }
    }

    /// `state` and every ancestor up to the root, innermost first.
    pub fn chain(&self, state: StateIdx) -> Vec<StateIdx> {
        let mut out = Vec::with_capacity(self.state(state).depth as usize + 1);
        let mut cur = Some(state);
        while let Some(idx) = cur {
            out.push(idx);
            cur = self.state(idx).parent;
        }
        out
    }

    /// True if `anc` is a strict ancestor of `state`.
    pub fn is_ancestor(&self, anc: StateIdx, state: StateIdx) -> bool {
        let mut cur = self.state(state).parent;
        while let Some(idx) = cur {
            if idx == anc {
                return true;
            }
            cur = self.state(idx).parent;
        }
        false
    }

    /// Least common ancestor of two states.
    pub fn lca(&self, a: StateIdx, b: StateIdx) -> StateIdx {
        let mut ca = self.chain(a);
        let mut cb = self.chain(b);
        ca.reverse();
        cb.reverse();
        let mut last = self.root;
        for (x, y) in ca.iter().zip(cb.iter()) {
            if x == y {
                last = *x;
            } else {
                break;
            }
        }
        last
    }
}

// ─── Instance status & snapshot ───────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Active,
    Done,
    Error,
    Stopped,
}

impl Status {
    /// True once the instance accepts no further external events.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Status::Active)
    }
}

/// Point-in-time view of an instance: a pure function of configuration
/// plus context.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// Single leaf path, or an array of leaf paths for parallel charts.
    pub current_state: Value,
    pub context: BTreeMap<String, Value>,
    pub is_running: bool,
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Snapshot {
    /// The active leaf paths, one per region.
    pub fn leaves(&self) -> Vec<&str> {
        match &self.current_state {
            Value::String(s) => vec![s.as_str()],
            Value::Array(items) => items.iter().filter_map(|v| v.as_str()).collect(),
            _ => Vec::new(),
        }
    }

    /// The single active leaf, when the chart is not parallel.
    pub fn leaf(&self) -> Option<&str> {
        match &self.current_state {
            Value::String(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

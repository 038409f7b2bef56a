//! Description model — the in-memory form of a statechart definition.
//!
//! Pure data. The loader builds this tree, the verifier checks it, the
//! lowering pass compiles it. Children keep declaration order; that order
//! is semantic (parallel region entry, document-order tiebreaks).

use crate::types::StateKind;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

/// A transition before compilation. Targets are raw reference strings:
/// absolute (`#machine.path.state`), or bare local names resolved by path
/// search during lowering. Relative `.child` forms are rewritten to
/// absolute form by the loader.
#[derive(Clone, Debug, PartialEq)]
pub struct TransitionDesc {
    pub targets: Vec<String>,
    pub guard: Option<String>,
    pub actions: Vec<ActionDesc>,
    pub internal: bool,
}

impl TransitionDesc {
    /// Shorthand for a bare-string transition: `"busy"` ⇒ target only.
    pub fn to_target(target: impl Into<String>) -> Self {
        Self {
            targets: vec![target.into()],
            guard: None,
            actions: Vec::new(),
            internal: false,
        }
    }
}

/// An action reference: a registered name, or a structured built-in.
#[derive(Clone, Debug, PartialEq)]
pub enum ActionDesc {
    Named(String),
    Assign(BTreeMap<String, Value>),
    Send {
        event: String,
        to: String,
        delay_ms: Option<u64>,
        payload: Option<Value>,
    },
    Raise {
        event: String,
        payload: Option<Value>,
    },
    Spawn {
        src: String,
        child_id: Option<String>,
    },
    Stop {
        target: String,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct InvokeDesc {
    pub src: String,
    pub on_done: Vec<TransitionDesc>,
    pub on_error: Vec<TransitionDesc>,
    pub data: Option<Value>,
}

/// Guarded transitions for one event name, in declaration order.
#[derive(Clone, Debug, PartialEq)]
pub struct OnDesc {
    pub event: String,
    pub transitions: Vec<TransitionDesc>,
}

/// Delayed transitions armed on entry.
#[derive(Clone, Debug, PartialEq)]
pub struct AfterDesc {
    pub delay_ms: u64,
    pub transitions: Vec<TransitionDesc>,
}

/// One node of the statechart tree. The root's `name` is the machine id.
#[derive(Clone, Debug, PartialEq)]
pub struct StateDesc {
    pub name: String,
    pub kind: StateKind,
    pub initial: Option<String>,
    /// Initial extended state; meaningful on the root.
    pub context: BTreeMap<String, Value>,
    pub entry: Vec<ActionDesc>,
    pub exit: Vec<ActionDesc>,
    pub on: Vec<OnDesc>,
    pub after: Vec<AfterDesc>,
    pub always: Vec<TransitionDesc>,
    pub invoke: Option<InvokeDesc>,
    pub children: Vec<StateDesc>,
    pub meta: Option<Value>,
    pub tags: Option<Value>,
    pub description: Option<String>,
    pub output: Option<Value>,
}

impl StateDesc {
    pub fn leaf(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: StateKind::Atomic,
            initial: None,
            context: BTreeMap::new(),
            entry: Vec::new(),
            exit: Vec::new(),
            on: Vec::new(),
            after: Vec::new(),
            always: Vec::new(),
            invoke: None,
            children: Vec::new(),
            meta: None,
            tags: None,
            description: None,
            output: None,
        }
    }

    pub fn child(&self, name: &str) -> Option<&StateDesc> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn transitions_for(&self, event: &str) -> Option<&[TransitionDesc]> {
        self.on
            .iter()
            .find(|o| o.event == event)
            .map(|o| o.transitions.as_slice())
    }

    /// Canonical re-serialization into the object form the loader accepts.
    /// `load(serialize(load(x)))` equals `load(x)`.
    pub fn to_json(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("id".into(), Value::String(self.name.clone()));
        if !self.context.is_empty() {
            obj.insert(
                "context".into(),
                Value::Object(self.context.clone().into_iter().collect()),
            );
        }
        self.node_json(&mut obj);
        Value::Object(obj)
    }

    fn node_json(&self, obj: &mut Map<String, Value>) {
        obj.insert("type".into(), json!(self.kind));
        if let Some(initial) = &self.initial {
            obj.insert("initial".into(), Value::String(initial.clone()));
        }
        if !self.entry.is_empty() {
            obj.insert("entry".into(), actions_json(&self.entry));
        }
        if !self.exit.is_empty() {
            obj.insert("exit".into(), actions_json(&self.exit));
        }
        if !self.on.is_empty() {
            let mut on = Map::new();
            for o in &self.on {
                on.insert(o.event.clone(), transitions_json(&o.transitions));
            }
            obj.insert("on".into(), Value::Object(on));
        }
        if !self.after.is_empty() {
            let mut after = Map::new();
            for a in &self.after {
                after.insert(a.delay_ms.to_string(), transitions_json(&a.transitions));
            }
            obj.insert("after".into(), Value::Object(after));
        }
        if !self.always.is_empty() {
            obj.insert("always".into(), transitions_json(&self.always));
        }
        if let Some(invoke) = &self.invoke {
            let mut inv = Map::new();
            inv.insert("src".into(), Value::String(invoke.src.clone()));
            if !invoke.on_done.is_empty() {
                inv.insert("onDone".into(), transitions_json(&invoke.on_done));
            }
            if !invoke.on_error.is_empty() {
                inv.insert("onError".into(), transitions_json(&invoke.on_error));
            }
            if let Some(data) = &invoke.data {
                inv.insert("data".into(), data.clone());
            }
            obj.insert("invoke".into(), Value::Object(inv));
        }
        if !self.children.is_empty() {
            let mut states = Map::new();
            for child in &self.children {
                let mut child_obj = Map::new();
                child.node_json(&mut child_obj);
                states.insert(child.name.clone(), Value::Object(child_obj));
            }
            obj.insert("states".into(), Value::Object(states));
        }
        if let Some(meta) = &self.meta {
            obj.insert("meta".into(), meta.clone());
        }
        if let Some(tags) = &self.tags {
            obj.insert("tags".into(), tags.clone());
        }
        if let Some(description) = &self.description {
            obj.insert("description".into(), Value::String(description.clone()));
        }
        if let Some(output) = &self.output {
            obj.insert("output".into(), output.clone());
        }
    }
}

fn transitions_json(transitions: &[TransitionDesc]) -> Value {
    let mut items: Vec<Value> = transitions.iter().map(transition_json).collect();
    if items.len() == 1 {
        items.remove(0)
    } else {
        Value::Array(items)
    }
}

fn transition_json(t: &TransitionDesc) -> Value {
    let mut obj = Map::new();
    match t.targets.len() {
        0 => {}
        1 => {
            obj.insert("target".into(), Value::String(t.targets[0].clone()));
        }
        _ => {
            obj.insert(
                "target".into(),
                Value::Array(t.targets.iter().cloned().map(Value::String).collect()),
            );
        }
    }
    if let Some(guard) = &t.guard {
        obj.insert("guard".into(), Value::String(guard.clone()));
    }
    if !t.actions.is_empty() {
        obj.insert("actions".into(), actions_json(&t.actions));
    }
    if t.internal {
        obj.insert("internal".into(), Value::Bool(true));
    }
    Value::Object(obj)
}

fn actions_json(actions: &[ActionDesc]) -> Value {
    Value::Array(actions.iter().map(action_json).collect())
}

fn action_json(a: &ActionDesc) -> Value {
    match a {
        ActionDesc::Named(name) => Value::String(name.clone()),
        ActionDesc::Assign(patch) => {
            json!({ "type": "assign", "values": Value::Object(patch.clone().into_iter().collect()) })
        }
        ActionDesc::Send {
            event,
            to,
            delay_ms,
            payload,
        } => {
            let mut obj = Map::new();
            obj.insert("type".into(), json!("send"));
            obj.insert("event".into(), Value::String(event.clone()));
            obj.insert("to".into(), Value::String(to.clone()));
            if let Some(delay) = delay_ms {
                obj.insert("delay".into(), json!(delay));
            }
            if let Some(payload) = payload {
                obj.insert("payload".into(), payload.clone());
            }
            Value::Object(obj)
        }
        ActionDesc::Raise { event, payload } => {
            let mut obj = Map::new();
            obj.insert("type".into(), json!("raise"));
            obj.insert("event".into(), Value::String(event.clone()));
            if let Some(payload) = payload {
                obj.insert("payload".into(), payload.clone());
            }
            Value::Object(obj)
        }
        ActionDesc::Spawn { src, child_id } => {
            let mut obj = Map::new();
            obj.insert("type".into(), json!("spawn"));
            obj.insert("src".into(), Value::String(src.clone()));
            if let Some(id) = child_id {
                obj.insert("id".into(), Value::String(id.clone()));
            }
            Value::Object(obj)
        }
        ActionDesc::Stop { target } => {
            json!({ "type": "stop", "id": target })
        }
    }
}

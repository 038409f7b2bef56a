//! Bidirectional string interning for the dense program layout.
//!
//! Four independent namespaces (states, events, actions, guards) each get
//! their own insert-ordered table. Ids are assigned in first-seen order, so
//! the state namespace's ids coincide with arena indices.

use std::collections::HashMap;
use std::sync::Arc;

/// Insert-ordered bidirectional map `name ↔ u16`.
#[derive(Clone, Debug, Default)]
pub struct Interner {
    names: Vec<Arc<str>>,
    index: HashMap<Arc<str>, u16>,
}

impl Interner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern a name, returning its id. Idempotent.
    pub fn intern(&mut self, name: &str) -> u16 {
        if let Some(&id) = self.index.get(name) {
            return id;
        }
        let id = self.names.len() as u16;
        let shared: Arc<str> = Arc::from(name);
        self.names.push(shared.clone());
        self.index.insert(shared, id);
        id
    }

    /// Look up an already-interned name.
    pub fn get(&self, name: &str) -> Option<u16> {
        self.index.get(name).copied()
    }

    /// Reverse lookup.
    pub fn name(&self, id: u16) -> Option<&Arc<str>> {
        self.names.get(id as usize)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u16, &Arc<str>)> {
        self.names.iter().enumerate().map(|(i, n)| (i as u16, n))
    }
}

/// The four namespaces a compiled chart references.
#[derive(Clone, Debug, Default)]
pub struct Symbols {
    pub states: Interner,
    pub events: Interner,
    pub actions: Interner,
    pub guards: Interner,
}

impl Symbols {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the first namespace whose id space outgrew the dense ceiling,
    /// with its current cardinality. `None` means all four fit.
    pub fn over_dense_ceiling(&self, ceiling: usize) -> Option<(&'static str, usize)> {
        for (label, interner) in [
            ("states", &self.states),
            ("events", &self.events),
            ("actions", &self.actions),
            ("guards", &self.guards),
        ] {
            if interner.len() > ceiling {
                return Some((label, interner.len()));
            }
        }
        None
    }
}

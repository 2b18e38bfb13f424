use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::warn;

use super::{AgentDefinition, DefinitionDraft};
use crate::config::AgentDefaults;

/// In-memory catalog of agent definitions keyed by id.
///
/// Rebuilt wholesale by refresh(); lookups hand out shared pointers so a
/// running session keeps its definition even across a rebuild.
#[derive(Default)]
pub struct AgentRegistry {
    agents: RwLock<HashMap<String, Arc<AgentDefinition>>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<Arc<AgentDefinition>> {
        self.agents.read().get(id).cloned()
    }

    pub fn has(&self, id: &str) -> bool {
        self.agents.read().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.agents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.read().is_empty()
    }

    /// Sorted id list.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.agents.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn all(&self) -> Vec<Arc<AgentDefinition>> {
        let mut defs: Vec<Arc<AgentDefinition>> = self.agents.read().values().cloned().collect();
        defs.sort_by(|a, b| a.id.cmp(&b.id));
        defs
    }

    /// Replace the catalog with the given drafts. Duplicate ids and
    /// malformed drafts are skipped with a warning through `on_warn`;
    /// the first occurrence of an id wins. Returns the sorted id list.
    pub fn rebuild<F>(
        &self,
        entries: Vec<(String, DefinitionDraft)>,
        defaults: &AgentDefaults,
        mut on_warn: F,
    ) -> Vec<String>
    where
        F: FnMut(&str, &str),
    {
        let mut next: HashMap<String, Arc<AgentDefinition>> = HashMap::new();

        for (origin, draft) in entries {
            match draft.finish(defaults) {
                Ok(def) => {
                    if next.contains_key(&def.id) {
                        let msg = format!("duplicate agent id '{}'", def.id);
                        warn!(origin = %origin, %msg, "Skipping agent definition");
                        on_warn(&origin, &msg);
                        continue;
                    }
                    next.insert(def.id.clone(), Arc::new(def));
                }
                Err(reason) => {
                    warn!(origin = %origin, reason = %reason, "Skipping agent definition");
                    on_warn(&origin, &reason);
                }
            }
        }

        *self.agents.write() = next;
        self.ids()
    }
}

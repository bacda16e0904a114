use crate::state::DefinitionState;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

/// Persistence for definition states, keyed by a caller-chosen id
/// (usually the definition execution id).
///
/// States are stored as JSON so any backend that can hold a string can
/// implement this trait.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn save_state(&self, key: &str, state: &DefinitionState) -> Result<()>;
    async fn load_state(&self, key: &str) -> Result<Option<DefinitionState>>;
    /// Returns whether a state was removed.
    async fn delete_state(&self, key: &str) -> Result<bool>;
    async fn list_states(&self) -> Result<Vec<String>>;
}

/// In-memory store for tests and single-process hosts.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    states: RwLock<BTreeMap<String, String>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn save_state(&self, key: &str, state: &DefinitionState) -> Result<()> {
        let json = serde_json::to_string(state)?;
        self.states.write().await.insert(key.to_string(), json);
        Ok(())
    }

    async fn load_state(&self, key: &str) -> Result<Option<DefinitionState>> {
        let states = self.states.read().await;
        match states.get(key) {
            Some(json) => Ok(Some(serde_json::from_str(json)?)),
            None => Ok(None),
        }
    }

    async fn delete_state(&self, key: &str) -> Result<bool> {
        Ok(self.states.write().await.remove(key).is_some())
    }

    async fn list_states(&self) -> Result<Vec<String>> {
        Ok(self.states.read().await.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::Definition;
    use crate::state::RunStatus;
    use serde_json::json;
    use std::sync::Arc;

    const YAML: &str = r#"
id: def1
processes:
  - id: process1
    elements:
      - { kind: UserTask, id: task }
"#;

    #[tokio::test]
    async fn stopped_definition_round_trips_through_store() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let key = {
            let definition = Definition::from_yaml(YAML).unwrap();
            definition.run().unwrap();
            definition.stop();
            let key = definition.execution_id().unwrap();
            store.save_state(&key, &definition.get_state()).await.unwrap();
            key
        };
        assert_eq!(store.list_states().await.unwrap(), vec![key.clone()]);

        let state = store.load_state(&key).await.unwrap().unwrap();
        let definition = Definition::from_yaml(YAML).unwrap();
        definition.recover(&state).unwrap();
        assert_eq!(definition.status(), Some(RunStatus::Executing));
        definition.resume().unwrap();
        definition.signal(json!({"id": "task"})).unwrap();
        assert_eq!(definition.counters().completed, 1);

        assert!(store.delete_state(&key).await.unwrap());
        assert!(!store.delete_state(&key).await.unwrap());
        assert!(store.load_state(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn corrupt_state_is_an_error() {
        let store = MemoryStateStore::new();
        store
            .states
            .write()
            .await
            .insert("broken".to_string(), "{".to_string());
        assert!(store.load_state("broken").await.is_err());
    }
}

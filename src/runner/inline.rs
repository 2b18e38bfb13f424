//! In-process runner.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use super::Runner;
use crate::error::{MillError, Result};
use crate::session::Session;

/// Invokes the worker body within the orchestrator's execution context.
#[derive(Debug, Default)]
pub struct InlineRunner;

impl InlineRunner {
    pub const NAME: &'static str = "inline";

    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Runner for InlineRunner {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn exec(&self, session: &Session) -> Result<Option<Value>> {
        let outcome = session
            .agent
            .worker
            .run(session.settings.clone(), session.context.clone())
            .await;

        match outcome {
            Ok(value) => {
                if !session.agent.has_return {
                    return Ok(None);
                }
                let expires_at = session
                    .agent
                    .expires_duration()?
                    .and_then(|d| chrono::Duration::from_std(d).ok())
                    .map(|d| Utc::now() + d);
                session
                    .backend
                    .set(&session.cache_key, value.clone(), expires_at)
                    .await?;
                Ok(Some(value))
            }
            Err(cause) => Err(MillError::Runner(cause)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::agent::{AgentDefinition, AgentRegistry, DefinitionDraft, worker_fn};
    use crate::cache::{MemoryCache, SharedCache};
    use crate::config::AgentDefaults;
    use crate::events::EventEmitter;
    use crate::session::{SessionFactory, SessionOverrides};

    fn factory_with(def: AgentDefinition) -> (SessionFactory, SharedCache) {
        let registry = Arc::new(AgentRegistry::new());
        registry.rebuild(
            vec![("test".into(), DefinitionDraft::from_definition(&def))],
            &AgentDefaults::default(),
            |_, _| {},
        );

        let memory: SharedCache = Arc::new(MemoryCache::default());
        let mut caches = HashMap::new();
        caches.insert("memory".to_string(), memory.clone());

        let factory = SessionFactory::new(
            registry,
            vec!["inline".into()],
            caches,
            vec!["memory".into()],
            Arc::new(|k| k),
            SessionFactory::default_runner_selector(),
            SessionFactory::default_cache_selector(),
            EventEmitter::new(),
            250,
        );
        (factory, memory)
    }

    #[tokio::test]
    async fn test_success_writes_cache() {
        let def = AgentDefinition::new("double", worker_fn(|s, _| async move {
            Ok(json!(s["n"].as_i64().unwrap_or(0) * 2))
        }));
        let (factory, memory) = factory_with(def);
        let session = factory
            .create_session("double", Some(json!({"n": 21})), &SessionOverrides::default())
            .unwrap();

        let value = InlineRunner::new().exec(&session).await.unwrap();
        assert_eq!(value, Some(json!(42)));
        assert_eq!(
            memory.get(&session.cache_key).await.unwrap(),
            Some(json!(42))
        );
    }

    #[tokio::test]
    async fn test_no_return_skips_cache_write() {
        let def =
            AgentDefinition::new("fire", worker_fn(|_, _| async { Ok(json!("done")) })).without_return();
        let (factory, memory) = factory_with(def);
        let session = factory
            .create_session("fire", None, &SessionOverrides::default())
            .unwrap();

        let value = InlineRunner::new().exec(&session).await.unwrap();
        assert_eq!(value, None);
        assert_eq!(memory.get(&session.cache_key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_failure_skips_cache_write() {
        let def = AgentDefinition::new("boom", worker_fn(|_, _| async {
            Err("worker exploded".to_string())
        }));
        let (factory, memory) = factory_with(def);
        let session = factory
            .create_session("boom", None, &SessionOverrides::default())
            .unwrap();

        let err = InlineRunner::new().exec(&session).await.unwrap_err();
        assert_eq!(err.to_string(), "worker exploded");
        assert_eq!(memory.get(&session.cache_key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_expires_sets_ttl() {
        let def = AgentDefinition::new("ttl", worker_fn(|_, _| async { Ok(json!(1)) }))
            .with_expires("1h");
        let (factory, memory) = factory_with(def);
        let session = factory
            .create_session("ttl", None, &SessionOverrides::default())
            .unwrap();

        InlineRunner::new().exec(&session).await.unwrap();

        let metas = memory.list().await.unwrap();
        let meta = metas.iter().find(|m| m.id == session.cache_key).unwrap();
        assert!(meta.expires_at.is_some());
    }
}

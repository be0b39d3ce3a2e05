//! Persistence of per-session authentication material.

use std::{collections::HashMap, fmt};

use {
    async_trait::async_trait,
    serde::{Deserialize, Serialize},
    tokio::sync::RwLock,
};

/// Opaque auth snapshot produced by the socket adapter.
///
/// Each update replaces the previous snapshot wholesale, so writes are
/// idempotent and last-write-wins is safe.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Credentials(serde_json::Value);

impl Credentials {
    pub fn new(material: serde_json::Value) -> Self {
        Self(material)
    }

    pub fn as_value(&self) -> &serde_json::Value {
        &self.0
    }

    pub fn into_value(self) -> serde_json::Value {
        self.0
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credentials([REDACTED])")
    }
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn load(&self, session_id: &str) -> anyhow::Result<Option<Credentials>>;
    async fn save(&self, session_id: &str, credentials: &Credentials) -> anyhow::Result<()>;
    /// Remove everything stored for the session. Missing entries are not an error.
    async fn delete(&self, session_id: &str) -> anyhow::Result<()>;
    async fn list(&self) -> anyhow::Result<Vec<String>>;
}

/// Process-local store; contents are lost on restart.
#[derive(Default)]
pub struct MemoryCredentialStore {
    entries: RwLock<HashMap<String, Credentials>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn load(&self, session_id: &str) -> anyhow::Result<Option<Credentials>> {
        Ok(self.entries.read().await.get(session_id).cloned())
    }

    async fn save(&self, session_id: &str, credentials: &Credentials) -> anyhow::Result<()> {
        self.entries
            .write()
            .await
            .insert(session_id.to_string(), credentials.clone());
        Ok(())
    }

    async fn delete(&self, session_id: &str) -> anyhow::Result<()> {
        self.entries.write().await.remove(session_id);
        Ok(())
    }

    async fn list(&self) -> anyhow::Result<Vec<String>> {
        let mut ids: Vec<_> = self.entries.read().await.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_last_write_wins() {
        let store = MemoryCredentialStore::new();
        store
            .save("s1", &Credentials::new(serde_json::json!({"v": 1})))
            .await
            .unwrap();
        store
            .save("s1", &Credentials::new(serde_json::json!({"v": 2})))
            .await
            .unwrap();

        let loaded = store.load("s1").await.unwrap().unwrap();
        assert_eq!(loaded.as_value()["v"], 2);
        assert_eq!(store.list().await.unwrap(), vec!["s1".to_string()]);

        store.delete("s1").await.unwrap();
        store.delete("s1").await.unwrap();
        assert!(store.load("s1").await.unwrap().is_none());
    }

    #[test]
    fn debug_output_is_redacted() {
        let creds = Credentials::new(serde_json::json!({"noiseKey": "secret"}));
        assert!(!format!("{creds:?}").contains("secret"));
    }
}

//! In-process store for tests and ephemeral CLI sessions.

use std::collections::HashMap;

use casebrief_shared::Result;
use tokio::sync::Mutex;

use crate::{KeyValueStore, KvWrite};

/// A [`KeyValueStore`] backed by a `HashMap`. Contents vanish on drop.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries
            .lock()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn update<T, F>(&self, key: &str, f: F) -> Result<T>
    where
        T: Send,
        F: FnOnce(Option<String>) -> Result<(KvWrite, T)> + Send,
    {
        let mut entries = self.entries.lock().await;
        let (write, out) = f(entries.get(key).cloned())?;
        match write {
            KvWrite::Keep => {}
            KvWrite::Set(value) => {
                entries.insert(key.to_string(), value);
            }
            KvWrite::Delete => {
                entries.remove(key);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_set_delete() {
        let store = MemoryStore::new();
        assert!(store.get("cases").await.unwrap().is_none());

        store.set("cases", "[]").await.unwrap();
        assert_eq!(store.get("cases").await.unwrap().as_deref(), Some("[]"));

        store.set("cases", "[1]").await.unwrap();
        assert_eq!(store.get("cases").await.unwrap().as_deref(), Some("[1]"));

        store.delete("cases").await.unwrap();
        assert!(store.get("cases").await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_updates_are_not_lost() {
        let store = std::sync::Arc::new(MemoryStore::new());
        let handles: Vec<_> = (0..50)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .update("counter", |current| {
                            let n = current.and_then(|raw| raw.parse::<u32>().ok()).unwrap_or(0) + 1;
                            Ok((KvWrite::Set(n.to_string()), ()))
                        })
                        .await
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(store.get("counter").await.unwrap().as_deref(), Some("50"));
    }
}

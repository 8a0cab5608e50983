//! Durable case aggregates over a whole-value key-value store.
//!
//! The full case collection lives as one JSON array under a single key. Every
//! mutation is read-collection, change one aggregate, write-collection, run
//! through [`KeyValueStore::update`] so that the store applies it atomically.
//! Stages finishing together, in one session or in separate sessions and
//! processes sharing the store, never overwrite each other's append.

use std::sync::Arc;

use casebrief_shared::{AnalysisStageRecord, CaseAggregate, CaseBriefError, CaseId, Result};
use casebrief_storage::{KeyValueStore, KvWrite};
use tracing::{debug, info, instrument};

/// Default storage key of the case collection.
pub const DEFAULT_COLLECTION_KEY: &str = "cases";

/// How an append locates its target case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaseKey {
    /// A stable identifier, with the name to use if the case must be created
    /// or the id is unknown.
    Id { id: CaseId, name: String },
    /// Legacy lookup by exact case name.
    Name(String),
}

impl CaseKey {
    pub fn name(&self) -> &str {
        match self {
            Self::Id { name, .. } | Self::Name(name) => name,
        }
    }
}

/// Find-or-create-by-name store of [`CaseAggregate`]s.
pub struct CaseRepository<S> {
    store: Arc<S>,
    collection_key: String,
}

impl<S: KeyValueStore> CaseRepository<S> {
    /// Repository over `store` using the default collection key.
    pub fn new(store: Arc<S>) -> Self {
        Self::with_collection_key(store, DEFAULT_COLLECTION_KEY)
    }

    pub fn with_collection_key(store: Arc<S>, collection_key: impl Into<String>) -> Self {
        Self {
            store,
            collection_key: collection_key.into(),
        }
    }

    /// All persisted cases, in creation order.
    pub async fn list_cases(&self) -> Result<Vec<CaseAggregate>> {
        let raw = self.store.get(&self.collection_key).await?;
        parse_collection(&self.collection_key, raw)
    }

    pub async fn get_case(&self, id: CaseId) -> Result<Option<CaseAggregate>> {
        Ok(self.list_cases().await?.into_iter().find(|c| c.id == id))
    }

    /// First case whose name matches exactly.
    pub async fn find_by_name(&self, name: &str) -> Result<Option<CaseAggregate>> {
        Ok(self.list_cases().await?.into_iter().find(|c| c.name == name))
    }

    /// Return the case named `name`, persisting an empty one if none exists.
    pub async fn find_or_create_by_name(&self, name: &str) -> Result<CaseAggregate> {
        validate_name(name)?;

        self.mutate(|cases| {
            if let Some(existing) = cases.iter().find(|c| c.name == name) {
                return Ok((false, existing.clone()));
            }

            let created = CaseAggregate::new(CaseId::new(), name);
            cases.push(created.clone());
            info!(case_id = %created.id, name, "created case");
            Ok((true, created))
        })
        .await
    }

    /// Append `record` to the case identified by `key`, creating the case if needed.
    ///
    /// Resolution: an id key appends to the case with that id; an unknown id
    /// falls back to the name, and a new case keeps the supplied id. Returns
    /// the id of the case the record landed in.
    #[instrument(skip_all, fields(case = %key.name(), stage = record.stage_index))]
    pub async fn append_stage(&self, key: &CaseKey, record: AnalysisStageRecord) -> Result<CaseId> {
        validate_name(key.name())?;

        self.mutate(|cases| {
            let by_id = match key {
                CaseKey::Id { id, .. } => cases.iter().position(|c| c.id == *id),
                CaseKey::Name(_) => None,
            };
            let position = by_id.or_else(|| cases.iter().position(|c| c.name == key.name()));

            let case_id = match position {
                Some(pos) => {
                    let case = &mut cases[pos];
                    case.stages.push(record);
                    debug!(case_id = %case.id, stages = case.stages.len(), "appended stage record");
                    case.id
                }
                None => {
                    let id = match key {
                        CaseKey::Id { id, .. } => *id,
                        CaseKey::Name(_) => CaseId::new(),
                    };
                    let mut created = CaseAggregate::new(id, key.name());
                    created.stages.push(record);
                    cases.push(created);
                    info!(case_id = %id, "created case on first completed stage");
                    id
                }
            };
            Ok((true, case_id))
        })
        .await
    }

    /// Remove a case. Returns whether it existed.
    pub async fn delete_case(&self, id: CaseId) -> Result<bool> {
        let removed = self
            .mutate(|cases| {
                let before = cases.len();
                cases.retain(|c| c.id != id);
                let removed = cases.len() != before;
                Ok((removed, removed))
            })
            .await?;

        if removed {
            info!(case_id = %id, "deleted case");
        }
        Ok(removed)
    }

    /// Atomically apply `f` to the collection.
    ///
    /// `f` returns whether it changed the collection plus its result. An empty
    /// collection removes the key. Any error leaves the stored value untouched.
    async fn mutate<T, F>(&self, f: F) -> Result<T>
    where
        T: Send,
        F: FnOnce(&mut Vec<CaseAggregate>) -> Result<(bool, T)> + Send,
    {
        let key = &self.collection_key;
        self.store
            .update(key, |raw| {
                let mut cases = parse_collection(key, raw)?;
                let (changed, out) = f(&mut cases)?;
                let write = match (changed, cases.is_empty()) {
                    (false, _) => KvWrite::Keep,
                    (true, true) => KvWrite::Delete,
                    (true, false) => KvWrite::Set(serde_json::to_string(&cases)?),
                };
                Ok((write, out))
            })
            .await
    }
}

fn parse_collection(key: &str, raw: Option<String>) -> Result<Vec<CaseAggregate>> {
    match raw {
        Some(raw) => serde_json::from_str(&raw).map_err(|e| {
            CaseBriefError::Storage(format!("case collection '{key}' is malformed: {e}"))
        }),
        None => Ok(Vec::new()),
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(CaseBriefError::validation("case name must not be blank"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use casebrief_shared::StageDescriptor;
    use casebrief_storage::{LibsqlStore, MemoryStore};
    use proptest::prelude::*;
    use std::time::Duration;

    fn record(index: usize, output: &str) -> AnalysisStageRecord {
        let stage = StageDescriptor {
            index,
            title: format!("Stage {index}"),
        };
        AnalysisStageRecord::new(&stage, "input", output)
    }

    fn repo() -> CaseRepository<MemoryStore> {
        CaseRepository::new(Arc::new(MemoryStore::new()))
    }

    /// Store that yields between every call to widen race windows; `get`
    /// returns a value that is already stale by the time the caller sees it.
    #[derive(Default)]
    struct SlowStore {
        inner: MemoryStore,
    }

    impl KeyValueStore for SlowStore {
        async fn get(&self, key: &str) -> Result<Option<String>> {
            let value = self.inner.get(key).await;
            tokio::time::sleep(Duration::from_millis(2)).await;
            value
        }

        async fn set(&self, key: &str, value: &str) -> Result<()> {
            tokio::time::sleep(Duration::from_millis(2)).await;
            self.inner.set(key, value).await
        }

        async fn delete(&self, key: &str) -> Result<()> {
            self.inner.delete(key).await
        }

        async fn update<T, F>(&self, key: &str, f: F) -> Result<T>
        where
            T: Send,
            F: FnOnce(Option<String>) -> Result<(KvWrite, T)> + Send,
        {
            tokio::time::sleep(Duration::from_millis(2)).await;
            self.inner.update(key, f).await
        }
    }

    /// Store whose writes always fail.
    #[derive(Default)]
    struct ReadOnlyStore {
        inner: MemoryStore,
    }

    impl KeyValueStore for ReadOnlyStore {
        async fn get(&self, key: &str) -> Result<Option<String>> {
            self.inner.get(key).await
        }

        async fn set(&self, _key: &str, _value: &str) -> Result<()> {
            Err(CaseBriefError::Storage("disk full".into()))
        }

        async fn delete(&self, _key: &str) -> Result<()> {
            Err(CaseBriefError::Storage("disk full".into()))
        }

        async fn update<T, F>(&self, key: &str, f: F) -> Result<T>
        where
            T: Send,
            F: FnOnce(Option<String>) -> Result<(KvWrite, T)> + Send,
        {
            let (write, out) = f(self.inner.get(key).await?)?;
            match write {
                KvWrite::Keep => Ok(out),
                _ => Err(CaseBriefError::Storage("disk full".into())),
            }
        }
    }

    #[tokio::test]
    async fn first_append_creates_case() {
        let repo = repo();
        let id = repo
            .append_stage(&CaseKey::Name("Case-A".into()), record(0, "r0"))
            .await
            .unwrap();

        let cases = repo.list_cases().await.unwrap();
        assert_eq!(cases.len(), 1);
        assert_eq!(cases[0].id, id);
        assert_eq!(cases[0].name, "Case-A");
        assert_eq!(cases[0].stages.len(), 1);
    }

    #[tokio::test]
    async fn appends_merge_by_name_in_completion_order() {
        let repo = repo();
        let key = CaseKey::Name("Case-A".into());
        repo.append_stage(&key, record(3, "r3")).await.unwrap();
        repo.append_stage(&key, record(1, "r1")).await.unwrap();
        repo.append_stage(&key, record(3, "r3 again")).await.unwrap();

        let case = repo.find_by_name("Case-A").await.unwrap().unwrap();
        let order: Vec<usize> = case.stages.iter().map(|r| r.stage_index).collect();
        assert_eq!(order, vec![3, 1, 3]);
    }

    #[tokio::test]
    async fn name_match_is_exact() {
        let repo = repo();
        repo.append_stage(&CaseKey::Name("Case-A".into()), record(0, "a"))
            .await
            .unwrap();
        repo.append_stage(&CaseKey::Name("case-a".into()), record(0, "b"))
            .await
            .unwrap();
        assert_eq!(repo.list_cases().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn id_key_prefers_id_over_name() {
        let repo = repo();
        let first = repo
            .append_stage(&CaseKey::Name("Shared name".into()), record(0, "a"))
            .await
            .unwrap();

        // A distinct case that happens to share the name
        let other = CaseId::new();
        let key = CaseKey::Id {
            id: other,
            name: "Other".into(),
        };
        assert_eq!(repo.append_stage(&key, record(0, "b")).await.unwrap(), other);

        let key = CaseKey::Id {
            id: other,
            name: "Shared name".into(),
        };
        assert_eq!(repo.append_stage(&key, record(1, "c")).await.unwrap(), other);

        let first_case = repo.get_case(first).await.unwrap().unwrap();
        assert_eq!(first_case.stages.len(), 1);
        let other_case = repo.get_case(other).await.unwrap().unwrap();
        assert_eq!(other_case.stages.len(), 2);
    }

    #[tokio::test]
    async fn unknown_id_falls_back_to_name() {
        let repo = repo();
        let existing = repo
            .append_stage(&CaseKey::Name("Case-A".into()), record(0, "a"))
            .await
            .unwrap();

        let key = CaseKey::Id {
            id: CaseId::new(),
            name: "Case-A".into(),
        };
        assert_eq!(repo.append_stage(&key, record(1, "b")).await.unwrap(), existing);
        assert_eq!(repo.list_cases().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn find_or_create_is_idempotent() {
        let repo = repo();
        let a = repo.find_or_create_by_name("Case-A").await.unwrap();
        let b = repo.find_or_create_by_name("Case-A").await.unwrap();
        assert_eq!(a.id, b.id);
        assert!(a.stages.is_empty());
        assert_eq!(repo.list_cases().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn blank_name_rejected() {
        let repo = repo();
        let err = repo
            .append_stage(&CaseKey::Name("  ".into()), record(0, "a"))
            .await
            .unwrap_err();
        assert!(matches!(err, CaseBriefError::Validation { .. }));
        assert!(repo.list_cases().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_case_removes_only_target() {
        let repo = repo();
        let a = repo.find_or_create_by_name("A").await.unwrap();
        let b = repo.find_or_create_by_name("B").await.unwrap();

        assert!(repo.delete_case(a.id).await.unwrap());
        assert!(!repo.delete_case(a.id).await.unwrap());

        let cases = repo.list_cases().await.unwrap();
        assert_eq!(cases.len(), 1);
        assert_eq!(cases[0].id, b.id);

        assert!(repo.delete_case(b.id).await.unwrap());
        assert!(repo.list_cases().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_collection_fails_without_overwrite() {
        let store = Arc::new(MemoryStore::new());
        store.set("cases", "{not json").await.unwrap();
        let repo = CaseRepository::new(store.clone());

        let err = repo
            .append_stage(&CaseKey::Name("A".into()), record(0, "a"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("malformed"));
        assert_eq!(store.get("cases").await.unwrap().as_deref(), Some("{not json"));
    }

    #[tokio::test]
    async fn write_failure_propagates() {
        let repo = CaseRepository::new(Arc::new(ReadOnlyStore::default()));
        let err = repo
            .append_stage(&CaseKey::Name("A".into()), record(0, "a"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("disk full"));
        assert!(repo.list_cases().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn custom_collection_key() {
        let store = Arc::new(MemoryStore::new());
        let repo = CaseRepository::with_collection_key(store.clone(), "archive");
        repo.find_or_create_by_name("A").await.unwrap();
        assert!(store.get("archive").await.unwrap().is_some());
        assert!(store.get(DEFAULT_COLLECTION_KEY).await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_appends_do_not_lose_updates() {
        let repo = Arc::new(CaseRepository::new(Arc::new(SlowStore::default())));

        let mut handles = Vec::new();
        for i in 0..12 {
            let repo = repo.clone();
            let name = if i % 3 == 0 { "Case-B" } else { "Case-A" };
            handles.push(tokio::spawn(async move {
                repo.append_stage(&CaseKey::Name(name.into()), record(i, &format!("r{i}")))
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let cases = repo.list_cases().await.unwrap();
        assert_eq!(cases.len(), 2);
        let a = cases.iter().find(|c| c.name == "Case-A").unwrap();
        let b = cases.iter().find(|c| c.name == "Case-B").unwrap();
        assert_eq!(a.stages.len(), 8);
        assert_eq!(b.stages.len(), 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn repositories_sharing_a_store_do_not_lose_appends() {
        let store = Arc::new(SlowStore::default());
        let first = CaseRepository::new(store.clone());
        let second = CaseRepository::new(store.clone());
        let key = CaseKey::Name("Case-A".into());

        let (a, b) = tokio::join!(
            first.append_stage(&key, record(0, "r0")),
            second.append_stage(&key, record(1, "r1")),
        );
        assert_eq!(a.unwrap(), b.unwrap());

        let cases = first.list_cases().await.unwrap();
        assert_eq!(cases.len(), 1);
        let mut indices: Vec<usize> = cases[0].stages.iter().map(|r| r.stage_index).collect();
        indices.sort_unstable();
        assert_eq!(indices, vec![0, 1]);
    }

    #[tokio::test]
    async fn repositories_over_one_database_file_share_cases() {
        let path = std::env::temp_dir().join(format!("cb_repo_{}.db", CaseId::new()));
        let first = Arc::new(CaseRepository::new(Arc::new(
            LibsqlStore::open(&path).await.unwrap(),
        )));
        let second = Arc::new(CaseRepository::new(Arc::new(
            LibsqlStore::open(&path).await.unwrap(),
        )));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let repo = if i % 2 == 0 { first.clone() } else { second.clone() };
                tokio::spawn(async move {
                    repo.append_stage(&CaseKey::Name("Case-A".into()), record(i, "out"))
                        .await
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let case = second.find_by_name("Case-A").await.unwrap().unwrap();
        assert_eq!(case.stages.len(), 8);
    }

    #[tokio::test]
    async fn find_or_create_existing_case_does_not_write() {
        let repo = CaseRepository::new(Arc::new(ReadOnlyStore::default()));
        repo.store
            .inner
            .set("cases", &serde_json::to_string(&[CaseAggregate::new(CaseId::new(), "A")]).unwrap())
            .await
            .unwrap();
        assert_eq!(repo.find_or_create_by_name("A").await.unwrap().name, "A");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn merge_by_name_under_any_interleaving(
            names in prop::collection::vec(prop::sample::select(vec!["Case-A", "Case-B", "Case-C"]), 1..10),
        ) {
            let rt = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(4)
                .enable_all()
                .build()
                .unwrap();

            let cases = rt.block_on(async {
                let repo = Arc::new(CaseRepository::new(Arc::new(SlowStore::default())));
                let handles: Vec<_> = names
                    .iter()
                    .enumerate()
                    .map(|(i, name)| {
                        let repo = repo.clone();
                        let key = CaseKey::Name((*name).to_string());
                        tokio::spawn(async move { repo.append_stage(&key, record(i, "out")).await })
                    })
                    .collect();
                for handle in handles {
                    handle.await.unwrap().unwrap();
                }
                repo.list_cases().await.unwrap()
            });

            let mut distinct: Vec<&str> = names.clone();
            distinct.sort_unstable();
            distinct.dedup();
            prop_assert_eq!(cases.len(), distinct.len());

            for name in distinct {
                let matching: Vec<_> = cases.iter().filter(|c| c.name == name).collect();
                prop_assert_eq!(matching.len(), 1);
                let expected = names.iter().filter(|n| **n == name).count();
                prop_assert_eq!(matching[0].stages.len(), expected);
            }
        }
    }
}

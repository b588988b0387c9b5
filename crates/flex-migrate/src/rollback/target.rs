//! Destination abstraction for applying and undoing mutations.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{MigrateError, Result};
use crate::retry::ErrorCategory;

/// A destination that can apply keyed mutations.
///
/// Transaction support is optional; without it, transactional rollback falls
/// back to manual replay.
#[async_trait]
pub trait MutationTarget: Send + Sync {
    async fn insert(&self, collection: &str, key: &str, image: &Value) -> Result<()>;

    async fn update(&self, collection: &str, key: &str, image: &Value) -> Result<()>;

    async fn delete(&self, collection: &str, key: &str) -> Result<()>;

    fn supports_transactions(&self) -> bool {
        false
    }

    async fn begin(&self) -> Result<()> {
        Err(MigrateError::processing("transactions not supported"))
    }

    async fn commit(&self) -> Result<()> {
        Err(MigrateError::processing("transactions not supported"))
    }

    async fn abort(&self) -> Result<()> {
        Err(MigrateError::processing("transactions not supported"))
    }
}

type Collections = BTreeMap<String, BTreeMap<String, Value>>;

#[derive(Default)]
struct TargetState {
    collections: Collections,
    snapshot: Option<Collections>,
}

/// Keyed in-memory destination with snapshot transactions.
///
/// Used for dry runs and tests. Failures can be injected per key.
pub struct InMemoryTarget {
    state: Mutex<TargetState>,
    transactional: bool,
    failures: Mutex<HashMap<String, ErrorCategory>>,
}

impl InMemoryTarget {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TargetState::default()),
            transactional: true,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Target that reports no transaction support.
    pub fn without_transactions() -> Self {
        Self {
            transactional: false,
            ..Self::new()
        }
    }

    /// Make every mutation of `key` fail with an error of `category`.
    pub fn fail_on(&self, key: &str, category: ErrorCategory) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.insert(key.to_string(), category);
        }
    }

    pub fn clear_failures(&self) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.clear();
        }
    }

    /// Records in `collection`.
    pub fn count(&self, collection: &str) -> usize {
        self.state
            .lock()
            .map(|s| s.collections.get(collection).map_or(0, |c| c.len()))
            .unwrap_or(0)
    }

    pub fn get(&self, collection: &str, key: &str) -> Option<Value> {
        self.state
            .lock()
            .ok()?
            .collections
            .get(collection)?
            .get(key)
            .cloned()
    }

    fn check_failure(&self, key: &str) -> Result<()> {
        let category = self
            .failures
            .lock()
            .map_err(|_| MigrateError::processing("failure table poisoned"))?
            .get(key)
            .copied();
        match category {
            Some(category) if category.is_recoverable() => Err(MigrateError::Recoverable {
                category,
                attempts: 1,
                message: format!("injected failure for key {}", key),
            }),
            Some(category) => Err(MigrateError::fatal(
                category,
                format!("injected failure for key {}", key),
                None,
            )),
            None => Ok(()),
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut TargetState) -> Result<T>) -> Result<T> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| MigrateError::processing("target state poisoned"))?;
        f(&mut state)
    }
}

impl Default for InMemoryTarget {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MutationTarget for InMemoryTarget {
    async fn insert(&self, collection: &str, key: &str, image: &Value) -> Result<()> {
        self.check_failure(key)?;
        self.with_state(|s| {
            let records = s.collections.entry(collection.to_string()).or_default();
            if records.contains_key(key) {
                return Err(MigrateError::processing(format!(
                    "duplicate key {} in {}",
                    key, collection
                )));
            }
            records.insert(key.to_string(), image.clone());
            Ok(())
        })
    }

    async fn update(&self, collection: &str, key: &str, image: &Value) -> Result<()> {
        self.check_failure(key)?;
        self.with_state(|s| {
            match s
                .collections
                .get_mut(collection)
                .and_then(|records| records.get_mut(key))
            {
                Some(existing) => {
                    *existing = image.clone();
                    Ok(())
                }
                None => Err(MigrateError::processing(format!(
                    "no record {} in {}",
                    key, collection
                ))),
            }
        })
    }

    async fn delete(&self, collection: &str, key: &str) -> Result<()> {
        self.check_failure(key)?;
        self.with_state(|s| {
            match s
                .collections
                .get_mut(collection)
                .and_then(|records| records.remove(key))
            {
                Some(_) => Ok(()),
                None => Err(MigrateError::processing(format!(
                    "no record {} in {}",
                    key, collection
                ))),
            }
        })
    }

    fn supports_transactions(&self) -> bool {
        self.transactional
    }

    async fn begin(&self) -> Result<()> {
        if !self.transactional {
            return Err(MigrateError::processing("transactions not supported"));
        }
        self.with_state(|s| {
            if s.snapshot.is_some() {
                return Err(MigrateError::processing("transaction already open"));
            }
            s.snapshot = Some(s.collections.clone());
            Ok(())
        })
    }

    async fn commit(&self) -> Result<()> {
        self.with_state(|s| {
            s.snapshot
                .take()
                .map(|_| ())
                .ok_or_else(|| MigrateError::processing("no open transaction"))
        })
    }

    async fn abort(&self) -> Result<()> {
        self.with_state(|s| match s.snapshot.take() {
            Some(snapshot) => {
                s.collections = snapshot;
                Ok(())
            }
            None => Err(MigrateError::processing("no open transaction")),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_crud() {
        let target = InMemoryTarget::new();
        target.insert("users", "1", &json!({"n": 1})).await.unwrap();
        assert!(target.insert("users", "1", &json!({})).await.is_err());
        target.update("users", "1", &json!({"n": 2})).await.unwrap();
        assert_eq!(target.get("users", "1"), Some(json!({"n": 2})));
        target.delete("users", "1").await.unwrap();
        assert_eq!(target.count("users"), 0);
        assert!(target.delete("users", "1").await.is_err());
    }

    #[tokio::test]
    async fn test_abort_restores_snapshot() {
        let target = InMemoryTarget::new();
        target.insert("t", "a", &json!(1)).await.unwrap();
        target.begin().await.unwrap();
        target.delete("t", "a").await.unwrap();
        target.insert("t", "b", &json!(2)).await.unwrap();
        target.abort().await.unwrap();
        assert_eq!(target.count("t"), 1);
        assert_eq!(target.get("t", "a"), Some(json!(1)));
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let target = InMemoryTarget::new();
        target.fail_on("x", ErrorCategory::PermissionDenied);
        let err = target.insert("t", "x", &json!(1)).await.unwrap_err();
        assert_eq!(err.category(), Some(ErrorCategory::PermissionDenied));

        target.fail_on("y", ErrorCategory::TemporaryLock);
        let err = target.insert("t", "y", &json!(1)).await.unwrap_err();
        assert!(matches!(err, MigrateError::Recoverable { .. }));
    }
}

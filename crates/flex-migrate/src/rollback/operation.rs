//! Recorded mutations and their inverses.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{MigrateError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OperationKind::Insert => "insert",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
        })
    }
}

/// One mutation applied to the destination.
///
/// Never modified after it is recorded. Undoing it appends a new operation
/// whose `reverts` names this one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: String,

    /// Position in the run's log, assigned when recorded.
    pub sequence: u64,

    pub kind: OperationKind,

    /// Target collection (table, index, bucket...).
    pub collection: String,

    /// Record key within the collection.
    pub key: String,

    /// Image before the mutation. Required to invert updates and deletes.
    pub before: Option<Value>,

    /// Image after the mutation.
    pub after: Option<Value>,

    /// Operation this one undoes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reverts: Option<String>,

    pub timestamp: DateTime<Utc>,
}

impl Operation {
    fn build(
        kind: OperationKind,
        collection: impl Into<String>,
        key: impl Into<String>,
        before: Option<Value>,
        after: Option<Value>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            sequence: 0,
            kind,
            collection: collection.into(),
            key: key.into(),
            before,
            after,
            reverts: None,
            timestamp: Utc::now(),
        }
    }

    pub fn insert(collection: impl Into<String>, key: impl Into<String>, after: Value) -> Self {
        Self::build(OperationKind::Insert, collection, key, None, Some(after))
    }

    /// An update. `before` may be `None` when the prior image was not captured,
    /// in which case the update cannot be inverted.
    pub fn update(
        collection: impl Into<String>,
        key: impl Into<String>,
        before: Option<Value>,
        after: Value,
    ) -> Self {
        Self::build(OperationKind::Update, collection, key, before, Some(after))
    }

    pub fn delete(
        collection: impl Into<String>,
        key: impl Into<String>,
        before: Option<Value>,
    ) -> Self {
        Self::build(OperationKind::Delete, collection, key, before, None)
    }

    fn unsafe_because(&self, reason: &str) -> MigrateError {
        MigrateError::RollbackUnsafe {
            operation_id: self.id.clone(),
            reason: reason.to_string(),
        }
    }

    /// The operation that undoes this one.
    ///
    /// Fails with `RollbackUnsafe` when the data needed to invert is missing.
    pub fn inverse(&self) -> Result<Operation> {
        if self.key.is_empty() {
            return Err(self.unsafe_because("no record key"));
        }
        let mut inverse = match self.kind {
            OperationKind::Insert => Operation::build(
                OperationKind::Delete,
                self.collection.clone(),
                self.key.clone(),
                self.after.clone(),
                None,
            ),
            OperationKind::Update => {
                let before = self
                    .before
                    .clone()
                    .ok_or_else(|| self.unsafe_because("update has no before-image"))?;
                Operation::build(
                    OperationKind::Update,
                    self.collection.clone(),
                    self.key.clone(),
                    self.after.clone(),
                    Some(before),
                )
            }
            OperationKind::Delete => {
                let before = self
                    .before
                    .clone()
                    .ok_or_else(|| self.unsafe_because("delete has no before-image"))?;
                Operation::build(
                    OperationKind::Insert,
                    self.collection.clone(),
                    self.key.clone(),
                    None,
                    Some(before),
                )
            }
        };
        inverse.reverts = Some(self.id.clone());
        Ok(inverse)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_insert_inverts_to_delete() {
        let op = Operation::insert("users", "1", json!({"name": "Ann"}));
        let inv = op.inverse().unwrap();
        assert_eq!(inv.kind, OperationKind::Delete);
        assert_eq!(inv.key, "1");
        assert_eq!(inv.reverts.as_deref(), Some(op.id.as_str()));
    }

    #[test]
    fn test_update_restores_before_image() {
        let op = Operation::update("users", "1", Some(json!({"n": 1})), json!({"n": 2}));
        let inv = op.inverse().unwrap();
        assert_eq!(inv.kind, OperationKind::Update);
        assert_eq!(inv.after, Some(json!({"n": 1})));
        assert_eq!(inv.before, Some(json!({"n": 2})));
    }

    #[test]
    fn test_missing_images_are_unsafe() {
        let update = Operation::update("users", "1", None, json!({}));
        let err = update.inverse().unwrap_err();
        assert!(err.to_string().contains("could not safely invert"));

        let delete = Operation::delete("users", "1", None);
        assert!(matches!(
            delete.inverse(),
            Err(MigrateError::RollbackUnsafe { .. })
        ));

        let keyless = Operation::insert("users", "", json!({}));
        assert!(keyless.inverse().is_err());
    }

    #[test]
    fn test_delete_inverts_to_reinsert() {
        let op = Operation::delete("users", "9", Some(json!({"n": 9})));
        let inv = op.inverse().unwrap();
        assert_eq!(inv.kind, OperationKind::Insert);
        assert_eq!(inv.after, Some(json!({"n": 9})));
    }
}

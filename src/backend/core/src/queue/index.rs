//! Owner and Type indexes.
//!
//! Each index is one hash: field = owner id (or type), value = JSON list of the
//! job ids currently scheduled under it. Lists are rewritten whole, so every
//! mutation happens inside a transaction that watches the index hash, and an
//! emptied list deletes its field to keep the hash sparse.

use std::collections::HashMap;

use super::entry::JobId;
use crate::error::{QueueError, Result};
use crate::store::WriteOp;

/// Job ids filed under one index field, in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemberList {
    ids: Vec<JobId>,
}

impl MemberList {
    /// Decode a stored field value; a missing field is an empty list.
    pub fn decode(raw: Option<&[u8]>) -> Result<Self> {
        match raw {
            None => Ok(Self::default()),
            Some(bytes) => {
                let ids: Vec<JobId> = serde_json::from_slice(bytes).map_err(|e| {
                    QueueError::malformed("index member list", String::from_utf8_lossy(bytes))
                        .with_source(e)
                })?;
                Ok(Self { ids })
            }
        }
    }

    /// Add `id` unless already present.
    pub fn insert(&mut self, id: JobId) -> bool {
        if self.ids.contains(&id) {
            return false;
        }
        self.ids.push(id);
        true
    }

    pub fn remove(&mut self, id: JobId) -> bool {
        let before = self.ids.len();
        self.ids.retain(|existing| *existing != id);
        self.ids.len() != before
    }

    pub fn contains(&self, id: JobId) -> bool {
        self.ids.contains(&id)
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn ids(&self) -> &[JobId] {
        &self.ids
    }

    /// The write that stores this list, or drops the field when empty.
    pub fn write_op(&self, key: &str, field: &str) -> Result<WriteOp> {
        if self.ids.is_empty() {
            return Ok(WriteOp::HDel {
                key: key.to_string(),
                field: field.to_string(),
            });
        }
        Ok(WriteOp::HSet {
            key: key.to_string(),
            field: field.to_string(),
            value: serde_json::to_vec(&self.ids)?,
        })
    }
}

/// A decoded index hash, used when owners or types of arbitrary jobs must be
/// resolved (unschedule by job id, "any owner" selection).
#[derive(Debug, Default)]
pub struct IndexSnapshot {
    lists: HashMap<String, MemberList>,
}

impl IndexSnapshot {
    pub fn decode(raw: HashMap<String, Vec<u8>>) -> Result<Self> {
        let mut lists = HashMap::with_capacity(raw.len());
        for (field, bytes) in raw {
            lists.insert(field, MemberList::decode(Some(&bytes))?);
        }
        Ok(Self { lists })
    }

    pub fn list(&self, field: &str) -> Option<&MemberList> {
        self.lists.get(field)
    }

    /// The field a job is filed under, if any.
    pub fn field_of(&self, id: JobId) -> Option<&str> {
        self.lists
            .iter()
            .find(|(_, list)| list.contains(id))
            .map(|(field, _)| field.as_str())
    }

    /// Remove `ids` from whichever fields hold them; returns the writes for
    /// every field that changed.
    pub fn remove_all(&mut self, key: &str, ids: &[JobId]) -> Result<Vec<WriteOp>> {
        let mut ops = Vec::new();
        for (field, list) in self.lists.iter_mut() {
            let mut changed = false;
            for id in ids {
                changed |= list.remove(*id);
            }
            if changed {
                ops.push(list.write_op(key, field)?);
            }
        }
        Ok(ops)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_is_idempotent() {
        let mut list = MemberList::default();
        assert!(list.insert(JobId(1)));
        assert!(!list.insert(JobId(1)));
        assert!(list.insert(JobId(2)));
        assert_eq!(list.ids(), &[JobId(1), JobId(2)]);
    }

    #[test]
    fn test_empty_list_deletes_field() {
        let mut list = MemberList::decode(Some(b"[7]")).unwrap();
        assert!(list.remove(JobId(7)));
        assert_eq!(
            list.write_op("ns:owners", "5").unwrap(),
            WriteOp::HDel {
                key: "ns:owners".into(),
                field: "5".into()
            }
        );
    }

    #[test]
    fn test_non_empty_list_is_written() {
        let mut list = MemberList::default();
        list.insert(JobId(3));
        list.insert(JobId(9));
        match list.write_op("ns:types", "red").unwrap() {
            WriteOp::HSet { value, .. } => assert_eq!(value, b"[3,9]".to_vec()),
            other => panic!("unexpected op {:?}", other),
        }
    }

    #[test]
    fn test_corrupt_list_is_malformed() {
        let err = MemberList::decode(Some(b"not json")).unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::MalformedEntry);
    }

    #[test]
    fn test_snapshot_resolution_and_removal() {
        let mut raw = HashMap::new();
        raw.insert("1".to_string(), b"[10,11]".to_vec());
        raw.insert("2".to_string(), b"[12]".to_vec());
        let mut snapshot = IndexSnapshot::decode(raw).unwrap();

        assert_eq!(snapshot.field_of(JobId(11)), Some("1"));
        assert_eq!(snapshot.field_of(JobId(99)), None);

        let ops = snapshot.remove_all("ns:owners", &[JobId(11), JobId(12)]).unwrap();
        assert_eq!(ops.len(), 2);
        assert!(ops.contains(&WriteOp::HDel {
            key: "ns:owners".into(),
            field: "2".into()
        }));
        assert!(ops.contains(&WriteOp::HSet {
            key: "ns:owners".into(),
            field: "1".into(),
            value: b"[10]".to_vec()
        }));
    }
}

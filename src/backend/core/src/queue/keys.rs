//! Store key layout for one queue namespace.

/// The keys a queue owns under its namespace prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueKeys {
    /// Time Index: sorted set of entry keys scored by ready time
    pub queue: String,
    /// In-Flight Set: claim descriptors awaiting acknowledgment
    pub processing: String,
    /// Job id counter
    pub counter: String,
    /// Payload Store: job id -> payload
    pub payloads: String,
    /// Owner Index: owner id -> member list
    pub owners: String,
    /// Type Index: type -> member list
    pub types: String,
}

impl QueueKeys {
    pub fn new(namespace: &str) -> Self {
        Self {
            queue: format!("{}:queue", namespace),
            processing: format!("{}:processing", namespace),
            counter: format!("{}:counter", namespace),
            payloads: format!("{}:payloads", namespace),
            owners: format!("{}:owners", namespace),
            types: format!("{}:types", namespace),
        }
    }

    /// Every key, for `reset`.
    pub fn all(&self) -> Vec<String> {
        vec![
            self.queue.clone(),
            self.processing.clone(),
            self.counter.clone(),
            self.payloads.clone(),
            self.owners.clone(),
            self.types.clone(),
        ]
    }

    /// Watch set for operations that touch the Time Index and both indexes.
    pub fn index_watch(&self) -> Vec<String> {
        vec![self.queue.clone(), self.owners.clone(), self.types.clone()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_are_namespaced() {
        let keys = QueueKeys::new("mail");
        assert_eq!(keys.queue, "mail:queue");
        assert_eq!(keys.processing, "mail:processing");
        assert_eq!(keys.all().len(), 6);
        assert!(keys.all().iter().all(|k| k.starts_with("mail:")));
    }
}

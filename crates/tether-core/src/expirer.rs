//! TTL registry for topics and request ids.
//!
//! Entries fire once: the `Expired` event and the removal happen together.
//! The periodic sweep is gated on relay connectivity, so entries that pass
//! while offline fire on the first pulse after reconnection.
use std::fmt;
use std::str::FromStr;

use serde_json::Value;

use crate::store::{storage_key, Persisted, Store, CORE_STORAGE_PREFIX};
use crate::types::{is_expired_at, now_ms};
use crate::ProtocolError;

/// What an expiry is attached to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ExpirerTarget {
    Topic(String),
    Id(u64),
}

impl fmt::Display for ExpirerTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpirerTarget::Topic(topic) => write!(f, "topic:{topic}"),
            ExpirerTarget::Id(id) => write!(f, "id:{id}"),
        }
    }
}

impl FromStr for ExpirerTarget {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(topic) = s.strip_prefix("topic:") {
            return Ok(ExpirerTarget::Topic(topic.to_string()));
        }
        if let Some(id) = s.strip_prefix("id:") {
            let id = id
                .parse()
                .map_err(|_| ProtocolError::MissingOrInvalid(format!("expirer target {s}")))?;
            return Ok(ExpirerTarget::Id(id));
        }
        Err(ProtocolError::MissingOrInvalid(format!("expirer target {s}")))
    }
}

impl From<u64> for ExpirerTarget {
    fn from(id: u64) -> Self {
        ExpirerTarget::Id(id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpirerEvent {
    Created { target: ExpirerTarget, expiry: u64 },
    Deleted { target: ExpirerTarget },
    Expired { target: ExpirerTarget, expiry: u64 },
}

pub struct Expirer {
    entries: Store<u64>,
}

impl Expirer {
    pub fn new(custom_prefix: &str) -> Self {
        Self {
            entries: Store::new(
                "expirer",
                storage_key(CORE_STORAGE_PREFIX, custom_prefix, "expirer"),
            ),
        }
    }

    pub fn has(&self, target: &ExpirerTarget) -> bool {
        self.entries.has(&target.to_string())
    }

    pub fn get(&self, target: &ExpirerTarget) -> Result<u64, ProtocolError> {
        self.entries.get(&target.to_string()).copied()
    }

    /// Upsert, then fire right away if `expiry` (unix seconds) already passed.
    pub fn set(&mut self, target: ExpirerTarget, expiry: u64) -> Vec<ExpirerEvent> {
        self.set_at(target, expiry, now_ms())
    }

    pub fn set_at(&mut self, target: ExpirerTarget, expiry: u64, now_ms: u64) -> Vec<ExpirerEvent> {
        self.entries.set(target.to_string(), expiry);
        let mut events = vec![ExpirerEvent::Created {
            target: target.clone(),
            expiry,
        }];
        if is_expired_at(expiry, now_ms) {
            self.entries.delete(&target.to_string());
            events.push(ExpirerEvent::Expired { target, expiry });
        }
        events
    }

    pub fn del(&mut self, target: &ExpirerTarget) -> Option<ExpirerEvent> {
        self.entries
            .delete(&target.to_string())
            .map(|_| ExpirerEvent::Deleted {
                target: target.clone(),
            })
    }

    /// Sweep on a heartbeat pulse. Nothing fires while `online` is false.
    pub fn check_expirations_at(&mut self, now_ms: u64, online: bool) -> Vec<ExpirerEvent> {
        if !online {
            return Vec::new();
        }
        let due: Vec<(String, u64)> = self
            .entries
            .iter()
            .filter(|(_, expiry)| is_expired_at(**expiry, now_ms))
            .map(|(k, v)| (k.clone(), *v))
            .collect();

        let mut events = Vec::with_capacity(due.len());
        for (key, expiry) in due {
            self.entries.delete(&key);
            match key.parse::<ExpirerTarget>() {
                Ok(target) => events.push(ExpirerEvent::Expired { target, expiry }),
                Err(e) => tracing::warn!("dropping malformed expirer entry: {e}"),
            }
        }
        events
    }

    pub fn targets(&self) -> Vec<ExpirerTarget> {
        self.entries
            .keys()
            .filter_map(|k| k.parse().ok())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Persisted for Expirer {
    fn storage_key(&self) -> &str {
        self.entries.storage_key()
    }

    fn is_dirty(&self) -> bool {
        self.entries.is_dirty()
    }

    fn mark_clean(&mut self) {
        self.entries.mark_clean();
    }

    fn snapshot(&self) -> Result<Value, ProtocolError> {
        self.entries.snapshot()
    }

    fn restore(&mut self, value: Value) -> Result<(), ProtocolError> {
        self.entries.restore(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: u64 = 1_700_000_000_000;

    fn topic(t: &str) -> ExpirerTarget {
        ExpirerTarget::Topic(t.into())
    }

    #[test]
    fn target_format() {
        assert_eq!(topic("abc").to_string(), "topic:abc");
        assert_eq!(ExpirerTarget::Id(42).to_string(), "id:42");
        assert_eq!("id:42".parse::<ExpirerTarget>().unwrap(), ExpirerTarget::Id(42));
        assert!("session:x".parse::<ExpirerTarget>().is_err());
        assert!("id:abc".parse::<ExpirerTarget>().is_err());
    }

    #[test]
    fn past_expiry_fires_immediately_once() {
        let mut e = Expirer::new("");
        let events = e.set_at(topic("t"), NOW / 1000 - 1, NOW);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], ExpirerEvent::Expired { .. }));
        assert!(!e.has(&topic("t")));
        assert!(e.check_expirations_at(NOW, true).is_empty());
    }

    #[test]
    fn sweep_is_gated_on_connectivity() {
        let mut e = Expirer::new("");
        e.set_at(ExpirerTarget::Id(1), NOW / 1000 + 10, NOW);
        let later = NOW + 20_000;

        assert!(e.check_expirations_at(later, false).is_empty());
        assert!(e.has(&ExpirerTarget::Id(1)));

        let fired = e.check_expirations_at(later, true);
        assert_eq!(
            fired,
            vec![ExpirerEvent::Expired {
                target: ExpirerTarget::Id(1),
                expiry: NOW / 1000 + 10
            }]
        );
        assert!(e.is_empty());
    }

    #[test]
    fn set_upserts() {
        let mut e = Expirer::new("");
        e.set_at(topic("t"), NOW / 1000 + 10, NOW);
        e.set_at(topic("t"), NOW / 1000 + 99, NOW);
        assert_eq!(e.len(), 1);
        assert_eq!(e.get(&topic("t")).unwrap(), NOW / 1000 + 99);
    }

    #[test]
    fn del_reports_only_existing() {
        let mut e = Expirer::new("");
        assert!(e.del(&topic("t")).is_none());
        e.set_at(topic("t"), NOW / 1000 + 10, NOW);
        assert_eq!(
            e.del(&topic("t")),
            Some(ExpirerEvent::Deleted { target: topic("t") })
        );
    }
}

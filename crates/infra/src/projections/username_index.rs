//! Per-partition username index.
//!
//! Each instance only sees the accounts of its own partition, so it cannot
//! decide global uniqueness: two accounts in different partitions may both
//! appear as the owner of the same name. Use it for lookups; uniqueness is
//! arbitrated by the [`Coordinator`](crate::coordinator::Coordinator).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use factline_accounts::{AGGREGATE_TYPE, AccountEvent, AccountId};
use factline_events::{EventEnvelope, NoEffect, Projection};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsernameIndex {
    owners: BTreeMap<String, AccountId>,
}

impl UsernameIndex {
    pub fn owner_of(&self, username: &str) -> Option<&AccountId> {
        self.owners.get(username)
    }

    pub fn is_taken(&self, username: &str) -> bool {
        self.owners.contains_key(username)
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }
}

impl Projection for UsernameIndex {
    type Ev = AccountEvent;
    type Effect = NoEffect;

    const NAME: &'static str = "username_index";

    fn handles(aggregate_type: &str) -> bool {
        aggregate_type == AGGREGATE_TYPE
    }

    fn apply(&mut self, envelope: &EventEnvelope<AccountEvent>) -> Vec<NoEffect> {
        match envelope.payload() {
            AccountEvent::UsernameChanged(e) => {
                if let Some(previous) = &e.previous {
                    self.owners.remove(previous.as_str());
                }
                self.owners.insert(e.username.as_str().to_string(), e.account_id.clone());
            }
            AccountEvent::AccountClosed(e) => {
                if let Some(name) = &e.username {
                    self.owners.remove(name.as_str());
                }
            }
        }
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use factline_accounts::{Username, UsernameChanged};
    use factline_core::{AggregateId, CommandId, EventId, PartitionId};

    use super::*;

    #[test]
    fn rename_moves_the_entry() {
        let mut index = UsernameIndex::default();
        let id = AccountId::parse("1").unwrap();
        for (offset, (name, previous)) in [("foo", None), ("bar", Some("foo"))].into_iter().enumerate() {
            index.apply(&EventEnvelope::new(
                EventId::new(),
                CommandId::new(),
                AggregateId::new("1").unwrap(),
                AGGREGATE_TYPE,
                offset as u64 + 1,
                PartitionId::new(0),
                offset as u64,
                AccountEvent::UsernameChanged(UsernameChanged {
                    account_id: id.clone(),
                    username: Username::parse(name).unwrap(),
                    previous: previous.map(|p| Username::parse(p).unwrap()),
                    occurred_at: Utc::now(),
                }),
            ));
        }

        assert!(!index.is_taken("foo"));
        assert_eq!(index.owner_of("bar"), Some(&id));
    }
}

//! Accounts read model: current username and status per account.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use factline_accounts::{AGGREGATE_TYPE, AccountEvent, AccountId};
use factline_core::EventId;
use factline_events::{Effect, EventEnvelope, Projection};

/// Effect kind of [`AccountNotification::UsernameChanged`].
pub const NOTIFY_USERNAME_CHANGED: &str = "notify.username_changed";

/// Read model row for one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountReadState {
    pub id: AccountId,
    pub name: Option<String>,
    pub active: bool,
    pub last_event_id: EventId,
}

/// Outbound notifications requested by the accounts view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountNotification {
    UsernameChanged {
        account_id: AccountId,
        username: String,
        previous: Option<String>,
    },
}

impl Effect for AccountNotification {
    fn kind(&self) -> &'static str {
        match self {
            AccountNotification::UsernameChanged { .. } => NOTIFY_USERNAME_CHANGED,
        }
    }
}

/// Accounts of one partition, keyed by account id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountsView {
    accounts: BTreeMap<String, AccountReadState>,
}

impl AccountsView {
    pub fn get(&self, id: &AccountId) -> Option<&AccountReadState> {
        self.accounts.get(id.as_aggregate_id().as_str())
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AccountReadState> {
        self.accounts.values()
    }
}

impl Projection for AccountsView {
    type Ev = AccountEvent;
    type Effect = AccountNotification;

    const NAME: &'static str = "accounts";

    fn handles(aggregate_type: &str) -> bool {
        aggregate_type == AGGREGATE_TYPE
    }

    fn apply(&mut self, envelope: &EventEnvelope<AccountEvent>) -> Vec<AccountNotification> {
        match envelope.payload() {
            AccountEvent::UsernameChanged(e) => {
                let row = self
                    .accounts
                    .entry(e.account_id.as_aggregate_id().as_str().to_string())
                    .or_insert_with(|| AccountReadState {
                        id: e.account_id.clone(),
                        name: None,
                        active: true,
                        last_event_id: envelope.event_id(),
                    });
                row.name = Some(e.username.as_str().to_string());
                row.active = true;
                row.last_event_id = envelope.event_id();

                vec![AccountNotification::UsernameChanged {
                    account_id: e.account_id.clone(),
                    username: e.username.as_str().to_string(),
                    previous: e.previous.as_ref().map(|p| p.as_str().to_string()),
                }]
            }
            AccountEvent::AccountClosed(e) => {
                if let Some(row) = self.accounts.get_mut(e.account_id.as_aggregate_id().as_str()) {
                    row.name = None;
                    row.active = false;
                    row.last_event_id = envelope.event_id();
                }
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use factline_accounts::{AccountClosed, Username, UsernameChanged};
    use factline_core::{AggregateId, CommandId, PartitionId};

    use super::*;

    fn envelope(offset: u64, event: AccountEvent) -> EventEnvelope<AccountEvent> {
        EventEnvelope::new(
            EventId::new(),
            CommandId::new(),
            AggregateId::new("1").unwrap(),
            AGGREGATE_TYPE,
            offset + 1,
            PartitionId::new(0),
            offset,
            event,
        )
    }

    fn renamed(name: &str, previous: Option<&str>) -> AccountEvent {
        AccountEvent::UsernameChanged(UsernameChanged {
            account_id: AccountId::parse("1").unwrap(),
            username: Username::parse(name).unwrap(),
            previous: previous.map(|p| Username::parse(p).unwrap()),
            occurred_at: Utc::now(),
        })
    }

    #[test]
    fn rename_updates_the_row_and_asks_for_a_notification() {
        let mut view = AccountsView::default();
        let env = envelope(0, renamed("alice", None));
        let effects = view.apply(&env);

        let row = view.get(&AccountId::parse("1").unwrap()).unwrap();
        assert_eq!(row.name.as_deref(), Some("alice"));
        assert!(row.active);
        assert_eq!(row.last_event_id, env.event_id());
        assert_eq!(effects.len(), 1);
        assert_eq!(effects[0].kind(), NOTIFY_USERNAME_CHANGED);
    }

    #[test]
    fn closing_deactivates_without_effects() {
        let mut view = AccountsView::default();
        view.apply(&envelope(0, renamed("alice", None)));
        let effects = view.apply(&envelope(
            1,
            AccountEvent::AccountClosed(AccountClosed {
                account_id: AccountId::parse("1").unwrap(),
                username: Some(Username::parse("alice").unwrap()),
                occurred_at: Utc::now(),
            }),
        ));

        assert!(effects.is_empty());
        let row = view.get(&AccountId::parse("1").unwrap()).unwrap();
        assert!(!row.active);
        assert_eq!(row.name, None);
    }
}

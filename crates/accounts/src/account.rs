use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use factline_core::{Aggregate, AggregateId, AggregateRoot, CommandId, DomainError};
use factline_events::{ClaimChange, Command, Event, UniqueClaims};

use crate::Username;

/// Aggregate type tag stored with every account event.
pub const AGGREGATE_TYPE: &str = "account";

/// Account identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(pub AggregateId);

impl AccountId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }

    pub fn parse(raw: &str) -> Result<Self, DomainError> {
        AggregateId::new(raw).map(Self)
    }

    pub fn as_aggregate_id(&self) -> &AggregateId {
        &self.0
    }
}

impl core::fmt::Display for AccountId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Aggregate root: Account.
///
/// An account comes into existence with its first username change; there is
/// no separate "open" step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    id: AccountId,
    username: Option<Username>,
    closed: bool,
    version: u64,
}

impl Account {
    /// Create an empty, not-yet-created aggregate instance for rehydration.
    pub fn empty(id: AccountId) -> Self {
        Self {
            id,
            username: None,
            closed: false,
            version: 0,
        }
    }

    pub fn username(&self) -> Option<&Username> {
        self.username.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn exists(&self) -> bool {
        self.version > 0
    }
}

impl AggregateRoot for Account {
    type Id = AccountId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: ChangeUsername. The raw name is validated by the aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeUsername {
    pub command_id: CommandId,
    pub account_id: AccountId,
    pub username: String,
    pub occurred_at: DateTime<Utc>,
}

/// Command: CloseAccount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseAccount {
    pub command_id: CommandId,
    pub account_id: AccountId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountCommand {
    ChangeUsername(ChangeUsername),
    CloseAccount(CloseAccount),
}

impl Command for AccountCommand {
    fn command_id(&self) -> CommandId {
        match self {
            AccountCommand::ChangeUsername(c) => c.command_id,
            AccountCommand::CloseAccount(c) => c.command_id,
        }
    }

    fn target_aggregate_id(&self) -> AggregateId {
        match self {
            AccountCommand::ChangeUsername(c) => c.account_id.0.clone(),
            AccountCommand::CloseAccount(c) => c.account_id.0.clone(),
        }
    }
}

/// Event: UsernameChanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsernameChanged {
    pub account_id: AccountId,
    pub username: Username,
    pub previous: Option<Username>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: AccountClosed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountClosed {
    pub account_id: AccountId,
    pub username: Option<Username>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountEvent {
    UsernameChanged(UsernameChanged),
    AccountClosed(AccountClosed),
}

impl Event for AccountEvent {
    fn event_type(&self) -> &'static str {
        match self {
            AccountEvent::UsernameChanged(_) => "account.username_changed",
            AccountEvent::AccountClosed(_) => "account.closed",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            AccountEvent::UsernameChanged(e) => e.occurred_at,
            AccountEvent::AccountClosed(e) => e.occurred_at,
        }
    }
}

impl UniqueClaims for AccountEvent {
    fn claim_changes(&self) -> Vec<ClaimChange> {
        match self {
            AccountEvent::UsernameChanged(e) => {
                let mut changes = Vec::with_capacity(2);
                if let Some(prev) = &e.previous {
                    changes.push(ClaimChange::Release(prev.claim_key()));
                }
                changes.push(ClaimChange::Acquire(e.username.claim_key()));
                changes
            }
            AccountEvent::AccountClosed(e) => e
                .username
                .iter()
                .map(|u| ClaimChange::Release(u.claim_key()))
                .collect(),
        }
    }
}

impl Aggregate for Account {
    type Command = AccountCommand;
    type Event = AccountEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            AccountEvent::UsernameChanged(e) => {
                self.id = e.account_id.clone();
                self.username = Some(e.username.clone());
            }
            AccountEvent::AccountClosed(_) => {
                self.closed = true;
                self.username = None;
            }
        }

        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            AccountCommand::ChangeUsername(cmd) => self.handle_change_username(cmd),
            AccountCommand::CloseAccount(cmd) => self.handle_close(cmd),
        }
    }
}

impl Account {
    fn ensure_account_id(&self, account_id: &AccountId) -> Result<(), DomainError> {
        if &self.id != account_id {
            return Err(DomainError::invariant("account_id mismatch"));
        }
        Ok(())
    }

    fn handle_change_username(&self, cmd: &ChangeUsername) -> Result<Vec<AccountEvent>, DomainError> {
        self.ensure_account_id(&cmd.account_id)?;
        if self.closed {
            return Err(DomainError::invariant("account is closed"));
        }
        let username = Username::parse(&cmd.username)?;
        if self.username.as_ref() == Some(&username) {
            return Ok(Vec::new());
        }
        Ok(vec![AccountEvent::UsernameChanged(UsernameChanged {
            account_id: cmd.account_id.clone(),
            username,
            previous: self.username.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_close(&self, cmd: &CloseAccount) -> Result<Vec<AccountEvent>, DomainError> {
        if !self.exists() {
            return Err(DomainError::not_found());
        }
        self.ensure_account_id(&cmd.account_id)?;
        if self.closed {
            return Err(DomainError::invariant("account already closed"));
        }
        Ok(vec![AccountEvent::AccountClosed(AccountClosed {
            account_id: cmd.account_id.clone(),
            username: self.username.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }
}

#[cfg(test)]
mod tests {
    use factline_events::{ClaimKey, execute};

    use super::*;

    fn account_id(raw: &str) -> AccountId {
        AccountId::parse(raw).unwrap()
    }

    fn change(id: &AccountId, name: &str) -> AccountCommand {
        AccountCommand::ChangeUsername(ChangeUsername {
            command_id: CommandId::new(),
            account_id: id.clone(),
            username: name.to_string(),
            occurred_at: Utc::now(),
        })
    }

    fn close(id: &AccountId) -> AccountCommand {
        AccountCommand::CloseAccount(CloseAccount {
            command_id: CommandId::new(),
            account_id: id.clone(),
            occurred_at: Utc::now(),
        })
    }

    #[test]
    fn first_username_change_creates_the_account() {
        let id = account_id("1");
        let mut account = Account::empty(id.clone());

        let events = execute(&mut account, &change(&id, "Alice")).unwrap();

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type(), "account.username_changed");
        assert_eq!(account.username().map(Username::as_str), Some("alice"));
        assert_eq!(account.version(), 1);
    }

    #[test]
    fn same_name_is_a_no_op() {
        let id = account_id("1");
        let mut account = Account::empty(id.clone());
        execute(&mut account, &change(&id, "alice")).unwrap();

        let events = execute(&mut account, &change(&id, "ALICE")).unwrap();
        assert!(events.is_empty());
        assert_eq!(account.version(), 1);
    }

    #[test]
    fn closed_accounts_reject_changes() {
        let id = account_id("1");
        let mut account = Account::empty(id.clone());
        execute(&mut account, &change(&id, "alice")).unwrap();
        execute(&mut account, &close(&id)).unwrap();

        assert!(matches!(
            account.handle(&change(&id, "bob")),
            Err(DomainError::InvariantViolation(_))
        ));
        assert!(matches!(account.handle(&close(&id)), Err(DomainError::InvariantViolation(_))));
    }

    #[test]
    fn closing_unknown_account_is_not_found() {
        let id = account_id("9");
        let account = Account::empty(id.clone());
        assert_eq!(account.handle(&close(&id)), Err(DomainError::NotFound));
    }

    #[test]
    fn invalid_usernames_are_validation_errors() {
        let id = account_id("1");
        let account = Account::empty(id.clone());
        assert!(matches!(account.handle(&change(&id, "x")), Err(DomainError::Validation(_))));
    }

    #[test]
    fn claims_follow_the_username() {
        let id = account_id("1");
        let mut account = Account::empty(id.clone());
        let first = execute(&mut account, &change(&id, "foo")).unwrap();
        let second = execute(&mut account, &change(&id, "bar")).unwrap();
        let closed = execute(&mut account, &close(&id)).unwrap();

        assert_eq!(
            first[0].claim_changes(),
            vec![ClaimChange::Acquire(ClaimKey::new("username", "foo"))]
        );
        assert_eq!(
            second[0].claim_changes(),
            vec![
                ClaimChange::Release(ClaimKey::new("username", "foo")),
                ClaimChange::Acquire(ClaimKey::new("username", "bar")),
            ]
        );
        assert_eq!(
            closed[0].claim_changes(),
            vec![ClaimChange::Release(ClaimKey::new("username", "bar"))]
        );
    }

    #[test]
    fn events_survive_json() {
        let id = account_id("1");
        let mut account = Account::empty(id.clone());
        let events = execute(&mut account, &change(&id, "alice")).unwrap();

        let json = serde_json::to_value(&events[0]).unwrap();
        let back: AccountEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, events[0]);
    }
}

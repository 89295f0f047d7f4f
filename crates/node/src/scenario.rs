//! Demo workload: a handful of account commands run through the engine.

use std::collections::BTreeMap;

use chrono::Utc;
use tracing::{info, warn};

use factline_accounts::{AGGREGATE_TYPE, Account, AccountCommand, AccountId, ChangeUsername, CloseAccount};
use factline_core::{AggregateId, CommandId, DomainError};
use factline_infra::projections::{AccountReadState, AccountsView, UsernameIndex};
use factline_infra::{CommandDispatcher, CommandReceipt, DispatchError, EventStore, ProjectionReader};

use crate::node::Node;

/// What the demo observed, for logging and tests.
#[derive(Debug, Default)]
pub struct Report {
    pub accepted: usize,
    pub replayed: usize,
    pub rejected: Vec<String>,
}

fn rename(account: &str, username: &str) -> Result<AccountCommand, DomainError> {
    Ok(AccountCommand::ChangeUsername(ChangeUsername {
        command_id: CommandId::new(),
        account_id: AccountId::parse(account)?,
        username: username.to_string(),
        occurred_at: Utc::now(),
    }))
}

fn close(account: &str) -> Result<AccountCommand, DomainError> {
    Ok(AccountCommand::CloseAccount(CloseAccount {
        command_id: CommandId::new(),
        account_id: AccountId::parse(account)?,
        occurred_at: Utc::now(),
    }))
}

fn account(id: AggregateId) -> Account {
    Account::empty(AccountId::new(id))
}

fn submit<S: EventStore>(
    dispatcher: &CommandDispatcher<S>,
    report: &mut Report,
    command: AccountCommand,
) -> Result<Option<CommandReceipt>, DispatchError> {
    match dispatcher.dispatch(AGGREGATE_TYPE, command, account) {
        Ok(receipt) => {
            if receipt.replayed {
                report.replayed += 1;
            } else {
                report.accepted += 1;
            }
            info!(
                command_id = %receipt.command_id,
                aggregate_id = %receipt.aggregate_id,
                version = receipt.new_version,
                replayed = receipt.replayed,
                "command applied"
            );
            Ok(Some(receipt))
        }
        Err(
            err @ (DispatchError::Validation(_) | DispatchError::InvariantViolation(_) | DispatchError::NotFound),
        ) => {
            warn!(error = %err, "command rejected");
            report.rejected.push(err.to_string());
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

/// Run the demo commands against `node`.
///
/// Account "3" asks for "alice" while account "1" holds it and is refused;
/// once "1" moves on to "alicia" the name is free again. The first command is
/// submitted twice with the same id and applied once.
pub fn run(node: &Node) -> anyhow::Result<Report> {
    let dispatcher = node.dispatcher();
    let mut report = Report::default();

    let first = rename("1", "alice")?;
    submit(&dispatcher, &mut report, first.clone())?;
    submit(&dispatcher, &mut report, first)?;
    submit(&dispatcher, &mut report, rename("2", "bob")?)?;
    submit(&dispatcher, &mut report, rename("3", "alice")?)?;
    submit(&dispatcher, &mut report, rename("1", "alicia")?)?;
    submit(&dispatcher, &mut report, rename("3", "alice")?)?;
    submit(&dispatcher, &mut report, close("2")?)?;

    Ok(report)
}

/// Log the merged read models across all partitions.
pub fn log_read_models(node: &Node) -> anyhow::Result<BTreeMap<String, AccountReadState>> {
    let partitions = node.config().partitions;

    let mut accounts = BTreeMap::new();
    for committed in ProjectionReader::<AccountsView>::new(node.checkpoints().clone()).load_all(partitions)? {
        for row in committed.state.iter() {
            accounts.insert(row.id.to_string(), row.clone());
        }
    }
    for row in accounts.values() {
        info!(
            account_id = %row.id,
            name = row.name.as_deref().unwrap_or("-"),
            active = row.active,
            "account"
        );
    }

    for committed in ProjectionReader::<UsernameIndex>::new(node.checkpoints().clone()).load_all(partitions)? {
        info!(checkpoint = ?committed.checkpoint, usernames = committed.state.len(), "username index partition");
    }
    Ok(accounts)
}

//! Accounts domain module (event-sourced).
//!
//! Business rules for user accounts and their globally unique usernames,
//! implemented purely as deterministic domain logic (no IO, no storage).
//! Cross-partition uniqueness is not decided here; events only declare the
//! claims they acquire and release.

pub mod account;
pub mod username;

pub use account::{
    AGGREGATE_TYPE, Account, AccountClosed, AccountCommand, AccountEvent, AccountId,
    ChangeUsername, CloseAccount, UsernameChanged,
};
pub use username::{USERNAME_NAMESPACE, Username};

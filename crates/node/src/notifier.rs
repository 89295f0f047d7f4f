use chrono::Utc;
use serde_json::{Value as JsonValue, json};
use tracing::info;

use factline_infra::EffectDispatcher;
use factline_infra::idempotency::EffectKey;
use factline_infra::projections::AccountNotification;

/// Delivers account notifications by logging them.
///
/// The returned receipt is what the idempotency guard records for the key.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl EffectDispatcher<AccountNotification> for LogNotifier {
    fn dispatch(&self, key: &EffectKey, effect: &AccountNotification) -> Result<JsonValue, String> {
        match effect {
            AccountNotification::UsernameChanged {
                account_id,
                username,
                previous,
            } => {
                info!(
                    key = %key,
                    account_id = %account_id,
                    username = %username,
                    previous = previous.as_deref().unwrap_or("-"),
                    "username change notification sent"
                );
            }
        }
        Ok(json!({ "delivered_at": Utc::now() }))
    }
}

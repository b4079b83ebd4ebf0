use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::debug;
use uuid::Uuid;

use crate::storage::models::RelayCharge;
use crate::storage::{ChargeOutcome, Storage, StorageError};

/// Quota ledger over both charge paths.
///
/// The relay path is conditional: it admits the request only if the balance
/// covers the amount. The settlement path is unconditional: the originating
/// request already completed, so the increment always lands.
pub struct Ledger {
    storage: Arc<dyn Storage>,
    default_total_quota: Decimal,
}

impl Ledger {
    pub fn new(storage: Arc<dyn Storage>, default_total_quota: Decimal) -> Self {
        Self {
            storage,
            default_total_quota,
        }
    }

    /// Conditional admission-time charge. A zero amount is admitted without
    /// touching storage: no ledger write, no audit row.
    pub async fn charge_relay(&self, charge: &RelayCharge) -> Result<ChargeOutcome, StorageError> {
        if charge.amount.is_zero() {
            debug!(account_id = %charge.account_id, "zero-cost relay, skipping charge");
            return Ok(ChargeOutcome::Charged);
        }
        self.storage
            .charge_relay(charge, self.default_total_quota)
            .await
    }

    /// Unconditional settlement-path increment, provisioning the quota row on
    /// first use. Also increments the API-key counters when a workflow run id
    /// links the usage to a key.
    pub async fn settle_usage(
        &self,
        account_id: Uuid,
        amount: Decimal,
        workflow_run_id: Option<&str>,
    ) -> Result<(), StorageError> {
        self.storage
            .apply_settlement(account_id, amount, self.default_total_quota, workflow_run_id)
            .await
    }
}

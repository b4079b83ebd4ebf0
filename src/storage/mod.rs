pub mod memory;
pub mod models;
pub mod postgres;

use async_trait::async_trait;
use rust_decimal::Decimal;
use uuid::Uuid;

use models::{AccountQuota, ApiKeyQuota, ForwardingAddress, ForwardingRoute, RelayCharge};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("failed to create database pool: {0}")]
    CreatePool(#[from] deadpool_postgres::CreatePoolError),
    #[error("database pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),
    #[error("database error: {0}")]
    Database(#[from] tokio_postgres::Error),
    #[error("stored data is invalid: {0}")]
    Corrupt(String),
}

/// Outcome of a conditional charge against an account quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargeOutcome {
    Charged,
    InsufficientBalance,
}

/// Persistence surface of the gateway. Backends must make every mutation
/// atomic: a charge is a single conditional update (plus its audit row in
/// the same transaction), a settlement is an unconditional increment.
#[async_trait]
pub trait Storage: Send + Sync {
    // ---- Routing tables (read-only from the proxy's side) ----

    async fn route_by_prefix(
        &self,
        path_prefix: &str,
    ) -> Result<Option<ForwardingRoute>, StorageError>;

    /// Active address under a route; inactive addresses are invisible.
    async fn address_for(
        &self,
        forwarding_id: Uuid,
        sub_path: &str,
    ) -> Result<Option<ForwardingAddress>, StorageError>;

    /// Account behind an access-token hash, if the token is active.
    async fn account_for_token(&self, token_hash: &str) -> Result<Option<Uuid>, StorageError>;

    // ---- Quota ledger ----

    async fn account_quota(&self, account_id: Uuid) -> Result<Option<AccountQuota>, StorageError>;

    async fn api_key_quota(&self, api_key_id: Uuid) -> Result<Option<ApiKeyQuota>, StorageError>;

    /// Check-and-charge for the relay path. Provisions a quota row with
    /// `default_total` on first use; refuses the whole charge (no write at
    /// all, audit row included) when it would push `used` past `total`.
    async fn charge_relay(
        &self,
        charge: &RelayCharge,
        default_total: Decimal,
    ) -> Result<ChargeOutcome, StorageError>;

    /// Settlement-path increment: `used_quota += amount` without a balance
    /// check, creating the row with `default_total` when absent. When
    /// `workflow_run_id` maps to an API key, that key's accumulated/day/month
    /// counters move by the same amount in the same transaction.
    async fn apply_settlement(
        &self,
        account_id: Uuid,
        amount: Decimal,
        default_total: Decimal,
        workflow_run_id: Option<&str>,
    ) -> Result<(), StorageError>;

    // ---- API-key quota lifecycle (driven by the key-management layer) ----

    async fn create_api_key_quota(
        &self,
        api_key_id: Uuid,
        description: &str,
    ) -> Result<(), StorageError>;

    async fn soft_delete_api_key_quota(&self, api_key_id: Uuid) -> Result<(), StorageError>;

    // ---- Payer resolution ----

    async fn account_exists(&self, account_id: Uuid) -> Result<bool, StorageError>;

    /// Account of the most recently created end-user association.
    async fn latest_account_for_end_user(
        &self,
        end_user_id: Uuid,
    ) -> Result<Option<Uuid>, StorageError>;
}

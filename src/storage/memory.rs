use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::models::{
    AccountQuota, ApiKeyQuota, ForwardingAddress, ForwardingRoute, RelayCharge, SettlementRecord,
};
use super::{ChargeOutcome, Storage, StorageError};

#[derive(Debug, Clone)]
struct EndUserJoin {
    end_user_id: Uuid,
    account_id: Uuid,
    created_at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    routes: Vec<ForwardingRoute>,
    addresses: Vec<ForwardingAddress>,
    /// token hash -> (account, active)
    tokens: HashMap<String, (Uuid, bool)>,
    accounts: HashSet<Uuid>,
    account_quotas: HashMap<Uuid, AccountQuota>,
    api_key_quotas: HashMap<Uuid, ApiKeyQuota>,
    end_user_joins: Vec<EndUserJoin>,
    /// workflow run id -> api key
    run_joins: HashMap<String, Uuid>,
    settlements: Vec<SettlementRecord>,
}

/// In-memory backend for development and tests. One mutex around the whole
/// store gives the same per-operation atomicity the SQL backend gets from
/// single-statement updates.
#[derive(Default)]
pub struct MemoryStorage {
    inner: Mutex<Inner>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    // ---- Seeding (the platform's admin surface owns these tables) ----

    pub async fn add_route(&self, route: ForwardingRoute) {
        self.inner.lock().await.routes.push(route);
    }

    pub async fn add_address(&self, address: ForwardingAddress) {
        self.inner.lock().await.addresses.push(address);
    }

    pub async fn add_access_token(&self, token_hash: &str, account_id: Uuid, active: bool) {
        self.inner
            .lock()
            .await
            .tokens
            .insert(token_hash.to_string(), (account_id, active));
    }

    pub async fn add_account(&self, account_id: Uuid) {
        self.inner.lock().await.accounts.insert(account_id);
    }

    pub async fn set_account_quota(&self, quota: AccountQuota) {
        self.inner
            .lock()
            .await
            .account_quotas
            .insert(quota.account_id, quota);
    }

    pub async fn link_end_user(
        &self,
        end_user_id: Uuid,
        account_id: Uuid,
        created_at: DateTime<Utc>,
    ) {
        self.inner.lock().await.end_user_joins.push(EndUserJoin {
            end_user_id,
            account_id,
            created_at,
        });
    }

    pub async fn link_api_key_run(&self, workflow_run_id: &str, api_key_id: Uuid) {
        self.inner
            .lock()
            .await
            .run_joins
            .insert(workflow_run_id.to_string(), api_key_id);
    }

    /// Audit rows written so far, oldest first.
    pub async fn settlement_records(&self) -> Vec<SettlementRecord> {
        self.inner.lock().await.settlements.clone()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn route_by_prefix(
        &self,
        path_prefix: &str,
    ) -> Result<Option<ForwardingRoute>, StorageError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .routes
            .iter()
            .find(|r| r.path_prefix == path_prefix)
            .cloned())
    }

    async fn address_for(
        &self,
        forwarding_id: Uuid,
        sub_path: &str,
    ) -> Result<Option<ForwardingAddress>, StorageError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .addresses
            .iter()
            .find(|a| a.forwarding_id == forwarding_id && a.sub_path == sub_path && a.active)
            .cloned())
    }

    async fn account_for_token(&self, token_hash: &str) -> Result<Option<Uuid>, StorageError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .tokens
            .get(token_hash)
            .filter(|(_, active)| *active)
            .map(|(account, _)| *account))
    }

    async fn account_quota(&self, account_id: Uuid) -> Result<Option<AccountQuota>, StorageError> {
        let inner = self.inner.lock().await;
        Ok(inner.account_quotas.get(&account_id).cloned())
    }

    async fn api_key_quota(&self, api_key_id: Uuid) -> Result<Option<ApiKeyQuota>, StorageError> {
        let inner = self.inner.lock().await;
        Ok(inner.api_key_quotas.get(&api_key_id).cloned())
    }

    async fn charge_relay(
        &self,
        charge: &RelayCharge,
        default_total: Decimal,
    ) -> Result<ChargeOutcome, StorageError> {
        let mut inner = self.inner.lock().await;
        match inner.account_quotas.get_mut(&charge.account_id) {
            Some(quota) => {
                if quota.used_quota + charge.amount > quota.total_quota {
                    return Ok(ChargeOutcome::InsufficientBalance);
                }
                quota.used_quota += charge.amount;
            }
            None => {
                if charge.amount > default_total {
                    return Ok(ChargeOutcome::InsufficientBalance);
                }
                inner.account_quotas.insert(
                    charge.account_id,
                    AccountQuota {
                        account_id: charge.account_id,
                        used_quota: charge.amount,
                        total_quota: default_total,
                    },
                );
            }
        }
        let record = SettlementRecord {
            id: Uuid::new_v4(),
            account_id: charge.account_id,
            forwarding_id: charge.forwarding_id,
            amount: charge.amount,
            itemized_funds: charge.itemized_funds.clone(),
            created_at: Utc::now(),
        };
        inner.settlements.push(record);
        Ok(ChargeOutcome::Charged)
    }

    async fn apply_settlement(
        &self,
        account_id: Uuid,
        amount: Decimal,
        default_total: Decimal,
        workflow_run_id: Option<&str>,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        match inner.account_quotas.get_mut(&account_id) {
            Some(quota) => quota.used_quota += amount,
            None => {
                inner.account_quotas.insert(
                    account_id,
                    AccountQuota {
                        account_id,
                        used_quota: amount,
                        total_quota: default_total,
                    },
                );
            }
        }
        if let Some(run_id) = workflow_run_id {
            if let Some(api_key_id) = inner.run_joins.get(run_id).copied() {
                if let Some(key) = inner.api_key_quotas.get_mut(&api_key_id) {
                    key.accumulated_quota += amount;
                    key.day_used_quota += amount;
                    key.month_used_quota += amount;
                }
            }
        }
        Ok(())
    }

    async fn create_api_key_quota(
        &self,
        api_key_id: Uuid,
        description: &str,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        inner.api_key_quotas.insert(
            api_key_id,
            ApiKeyQuota {
                api_key_id,
                description: description.to_string(),
                accumulated_quota: Decimal::ZERO,
                day_used_quota: Decimal::ZERO,
                month_used_quota: Decimal::ZERO,
                day_limit_quota: Decimal::NEGATIVE_ONE,
                month_limit_quota: Decimal::NEGATIVE_ONE,
                soft_deleted: false,
            },
        );
        Ok(())
    }

    async fn soft_delete_api_key_quota(&self, api_key_id: Uuid) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        if let Some(key) = inner.api_key_quotas.get_mut(&api_key_id) {
            key.soft_deleted = true;
        }
        Ok(())
    }

    async fn account_exists(&self, account_id: Uuid) -> Result<bool, StorageError> {
        let inner = self.inner.lock().await;
        Ok(inner.accounts.contains(&account_id))
    }

    async fn latest_account_for_end_user(
        &self,
        end_user_id: Uuid,
    ) -> Result<Option<Uuid>, StorageError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .end_user_joins
            .iter()
            .filter(|j| j.end_user_id == end_user_id)
            .max_by_key(|j| j.created_at)
            .map(|j| j.account_id))
    }
}

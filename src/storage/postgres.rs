use async_trait::async_trait;
use deadpool_postgres::{Config, Pool, Runtime};
use rust_decimal::Decimal;
use serde_json::Value;
use tokio_postgres::{NoTls, Row};
use tracing::info;
use uuid::Uuid;

use super::models::{
    AccountQuota, ApiKeyQuota, ContentKind, ForwardingAddress, ForwardingRoute, RelayCharge,
};
use super::{ChargeOutcome, Storage, StorageError};

/// Tables the gateway owns outright plus minimal definitions of the shared
/// platform tables it reads. `IF NOT EXISTS` keeps this a no-op on databases
/// the platform already migrated.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS accounts (
    id UUID PRIMARY KEY,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS access_tokens (
    token_hash TEXT PRIMARY KEY,
    account_id UUID NOT NULL,
    active BOOLEAN NOT NULL DEFAULT TRUE
);

CREATE TABLE IF NOT EXISTS forwarding_routes (
    id UUID PRIMARY KEY,
    path_prefix TEXT NOT NULL UNIQUE,
    downstream_address TEXT NOT NULL,
    extra_headers JSONB NOT NULL DEFAULT '[]',
    description TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS forwarding_addresses (
    id UUID PRIMARY KEY,
    forwarding_id UUID NOT NULL,
    sub_path TEXT NOT NULL,
    enabled_models JSONB NOT NULL DEFAULT '[]',
    active BOOLEAN NOT NULL DEFAULT TRUE,
    content_kind TEXT NOT NULL DEFAULT 'none',
    billing_rules JSONB NOT NULL DEFAULT '[]',
    description TEXT NOT NULL DEFAULT '',
    UNIQUE (forwarding_id, sub_path)
);
CREATE INDEX IF NOT EXISTS idx_forwarding_addresses_forwarding_id
    ON forwarding_addresses (forwarding_id);

CREATE TABLE IF NOT EXISTS account_quotas (
    account_id UUID PRIMARY KEY,
    used_quota NUMERIC NOT NULL DEFAULT 0,
    total_quota NUMERIC NOT NULL
);

CREATE TABLE IF NOT EXISTS api_key_quotas (
    api_key_id UUID PRIMARY KEY,
    description TEXT NOT NULL DEFAULT '',
    accumulated_quota NUMERIC NOT NULL DEFAULT 0,
    day_used_quota NUMERIC NOT NULL DEFAULT 0,
    month_used_quota NUMERIC NOT NULL DEFAULT 0,
    day_limit_quota NUMERIC NOT NULL DEFAULT -1,
    month_limit_quota NUMERIC NOT NULL DEFAULT -1,
    soft_deleted BOOLEAN NOT NULL DEFAULT FALSE
);

CREATE TABLE IF NOT EXISTS end_user_account_joins (
    id UUID PRIMARY KEY,
    end_user_id UUID NOT NULL,
    account_id UUID NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE INDEX IF NOT EXISTS idx_end_user_account_joins_end_user
    ON end_user_account_joins (end_user_id, created_at DESC);

CREATE TABLE IF NOT EXISTS api_key_run_joins (
    workflow_run_id TEXT PRIMARY KEY,
    api_key_id UUID NOT NULL
);

CREATE TABLE IF NOT EXISTS settlement_records (
    id UUID PRIMARY KEY,
    account_id UUID NOT NULL,
    forwarding_id UUID NOT NULL,
    amount NUMERIC NOT NULL,
    itemized_funds JSONB NOT NULL DEFAULT '{}',
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE INDEX IF NOT EXISTS idx_settlement_records_account
    ON settlement_records (account_id, created_at DESC);
"#;

/// PostgreSQL backend over a deadpool connection pool.
pub struct PgStorage {
    pool: Pool,
}

impl PgStorage {
    /// Create the pool and bootstrap the schema.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let mut cfg = Config::new();
        cfg.url = Some(database_url.to_string());
        let pool = cfg.create_pool(Some(Runtime::Tokio1), NoTls)?;
        let storage = Self { pool };
        storage.ensure_schema().await?;
        info!("database connection pool created");
        Ok(storage)
    }

    async fn client(&self) -> Result<deadpool_postgres::Client, StorageError> {
        Ok(self.pool.get().await?)
    }

    async fn ensure_schema(&self) -> Result<(), StorageError> {
        let client = self.client().await?;
        client.batch_execute(SCHEMA).await?;
        Ok(())
    }
}

// ---- Row mapping ----

fn route_from_row(row: &Row) -> Result<ForwardingRoute, StorageError> {
    let raw_headers: Value = row.get("extra_headers");
    let extra_headers = serde_json::from_value(raw_headers)
        .map_err(|e| StorageError::Corrupt(format!("extra_headers: {e}")))?;
    Ok(ForwardingRoute {
        id: row.get("id"),
        path_prefix: row.get("path_prefix"),
        downstream_address: row.get("downstream_address"),
        extra_headers,
        description: row.get("description"),
    })
}

fn address_from_row(row: &Row) -> Result<ForwardingAddress, StorageError> {
    let raw_models: Value = row.get("enabled_models");
    let enabled_models = serde_json::from_value(raw_models)
        .map_err(|e| StorageError::Corrupt(format!("enabled_models: {e}")))?;
    let raw_rules: Value = row.get("billing_rules");
    let billing_rules = serde_json::from_value(raw_rules)
        .map_err(|e| StorageError::Corrupt(format!("billing_rules: {e}")))?;
    let kind: String = row.get("content_kind");
    Ok(ForwardingAddress {
        id: row.get("id"),
        forwarding_id: row.get("forwarding_id"),
        sub_path: row.get("sub_path"),
        enabled_models,
        active: row.get("active"),
        content_kind: ContentKind::parse(&kind),
        billing_rules,
        description: row.get("description"),
    })
}

fn account_quota_from_row(row: &Row) -> AccountQuota {
    AccountQuota {
        account_id: row.get("account_id"),
        used_quota: row.get("used_quota"),
        total_quota: row.get("total_quota"),
    }
}

fn api_key_quota_from_row(row: &Row) -> ApiKeyQuota {
    ApiKeyQuota {
        api_key_id: row.get("api_key_id"),
        description: row.get("description"),
        accumulated_quota: row.get("accumulated_quota"),
        day_used_quota: row.get("day_used_quota"),
        month_used_quota: row.get("month_used_quota"),
        day_limit_quota: row.get("day_limit_quota"),
        month_limit_quota: row.get("month_limit_quota"),
        soft_deleted: row.get("soft_deleted"),
    }
}

#[async_trait]
impl Storage for PgStorage {
    async fn route_by_prefix(
        &self,
        path_prefix: &str,
    ) -> Result<Option<ForwardingRoute>, StorageError> {
        let client = self.client().await?;
        let row = client
            .query_opt(
                "SELECT id, path_prefix, downstream_address, extra_headers, description
                 FROM forwarding_routes WHERE path_prefix = $1",
                &[&path_prefix],
            )
            .await?;
        row.as_ref().map(route_from_row).transpose()
    }

    async fn address_for(
        &self,
        forwarding_id: Uuid,
        sub_path: &str,
    ) -> Result<Option<ForwardingAddress>, StorageError> {
        let client = self.client().await?;
        let row = client
            .query_opt(
                "SELECT id, forwarding_id, sub_path, enabled_models, active, content_kind,
                        billing_rules, description
                 FROM forwarding_addresses
                 WHERE forwarding_id = $1 AND sub_path = $2 AND active",
                &[&forwarding_id, &sub_path],
            )
            .await?;
        row.as_ref().map(address_from_row).transpose()
    }

    async fn account_for_token(&self, token_hash: &str) -> Result<Option<Uuid>, StorageError> {
        let client = self.client().await?;
        let row = client
            .query_opt(
                "SELECT account_id FROM access_tokens WHERE token_hash = $1 AND active",
                &[&token_hash],
            )
            .await?;
        Ok(row.map(|r| r.get("account_id")))
    }

    async fn account_quota(&self, account_id: Uuid) -> Result<Option<AccountQuota>, StorageError> {
        let client = self.client().await?;
        let row = client
            .query_opt(
                "SELECT account_id, used_quota, total_quota
                 FROM account_quotas WHERE account_id = $1",
                &[&account_id],
            )
            .await?;
        Ok(row.as_ref().map(account_quota_from_row))
    }

    async fn api_key_quota(&self, api_key_id: Uuid) -> Result<Option<ApiKeyQuota>, StorageError> {
        let client = self.client().await?;
        let row = client
            .query_opt(
                "SELECT api_key_id, description, accumulated_quota, day_used_quota,
                        month_used_quota, day_limit_quota, month_limit_quota, soft_deleted
                 FROM api_key_quotas WHERE api_key_id = $1",
                &[&api_key_id],
            )
            .await?;
        Ok(row.as_ref().map(api_key_quota_from_row))
    }

    async fn charge_relay(
        &self,
        charge: &RelayCharge,
        default_total: Decimal,
    ) -> Result<ChargeOutcome, StorageError> {
        let mut client = self.client().await?;
        let tx = client.transaction().await?;

        // Single conditional update: the balance check and the debit are one
        // statement, so concurrent charges cannot race past the limit.
        let updated = tx
            .execute(
                "UPDATE account_quotas
                 SET used_quota = used_quota + $2
                 WHERE account_id = $1 AND used_quota + $2 <= total_quota",
                &[&charge.account_id, &charge.amount],
            )
            .await?;

        if updated == 0 {
            if charge.amount > default_total {
                return Ok(ChargeOutcome::InsufficientBalance);
            }
            // First use provisions the quota row. A concurrent provision
            // loses the insert and retries the conditional update once.
            let inserted = tx
                .execute(
                    "INSERT INTO account_quotas (account_id, used_quota, total_quota)
                     VALUES ($1, $2, $3)
                     ON CONFLICT (account_id) DO NOTHING",
                    &[&charge.account_id, &charge.amount, &default_total],
                )
                .await?;
            if inserted == 0 {
                let retried = tx
                    .execute(
                        "UPDATE account_quotas
                         SET used_quota = used_quota + $2
                         WHERE account_id = $1 AND used_quota + $2 <= total_quota",
                        &[&charge.account_id, &charge.amount],
                    )
                    .await?;
                if retried == 0 {
                    return Ok(ChargeOutcome::InsufficientBalance);
                }
            }
        }

        tx.execute(
            "INSERT INTO settlement_records (id, account_id, forwarding_id, amount, itemized_funds)
             VALUES ($1, $2, $3, $4, $5)",
            &[
                &Uuid::new_v4(),
                &charge.account_id,
                &charge.forwarding_id,
                &charge.amount,
                &charge.itemized_funds,
            ],
        )
        .await?;

        tx.commit().await?;
        Ok(ChargeOutcome::Charged)
    }

    async fn apply_settlement(
        &self,
        account_id: Uuid,
        amount: Decimal,
        default_total: Decimal,
        workflow_run_id: Option<&str>,
    ) -> Result<(), StorageError> {
        let mut client = self.client().await?;
        let tx = client.transaction().await?;

        let updated = tx
            .execute(
                "UPDATE account_quotas SET used_quota = used_quota + $2 WHERE account_id = $1",
                &[&account_id, &amount],
            )
            .await?;
        if updated == 0 {
            tx.execute(
                "INSERT INTO account_quotas (account_id, used_quota, total_quota)
                 VALUES ($1, $2, $3)
                 ON CONFLICT (account_id)
                 DO UPDATE SET used_quota = account_quotas.used_quota + EXCLUDED.used_quota",
                &[&account_id, &amount, &default_total],
            )
            .await?;
        }

        if let Some(run_id) = workflow_run_id {
            let join = tx
                .query_opt(
                    "SELECT api_key_id FROM api_key_run_joins WHERE workflow_run_id = $1",
                    &[&run_id],
                )
                .await?;
            if let Some(row) = join {
                let api_key_id: Uuid = row.get("api_key_id");
                tx.execute(
                    "UPDATE api_key_quotas
                     SET accumulated_quota = accumulated_quota + $2,
                         day_used_quota = day_used_quota + $2,
                         month_used_quota = month_used_quota + $2
                     WHERE api_key_id = $1",
                    &[&api_key_id, &amount],
                )
                .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn create_api_key_quota(
        &self,
        api_key_id: Uuid,
        description: &str,
    ) -> Result<(), StorageError> {
        let client = self.client().await?;
        client
            .execute(
                "INSERT INTO api_key_quotas (api_key_id, description)
                 VALUES ($1, $2)
                 ON CONFLICT (api_key_id) DO NOTHING",
                &[&api_key_id, &description],
            )
            .await?;
        Ok(())
    }

    async fn soft_delete_api_key_quota(&self, api_key_id: Uuid) -> Result<(), StorageError> {
        let client = self.client().await?;
        client
            .execute(
                "UPDATE api_key_quotas SET soft_deleted = TRUE WHERE api_key_id = $1",
                &[&api_key_id],
            )
            .await?;
        Ok(())
    }

    async fn account_exists(&self, account_id: Uuid) -> Result<bool, StorageError> {
        let client = self.client().await?;
        let row = client
            .query_opt("SELECT 1 FROM accounts WHERE id = $1", &[&account_id])
            .await?;
        Ok(row.is_some())
    }

    async fn latest_account_for_end_user(
        &self,
        end_user_id: Uuid,
    ) -> Result<Option<Uuid>, StorageError> {
        let client = self.client().await?;
        let row = client
            .query_opt(
                "SELECT account_id FROM end_user_account_joins
                 WHERE end_user_id = $1
                 ORDER BY created_at DESC
                 LIMIT 1",
                &[&end_user_id],
            )
            .await?;
        Ok(row.map(|r| r.get("account_id")))
    }
}

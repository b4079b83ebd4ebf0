use std::sync::Arc;

use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::ledger::Ledger;
use super::payer::PayerResolver;
use super::retry::{run_with_retry, RetryPolicy};
use super::rules::as_decimal;
use crate::storage::StorageError;

/// Node type that carries LLM usage worth settling.
pub const LLM_NODE_TYPE: &str = "llm";

const DEFAULT_CURRENCY: &str = "USD";

/// Completed node-execution record as delivered by the workflow engine.
///
/// `outputs` arrives either as a JSON object or as a JSON-encoded string;
/// both carry the same `usage` shape.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeExecutionRecord {
    pub id: String,
    pub node_type: String,
    pub created_by: String,
    pub created_by_role: String,
    #[serde(default)]
    pub workflow_run_id: Option<String>,
    #[serde(default)]
    pub outputs: Value,
}

#[derive(Debug, thiserror::Error)]
pub enum SettlementError {
    #[error("malformed execution record: {0}")]
    Malformed(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl SettlementError {
    /// Storage failures are worth retrying; a malformed record never fixes
    /// itself on redelivery.
    pub fn is_transient(&self) -> bool {
        matches!(self, SettlementError::Storage(_))
    }
}

#[derive(Debug, PartialEq)]
pub enum SettleOutcome {
    SkippedNodeType,
    NothingToCharge,
    Settled { account_id: Uuid, amount: Decimal },
}

struct Usage {
    total_price: Decimal,
    currency: String,
}

/// Consumes execution records off the intake queue and reconciles their cost
/// into the quota ledger.
pub struct SettlementWorker {
    ledger: Arc<Ledger>,
    payer: PayerResolver,
    base_currency: String,
    exchange_rate: Decimal,
    policy: RetryPolicy,
}

impl SettlementWorker {
    pub fn new(
        ledger: Arc<Ledger>,
        payer: PayerResolver,
        base_currency: String,
        exchange_rate: Decimal,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            ledger,
            payer,
            base_currency,
            exchange_rate,
            policy,
        }
    }

    /// Spawn the worker loop and hand back the intake side of the queue.
    /// The loop ends when every sender is dropped.
    pub fn start(self, queue_capacity: usize) -> mpsc::Sender<NodeExecutionRecord> {
        let (tx, mut rx) = mpsc::channel::<NodeExecutionRecord>(queue_capacity);
        tokio::spawn(async move {
            info!("settlement worker started");
            while let Some(record) = rx.recv().await {
                self.process(record).await;
            }
            info!("settlement worker stopped");
        });
        tx
    }

    async fn process(&self, record: NodeExecutionRecord) {
        let result = run_with_retry(
            self.policy,
            |_| self.settle(&record),
            SettlementError::is_transient,
            |e| {
                error!(
                    execution_id = %record.id,
                    error = %e,
                    "settlement retries exhausted, dropping record"
                );
            },
        )
        .await;

        match result {
            Ok(SettleOutcome::Settled { account_id, amount }) => {
                info!(
                    execution_id = %record.id,
                    account_id = %account_id,
                    amount = %amount,
                    "usage settled"
                );
            }
            Ok(SettleOutcome::SkippedNodeType) => {
                debug!(
                    execution_id = %record.id,
                    node_type = %record.node_type,
                    "skipping non-llm execution"
                );
            }
            Ok(SettleOutcome::NothingToCharge) => {
                debug!(execution_id = %record.id, "nothing to charge");
            }
            // The exhaustion hook already reported transient failures.
            Err(e) if e.is_transient() => {}
            Err(e) => {
                error!(
                    execution_id = %record.id,
                    error = %e,
                    "dropping malformed execution record"
                );
            }
        }
    }

    /// Settle one record. Redelivering the same record charges again;
    /// deduplication is the producer's job.
    pub async fn settle(
        &self,
        record: &NodeExecutionRecord,
    ) -> Result<SettleOutcome, SettlementError> {
        if record.node_type != LLM_NODE_TYPE {
            return Ok(SettleOutcome::SkippedNodeType);
        }

        let usage = match extract_usage(&record.outputs)? {
            Some(usage) => usage,
            None => return Ok(SettleOutcome::NothingToCharge),
        };
        if usage.total_price.is_zero() {
            return Ok(SettleOutcome::NothingToCharge);
        }

        let amount = if usage.currency != self.base_currency {
            usage.total_price / self.exchange_rate
        } else {
            usage.total_price
        };

        let actor_id = Uuid::parse_str(&record.created_by)
            .map_err(|e| SettlementError::Malformed(format!("created_by: {e}")))?;
        let payer = self
            .payer
            .resolve_payer(actor_id, &record.created_by_role)
            .await?;

        self.ledger
            .settle_usage(payer, amount, record.workflow_run_id.as_deref())
            .await?;
        Ok(SettleOutcome::Settled {
            account_id: payer,
            amount,
        })
    }
}

fn extract_usage(outputs: &Value) -> Result<Option<Usage>, SettlementError> {
    let decoded;
    let outputs = match outputs {
        Value::String(raw) => {
            decoded = serde_json::from_str::<Value>(raw)
                .map_err(|e| SettlementError::Malformed(format!("outputs: {e}")))?;
            &decoded
        }
        other => other,
    };

    let usage = match outputs.get("usage") {
        Some(usage) => usage,
        None => return Ok(None),
    };
    let total_price = match usage.get("total_price") {
        None | Some(Value::Null) => Decimal::ZERO,
        Some(value) => as_decimal(value)
            .map_err(|_| SettlementError::Malformed(format!("usage.total_price: {value}")))?,
    };
    let currency = usage
        .get("currency")
        .and_then(Value::as_str)
        .unwrap_or(DEFAULT_CURRENCY)
        .to_string();

    Ok(Some(Usage {
        total_price,
        currency,
    }))
}

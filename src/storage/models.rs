use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::billing::rules::BillingRule;

/// Routing table entry: maps an inbound path prefix to a downstream base
/// address. Read-mostly, cached by the registry as an immutable snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardingRoute {
    pub id: Uuid,
    pub path_prefix: String,
    pub downstream_address: String,
    /// Static headers merged onto every relayed request, stored as
    /// `[["name", "value"], ...]`.
    pub extra_headers: Vec<(String, String)>,
    pub description: String,
}

/// Declared content type of a forwarding address, driving how the request
/// body is folded into the billing payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContentKind {
    None,
    Form,
    UrlEncoded,
    Raw,
    Json,
    Html,
    Xml,
}

impl ContentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentKind::None => "none",
            ContentKind::Form => "form",
            ContentKind::UrlEncoded => "url-encoded",
            ContentKind::Raw => "raw",
            ContentKind::Json => "json",
            ContentKind::Html => "html",
            ContentKind::Xml => "xml",
        }
    }

    /// Lenient parse for values coming out of storage; unknown labels fall
    /// back to `None` (body left out of the billing payload).
    pub fn parse(s: &str) -> ContentKind {
        match s {
            "form" => ContentKind::Form,
            "url-encoded" => ContentKind::UrlEncoded,
            "raw" => ContentKind::Raw,
            "json" => ContentKind::Json,
            "html" => ContentKind::Html,
            "xml" => ContentKind::Xml,
            _ => ContentKind::None,
        }
    }
}

/// A billable sub-route under a [`ForwardingRoute`]. Unique on
/// `(forwarding_id, sub_path)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardingAddress {
    pub id: Uuid,
    pub forwarding_id: Uuid,
    pub sub_path: String,
    pub enabled_models: Vec<String>,
    pub active: bool,
    pub content_kind: ContentKind,
    pub billing_rules: Vec<BillingRule>,
    pub description: String,
}

/// Account-level spend ledger row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountQuota {
    pub account_id: Uuid,
    pub used_quota: Decimal,
    pub total_quota: Decimal,
}

impl AccountQuota {
    /// Admission check used by the platform before accepting new work.
    pub fn exhausted(&self) -> bool {
        self.used_quota >= self.total_quota
    }
}

/// API-key-level spend counters. Day/month limits of `-1` mean unlimited;
/// settlement increments counters without checking them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiKeyQuota {
    pub api_key_id: Uuid,
    pub description: String,
    pub accumulated_quota: Decimal,
    pub day_used_quota: Decimal,
    pub month_used_quota: Decimal,
    pub day_limit_quota: Decimal,
    pub month_limit_quota: Decimal,
    pub soft_deleted: bool,
}

impl ApiKeyQuota {
    /// Admission check for keyed traffic: under both the daily and monthly
    /// limit, negative limits meaning unlimited.
    pub fn within_limits(&self) -> bool {
        let day_ok =
            self.day_limit_quota < Decimal::ZERO || self.day_used_quota < self.day_limit_quota;
        let month_ok = self.month_limit_quota < Decimal::ZERO
            || self.month_used_quota < self.month_limit_quota;
        day_ok && month_ok
    }
}

/// A successfully priced relay request, written to the ledger and the audit
/// trail in one storage call.
#[derive(Debug, Clone)]
pub struct RelayCharge {
    pub account_id: Uuid,
    pub forwarding_id: Uuid,
    pub amount: Decimal,
    pub itemized_funds: Value,
}

/// Append-only audit row recording one settled relay request.
#[derive(Debug, Clone)]
pub struct SettlementRecord {
    pub id: Uuid,
    pub account_id: Uuid,
    pub forwarding_id: Uuid,
    pub amount: Decimal,
    pub itemized_funds: Value,
    pub created_at: DateTime<Utc>,
}

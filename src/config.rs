use std::time::Duration;

use rust_decimal::Decimal;
use serde::Deserialize;

use crate::billing::retry::RetryPolicy;

/// Service configuration, deserialized from YAML. Every knob has a default
/// so a missing or partial file still yields a runnable (memory-backed)
/// service.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub bind_address: String,
    pub storage: StorageSettings,
    pub billing: BillingSettings,
    pub cache: CacheSettings,
    pub settlement: SettlementSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8882".to_string(),
            storage: StorageSettings::default(),
            billing: BillingSettings::default(),
            cache: CacheSettings::default(),
            settlement: SettlementSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub backend: StorageBackend,
    pub connection_string: Option<String>,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            connection_string: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BillingSettings {
    /// Total quota provisioned when an account is charged for the first time.
    pub default_total_quota: Decimal,
    pub base_currency: String,
    /// Divisor applied to prices reported in any other currency.
    pub exchange_rate: Decimal,
}

impl Default for BillingSettings {
    fn default() -> Self {
        Self {
            default_total_quota: Decimal::from(15),
            base_currency: "USD".to_string(),
            exchange_rate: Decimal::new(73, 1),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub route_ttl_secs: u64,
    pub payer_ttl_secs: u64,
    pub auth_ttl_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            route_ttl_secs: 600,
            payer_ttl_secs: 3600,
            auth_ttl_secs: 60,
        }
    }
}

impl CacheSettings {
    pub fn route_ttl(&self) -> Duration {
        Duration::from_secs(self.route_ttl_secs)
    }

    pub fn payer_ttl(&self) -> Duration {
        Duration::from_secs(self.payer_ttl_secs)
    }

    pub fn auth_ttl(&self) -> Duration {
        Duration::from_secs(self.auth_ttl_secs)
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct SettlementSettings {
    pub max_retries: u32,
    pub retry_delay_secs: u64,
    pub queue_capacity: usize,
}

impl Default for SettlementSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_secs: 60,
            queue_capacity: 10_000,
        }
    }
}

impl SettlementSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, Duration::from_secs(self.retry_delay_secs))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rust_decimal_macros::dec;

    use super::*;

    #[test]
    fn empty_document_yields_full_defaults() {
        let settings: Settings = serde_yaml::from_str("{}").unwrap();

        assert_eq!(settings.bind_address, "0.0.0.0:8882");
        assert_eq!(settings.storage.backend, StorageBackend::Memory);
        assert_eq!(settings.billing.default_total_quota, dec!(15));
        assert_eq!(settings.billing.base_currency, "USD");
        assert_eq!(settings.billing.exchange_rate, dec!(7.3));
        assert_eq!(settings.cache.route_ttl_secs, 600);
        assert_eq!(settings.cache.payer_ttl_secs, 3600);
        assert_eq!(settings.cache.auth_ttl_secs, 60);
        assert_eq!(settings.settlement.max_retries, 3);
        assert_eq!(settings.settlement.retry_delay_secs, 60);
        assert_eq!(settings.settlement.queue_capacity, 10_000);
    }

    #[test]
    fn partial_overrides_keep_the_rest() {
        let yaml = r#"
storage:
  backend: postgres
  connection_string: "postgresql://localhost/tollgate"
billing:
  default_total_quota: "20"
"#;
        let settings: Settings = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(settings.storage.backend, StorageBackend::Postgres);
        assert_eq!(
            settings.storage.connection_string.as_deref(),
            Some("postgresql://localhost/tollgate")
        );
        assert_eq!(settings.billing.default_total_quota, dec!(20));
        assert_eq!(settings.billing.exchange_rate, dec!(7.3));
        assert_eq!(settings.bind_address, "0.0.0.0:8882");
    }

    #[test]
    fn decimals_parse_from_strings_and_numbers() {
        let quoted: BillingSettings =
            serde_yaml::from_str(r#"{ exchange_rate: "6.5" }"#).unwrap();
        assert_eq!(quoted.exchange_rate, dec!(6.5));

        let bare: BillingSettings = serde_yaml::from_str("{ exchange_rate: 6.5 }").unwrap();
        assert_eq!(bare.exchange_rate, dec!(6.5));
    }

    #[test]
    fn duration_helpers_reflect_the_raw_seconds() {
        let settings = Settings::default();
        assert_eq!(settings.cache.route_ttl(), Duration::from_secs(600));
        assert_eq!(settings.settlement.retry_policy().max_retries, 3);
        assert_eq!(
            settings.settlement.retry_policy().delay,
            Duration::from_secs(60)
        );
    }
}

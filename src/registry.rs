use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use tracing::debug;
use uuid::Uuid;

use crate::storage::models::{ForwardingAddress, ForwardingRoute};
use crate::storage::{Storage, StorageError};

/// TTL-based lookup cache in front of the forwarding tables.
///
/// Entries are detached snapshots of the stored rows, never live database
/// handles. Misses are cached as `None` for the same TTL so unknown prefixes
/// do not hammer storage. The read path never invalidates on write; edits
/// become visible once the TTL elapses.
#[derive(Clone)]
pub struct RouteRegistry {
    storage: Arc<dyn Storage>,
    routes: Cache<String, Option<Arc<ForwardingRoute>>>,
    addresses: Cache<String, Option<Arc<ForwardingAddress>>>,
}

impl RouteRegistry {
    pub fn new(storage: Arc<dyn Storage>, ttl: Duration) -> Self {
        let routes = Cache::builder()
            .max_capacity(10_000)
            .time_to_live(ttl)
            .build();
        let addresses = Cache::builder()
            .max_capacity(10_000)
            .time_to_live(ttl)
            .build();
        Self {
            storage,
            routes,
            addresses,
        }
    }

    /// Cache key for a billing address lookup.
    pub fn address_key(forwarding_id: Uuid, sub_path: &str) -> String {
        format!("{}_{}", forwarding_id, sub_path)
    }

    /// Route registered for the first path segment, if any.
    pub async fn resolve(
        &self,
        path_prefix: &str,
    ) -> Result<Option<Arc<ForwardingRoute>>, StorageError> {
        if let Some(cached) = self.routes.get(path_prefix).await {
            return Ok(cached);
        }

        let loaded = self
            .storage
            .route_by_prefix(path_prefix)
            .await?
            .map(Arc::new);
        if loaded.is_none() {
            debug!(path_prefix, "no forwarding route registered");
        }
        self.routes
            .insert(path_prefix.to_string(), loaded.clone())
            .await;
        Ok(loaded)
    }

    /// Active billing address for `(forwarding_id, sub_path)`, if one exists.
    pub async fn resolve_address(
        &self,
        forwarding_id: Uuid,
        sub_path: &str,
    ) -> Result<Option<Arc<ForwardingAddress>>, StorageError> {
        let key = Self::address_key(forwarding_id, sub_path);
        if let Some(cached) = self.addresses.get(&key).await {
            return Ok(cached);
        }

        let loaded = self
            .storage
            .address_for(forwarding_id, sub_path)
            .await?
            .map(Arc::new);
        if loaded.is_none() {
            debug!(%forwarding_id, sub_path, "no billing address for sub path");
        }
        self.addresses.insert(key, loaded.clone()).await;
        Ok(loaded)
    }
}

use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use uuid::Uuid;

use crate::storage::{Storage, StorageError};

/// Role whose usage is billed to an owning account rather than to itself.
pub const END_USER_ROLE: &str = "end_user";

/// Maps the actor that produced usage to the account that pays for it.
///
/// Anything other than an end user pays for itself, no cache involved. End
/// users resolve through a TTL cache; every resolution path writes its result
/// back before returning, the fallback included.
#[derive(Clone)]
pub struct PayerResolver {
    storage: Arc<dyn Storage>,
    cache: Cache<Uuid, Uuid>,
}

impl PayerResolver {
    pub fn new(storage: Arc<dyn Storage>, ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(10_000)
            .time_to_live(ttl)
            .build();
        Self { storage, cache }
    }

    pub async fn resolve_payer(
        &self,
        actor_id: Uuid,
        actor_role: &str,
    ) -> Result<Uuid, StorageError> {
        if actor_role != END_USER_ROLE {
            return Ok(actor_id);
        }

        if let Some(payer) = self.cache.get(&actor_id).await {
            return Ok(payer);
        }

        let payer = if self.storage.account_exists(actor_id).await? {
            actor_id
        } else if let Some(account) = self.storage.latest_account_for_end_user(actor_id).await? {
            account
        } else {
            actor_id
        };
        self.cache.insert(actor_id, payer).await;
        Ok(payer)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::storage::memory::MemoryStorage;

    #[tokio::test]
    async fn non_end_users_pay_for_themselves() {
        let storage = Arc::new(MemoryStorage::new());
        let actor = Uuid::new_v4();
        let owner = Uuid::new_v4();
        // A join exists, but only the end-user role consults it.
        storage.link_end_user(actor, owner, Utc::now()).await;

        let resolver = PayerResolver::new(storage, Duration::from_secs(3600));
        assert_eq!(resolver.resolve_payer(actor, "account").await.unwrap(), actor);
    }

    #[tokio::test]
    async fn end_user_that_is_an_account_pays_for_itself() {
        let storage = Arc::new(MemoryStorage::new());
        let actor = Uuid::new_v4();
        storage.add_account(actor).await;

        let resolver = PayerResolver::new(storage, Duration::from_secs(3600));
        assert_eq!(
            resolver.resolve_payer(actor, END_USER_ROLE).await.unwrap(),
            actor
        );
    }

    #[tokio::test]
    async fn end_user_resolves_through_the_join_table() {
        let storage = Arc::new(MemoryStorage::new());
        let actor = Uuid::new_v4();
        let owner = Uuid::new_v4();
        storage.link_end_user(actor, owner, Utc::now()).await;

        let resolver = PayerResolver::new(storage, Duration::from_secs(3600));
        assert_eq!(
            resolver.resolve_payer(actor, END_USER_ROLE).await.unwrap(),
            owner
        );
    }

    #[tokio::test]
    async fn unlinked_end_user_falls_back_to_itself() {
        let storage = Arc::new(MemoryStorage::new());
        let actor = Uuid::new_v4();

        let resolver = PayerResolver::new(storage, Duration::from_secs(3600));
        assert_eq!(
            resolver.resolve_payer(actor, END_USER_ROLE).await.unwrap(),
            actor
        );
    }

    #[tokio::test]
    async fn fallback_resolutions_are_cached_as_well() {
        let storage = Arc::new(MemoryStorage::new());
        let actor = Uuid::new_v4();
        let owner = Uuid::new_v4();

        let resolver = PayerResolver::new(storage.clone(), Duration::from_secs(3600));
        assert_eq!(
            resolver.resolve_payer(actor, END_USER_ROLE).await.unwrap(),
            actor
        );

        // A join created after the first resolution stays invisible until
        // the cache entry expires.
        storage.link_end_user(actor, owner, Utc::now()).await;
        assert_eq!(
            resolver.resolve_payer(actor, END_USER_ROLE).await.unwrap(),
            actor
        );
    }
}

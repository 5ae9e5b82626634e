// =============================================================================
// Credential Store Client — cached reads of users and venue credentials
// =============================================================================
//
// Fronts the external datastore with a short-TTL cache. Misses are cached too
// (with a shorter TTL) so that a burst of probing traffic with invalid
// secrets does not hammer the datastore. `invalidate` forces a fresh read on
// the next lookup.
// =============================================================================

use crate::cache::TtlCache;
use crate::datastore::{Datastore, User, VenueCredential};
use crate::types::{UserId, Venue};
use std::sync::Arc;
use std::time::Duration;
use tracing::{instrument, warn};

const SECRET_CACHE_TTL: Duration = Duration::from_secs(30);
const SECRET_NEGATIVE_TTL: Duration = Duration::from_secs(5);
const CREDENTIAL_CACHE_TTL: Duration = Duration::from_secs(60);
const CREDENTIAL_NEGATIVE_TTL: Duration = Duration::from_secs(5);

/// Result of resolving a webhook secret to a user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecretLookup {
    Found(UserId),
    NotFound,
    Inactive,
}

pub struct CredentialStore {
    datastore: Arc<dyn Datastore>,
    users_by_secret: TtlCache<String, SecretLookup>,
    user_by_id: TtlCache<UserId, User>,
    credentials: TtlCache<(UserId, Venue), Option<VenueCredential>>,
    legacy_webhook_secret: Option<String>,
}

impl CredentialStore {
    pub fn new(datastore: Arc<dyn Datastore>, legacy_webhook_secret: Option<String>) -> Self {
        Self {
            datastore,
            users_by_secret: TtlCache::new(SECRET_CACHE_TTL),
            user_by_id: TtlCache::new(CREDENTIAL_CACHE_TTL),
            credentials: TtlCache::new(CREDENTIAL_CACHE_TTL),
            legacy_webhook_secret,
        }
    }

    /// Resolve a webhook secret to an active user, consulting cache first.
    #[instrument(skip(self, secret), name = "credentials::lookup_user_by_secret")]
    pub async fn lookup_user_by_secret(&self, secret: &str) -> anyhow::Result<Option<User>> {
        if let Some(cached) = self.users_by_secret.get(&secret.to_string()) {
            return Ok(self.resolve_cached_lookup(cached));
        }

        match self.datastore.find_user_by_secret(secret).await? {
            Some(user) if user.active => {
                self.users_by_secret
                    .put(secret.to_string(), SecretLookup::Found(user.id));
                self.user_by_id.put(user.id, user.clone());
                Ok(Some(user))
            }
            Some(user) => {
                self.users_by_secret
                    .put_with_ttl(secret.to_string(), SecretLookup::Inactive, SECRET_NEGATIVE_TTL);
                self.user_by_id.put(user.id, user);
                Ok(None)
            }
            None => {
                if let Some(legacy) = &self.legacy_webhook_secret {
                    if legacy == secret {
                        warn!("webhook authenticated via legacy WEBHOOK_SECRET fallback");
                        return Ok(self.legacy_fallback_user());
                    }
                }
                self.users_by_secret.put_with_ttl(
                    secret.to_string(),
                    SecretLookup::NotFound,
                    SECRET_NEGATIVE_TTL,
                );
                Ok(None)
            }
        }
    }

    fn resolve_cached_lookup(&self, lookup: SecretLookup) -> Option<User> {
        match lookup {
            SecretLookup::Found(user_id) => self.user_by_id.get(&user_id),
            SecretLookup::NotFound | SecretLookup::Inactive => None,
        }
    }

    /// The legacy single-tenant fallback has no associated `User` row; callers
    /// that authenticate through it do not get quota/risk gating applied
    /// per-user, since there is no user to key that state on. This is a
    /// deliberate degradation, not a bug: see the Open Questions in DESIGN.md.
    fn legacy_fallback_user(&self) -> Option<User> {
        None
    }

    /// Look up a user directly by id, bypassing secret resolution. Used by
    /// copy-trading fan-out, which already knows the follower's id from a
    /// `CopyRelationship` row rather than from an incoming secret.
    #[instrument(skip(self), name = "credentials::get_user_by_id")]
    pub async fn get_user_by_id(&self, user_id: UserId) -> anyhow::Result<Option<User>> {
        if let Some(cached) = self.user_by_id.get(&user_id) {
            return Ok(Some(cached));
        }
        let user = self.datastore.find_user_by_id(user_id).await?;
        if let Some(u) = &user {
            self.user_by_id.put(user_id, u.clone());
        }
        Ok(user)
    }

    #[instrument(skip(self), name = "credentials::get_venue_credential")]
    pub async fn get_venue_credential(
        &self,
        user_id: UserId,
        venue: Venue,
    ) -> anyhow::Result<Option<VenueCredential>> {
        if let Some(cached) = self.credentials.get(&(user_id, venue)) {
            return Ok(cached);
        }

        let credential = self.datastore.get_venue_credential(user_id, venue).await?;
        match &credential {
            Some(_) => self.credentials.put((user_id, venue), credential.clone()),
            None => self
                .credentials
                .put_with_ttl((user_id, venue), None, CREDENTIAL_NEGATIVE_TTL),
        }
        Ok(credential)
    }

    pub fn invalidate(&self, user_id: UserId, venue: Venue) {
        self.credentials.invalidate(&(user_id, venue));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::InMemoryDatastore;
    use crate::types::{Environment, PlanTier};
    use std::collections::HashMap;
    use uuid::Uuid;

    fn store_with_user() -> (Arc<InMemoryDatastore>, User) {
        let datastore = Arc::new(InMemoryDatastore::new());
        let user = User {
            id: Uuid::new_v4(),
            webhook_secret: "s1".into(),
            plan: PlanTier::Basic,
            active: true,
        };
        datastore.insert_user(user.clone());
        (datastore, user)
    }

    #[tokio::test]
    async fn resolves_active_user_by_secret() {
        let (datastore, user) = store_with_user();
        let credentials = CredentialStore::new(datastore, None);
        let found = credentials.lookup_user_by_secret("s1").await.unwrap();
        assert_eq!(found.unwrap().id, user.id);
    }

    #[tokio::test]
    async fn unknown_secret_returns_none_without_legacy_fallback() {
        let (datastore, _user) = store_with_user();
        let credentials = CredentialStore::new(datastore, None);
        assert!(credentials
            .lookup_user_by_secret("bogus")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn legacy_fallback_matches_but_yields_no_user() {
        let (datastore, _user) = store_with_user();
        let credentials =
            CredentialStore::new(datastore, Some("legacy-secret".to_string()));
        let result = credentials
            .lookup_user_by_secret("legacy-secret")
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn credential_miss_is_cached_and_invalidate_clears_it() {
        let (datastore, user) = store_with_user();
        let credentials = CredentialStore::new(datastore.clone(), None);
        assert!(credentials
            .get_venue_credential(user.id, Venue::PerpDexA)
            .await
            .unwrap()
            .is_none());

        datastore.insert_credential(crate::datastore::VenueCredential {
            user_id: user.id,
            venue: Venue::PerpDexA,
            environment: Environment::Sandbox,
            fields: HashMap::new(),
        });

        // Still cached as a miss until invalidated.
        assert!(credentials
            .get_venue_credential(user.id, Venue::PerpDexA)
            .await
            .unwrap()
            .is_none());

        credentials.invalidate(user.id, Venue::PerpDexA);
        assert!(credentials
            .get_venue_credential(user.id, Venue::PerpDexA)
            .await
            .unwrap()
            .is_some());
    }
}

// =============================================================================
// Adapter Factory — resolves (user, venue) to a configured VenueAdapter
// =============================================================================
//
// Credential fields are stored as an untyped string map (see
// `datastore::VenueCredential`); this is the one place that knows how to turn
// that bag into a concrete adapter's constructor arguments. Built adapters are
// cached behind the same TTL as the credential lookup they were built from, so
// a credential rotation becomes visible within one cache lifetime of calling
// `invalidate`.
// =============================================================================

use super::equities_cash::EquitiesCashAdapter;
use super::equities_multi::EquitiesMultiAdapter;
use super::forex_broker::ForexBrokerAdapter;
use super::options_broker::OptionsBrokerAdapter;
use super::perp_dex_a::PerpDexAAdapter;
use super::perp_dex_b::PerpDexBAdapter;
use super::perp_dex_c::PerpDexCAdapter;
use super::prediction_exchange::PredictionExchangeAdapter;
use super::VenueAdapter;
use crate::cache::TtlCache;
use crate::credentials::CredentialStore;
use crate::error::AppError;
use crate::types::{Environment, UserId, Venue};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const ADAPTER_CACHE_TTL: Duration = Duration::from_secs(60);

pub struct AdapterFactory {
    credentials: Arc<CredentialStore>,
    cache: TtlCache<(UserId, Venue), Arc<dyn VenueAdapter>>,
}

impl AdapterFactory {
    pub fn new(credentials: Arc<CredentialStore>) -> Self {
        Self {
            credentials,
            cache: TtlCache::new(ADAPTER_CACHE_TTL),
        }
    }

    pub async fn get_adapter(&self, user_id: UserId, venue: Venue) -> Result<Arc<dyn VenueAdapter>, AppError> {
        if let Some(adapter) = self.cache.get(&(user_id, venue)) {
            return Ok(adapter);
        }

        let credential = self
            .credentials
            .get_venue_credential(user_id, venue)
            .await
            .map_err(crate::error::classify_adapter_error)?
            .ok_or(AppError::NotConfigured)?;

        let adapter = build_adapter(venue, credential.environment, &credential.fields)?;
        self.cache.put((user_id, venue), adapter.clone());
        Ok(adapter)
    }

    pub fn invalidate(&self, user_id: UserId, venue: Venue) {
        self.cache.invalidate(&(user_id, venue));
    }
}

fn field<'a>(fields: &'a HashMap<String, String>, key: &str) -> Result<&'a str, AppError> {
    fields
        .get(key)
        .map(|s| s.as_str())
        .filter(|s| !s.is_empty())
        .ok_or(AppError::CredentialMalformed)
}

fn default_base_url(venue: Venue, environment: Environment) -> &'static str {
    use Environment::*;
    use Venue::*;
    match (venue, environment) {
        (PerpDexA, Production) => "https://api.perpdexa.example",
        (PerpDexA, Sandbox) => "https://testnet.perpdexa.example",
        (PerpDexB, Production) => "https://api.perpdexb.example",
        (PerpDexB, Sandbox) => "https://testnet.perpdexb.example",
        (PerpDexC, Production) => "https://api.perpdexc.example",
        (PerpDexC, Sandbox) => "https://testnet.perpdexc.example",
        (ForexBroker, Production) => "https://api-fxtrade.broker.example",
        (ForexBroker, Sandbox) => "https://api-fxpractice.broker.example",
        (EquitiesCash, Production) => "https://api.equitiescash.example",
        (EquitiesCash, Sandbox) => "https://paper-api.equitiescash.example",
        (EquitiesMulti, Production) => "https://api.equitiesmulti.example",
        (EquitiesMulti, Sandbox) => "https://paper-api.equitiesmulti.example",
        (OptionsBroker, Production) => "https://api.equitiesmulti.example",
        (OptionsBroker, Sandbox) => "https://paper-api.equitiesmulti.example",
        (PredictionExchange, Production) => "https://trading-api.predictionexchange.example",
        (PredictionExchange, Sandbox) => "https://demo-api.predictionexchange.example",
    }
}

fn build_adapter(
    venue: Venue,
    environment: Environment,
    fields: &HashMap<String, String>,
) -> Result<Arc<dyn VenueAdapter>, AppError> {
    let base_url = fields
        .get("base_url")
        .map(|s| s.as_str())
        .unwrap_or_else(|| default_base_url(venue, environment))
        .to_string();

    let adapter: Arc<dyn VenueAdapter> = match venue {
        Venue::PerpDexA => Arc::new(PerpDexAAdapter::new(
            field(fields, "api_key")?,
            field(fields, "secret")?,
            base_url,
        )),
        Venue::PerpDexB => {
            let account_index: u64 = field(fields, "account_index")?
                .parse()
                .map_err(|_| AppError::CredentialMalformed)?;
            Arc::new(PerpDexBAdapter::new(account_index, field(fields, "session_key")?, base_url))
        }
        Venue::PerpDexC => Arc::new(PerpDexCAdapter::new(
            field(fields, "wallet_address")?,
            field(fields, "private_key")?,
            base_url,
        )),
        Venue::ForexBroker => Arc::new(ForexBrokerAdapter::new(
            field(fields, "account_id")?,
            field(fields, "bearer_token")?,
            base_url,
        )),
        Venue::EquitiesCash => Arc::new(EquitiesCashAdapter::new(
            field(fields, "account_id")?,
            field(fields, "bearer_token")?,
            base_url,
        )),
        Venue::EquitiesMulti => Arc::new(EquitiesMultiAdapter::new(
            field(fields, "account_id")?,
            field(fields, "api_key")?,
            field(fields, "api_secret")?,
            base_url,
        )),
        Venue::OptionsBroker => Arc::new(OptionsBrokerAdapter::new(
            field(fields, "account_id")?,
            field(fields, "api_key")?,
            field(fields, "api_secret")?,
            base_url,
        )),
        Venue::PredictionExchange => Arc::new(PredictionExchangeAdapter::new(
            field(fields, "api_key")?,
            field(fields, "private_key")?,
            base_url,
        )),
    };

    Ok(adapter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_field_is_credential_malformed() {
        let fields = HashMap::new();
        let err = build_adapter(Venue::PerpDexA, Environment::Sandbox, &fields).unwrap_err();
        assert!(matches!(err, AppError::CredentialMalformed));
    }

    #[test]
    fn builds_perp_dex_a_adapter_from_complete_fields() {
        let mut fields = HashMap::new();
        fields.insert("api_key".to_string(), "key".to_string());
        fields.insert("secret".to_string(), "secret".to_string());
        let adapter = build_adapter(Venue::PerpDexA, Environment::Sandbox, &fields).unwrap();
        assert_eq!(adapter.venue_name(), "perp_dex_a");
    }

    #[test]
    fn malformed_account_index_is_rejected() {
        let mut fields = HashMap::new();
        fields.insert("account_index".to_string(), "not-a-number".to_string());
        fields.insert("session_key".to_string(), "key".to_string());
        let err = build_adapter(Venue::PerpDexB, Environment::Sandbox, &fields).unwrap_err();
        assert!(matches!(err, AppError::CredentialMalformed));
    }

    #[test]
    fn default_base_url_differs_by_environment() {
        assert_ne!(
            default_base_url(Venue::ForexBroker, Environment::Production),
            default_base_url(Venue::ForexBroker, Environment::Sandbox)
        );
    }
}

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::RegistryError;
use crate::gateway::Gateway;
use crate::registry::currency::CurrencyRegistry;
use crate::registry::types::Currency;

/// Builds the gateway for one native currency. Invoked at most once per currency.
pub type GatewayFactory = Box<dyn Fn(&Currency) -> eyre::Result<Arc<dyn Gateway>> + Send + Sync>;

#[derive(Default)]
struct GatewayState {
    factories: HashMap<String, GatewayFactory>,
    instances: HashMap<String, Arc<dyn Gateway>>,
}

/// Lazily constructed, memoized gateways keyed by native currency symbol.
///
/// Token currencies share the gateway of their platform's native currency, so
/// each chain ends up with exactly one cache set and one endpoint rotator.
pub struct GatewayRegistry {
    currencies: Arc<CurrencyRegistry>,
    state: Mutex<GatewayState>,
}

impl GatewayRegistry {
    pub fn new(currencies: Arc<CurrencyRegistry>) -> Self {
        Self {
            currencies,
            state: Mutex::new(GatewayState::default()),
        }
    }

    pub fn currencies(&self) -> &Arc<CurrencyRegistry> {
        &self.currencies
    }

    /// Register the constructor for a currency's gateway. Later registrations are ignored.
    pub fn register_factory(
        &self,
        symbol: &str,
        factory: impl Fn(&Currency) -> eyre::Result<Arc<dyn Gateway>> + Send + Sync + 'static,
    ) -> bool {
        let key = symbol.to_lowercase();
        let mut state = self.lock();
        if state.factories.contains_key(&key) {
            tracing::warn!(symbol = %key, "Gateway factory registered multiple times");
            return false;
        }
        state.factories.insert(key, Box::new(factory));
        true
    }

    /// Gateway serving `symbol`, constructing it on first access.
    pub fn get_gateway(&self, symbol: &str) -> eyre::Result<Arc<dyn Gateway>> {
        let currency = self.currencies.get_one_currency(symbol)?;
        let native = if currency.is_native {
            currency
        } else {
            self.currencies.get_one_native_currency(currency.platform)?
        };
        let key = native.key();

        let mut state = self.lock();
        if let Some(gateway) = state.instances.get(&key) {
            return Ok(gateway.clone());
        }

        let factory = state
            .factories
            .get(&key)
            .ok_or_else(|| RegistryError::GatewayFactoryMissing(key.clone()))?;
        let gateway = factory(&native)?;
        tracing::info!(symbol = %key, "Gateway instantiated");
        state.instances.insert(key, gateway.clone());
        Ok(gateway)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GatewayState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use crate::error::RegistryError;
use crate::registry::types::{
    normalize_address, BlockchainPlatform, ContractRegistration, Currency, CurrencyConfig,
    CurrencyConfigPatch, TokenType,
};

type CurrencyCallback = Arc<dyn Fn(&Currency) + Send + Sync>;
type SpecificCallback = Box<dyn FnOnce() + Send>;
type TokenCallback = Arc<dyn Fn(&ContractRegistration) + Send + Sync>;
type ConfigCallback = Arc<dyn Fn(&Currency, &CurrencyConfig) + Send + Sync>;

#[derive(Default)]
struct RegistryState {
    currencies: HashMap<String, Currency>,
    configs: HashMap<String, CurrencyConfig>,
    tokens: HashMap<TokenType, Vec<ContractRegistration>>,
}

#[derive(Default)]
struct Callbacks {
    currency_registered: Vec<CurrencyCallback>,
    specific_registered: HashMap<String, Vec<SpecificCallback>>,
    token_registered: HashMap<TokenType, Vec<TokenCallback>>,
    config_set: Vec<ConfigCallback>,
}

/// Process-wide catalogue of currencies, their configs and watched token contracts.
///
/// Constructed once at startup and shared by `Arc`. Writes only go through the
/// methods here; lookups hand out clones.
///
/// Lock order is always `callbacks` then `state`, and callbacks are invoked after
/// both locks are released so listeners may call back into the registry.
pub struct CurrencyRegistry {
    state: RwLock<RegistryState>,
    callbacks: Mutex<Callbacks>,
}

impl Default for CurrencyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CurrencyRegistry {
    /// Empty registry without native currencies.
    pub fn empty() -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            callbacks: Mutex::new(Callbacks::default()),
        }
    }

    /// Registry preloaded with the native currencies of every supported platform.
    pub fn new() -> Self {
        let registry = Self::empty();
        for currency in native_currencies() {
            registry.register_currency(currency);
        }
        registry
    }

    /// Register a currency. Duplicate symbols are a warned no-op.
    pub fn register_currency(&self, currency: Currency) -> bool {
        let key = currency.key();
        tracing::info!(symbol = %key, "Registering currency");

        let fired = {
            let mut callbacks = lock(&self.callbacks);
            let mut state = write(&self.state);
            insert_currency(&mut callbacks, &mut state, &currency)
        };
        match fired {
            Some(fired) => {
                fired.run(&currency);
                true
            }
            None => false,
        }
    }

    fn unregister_currency(&self, symbol: &str) -> bool {
        let key = symbol.to_lowercase();
        let removed = write(&self.state).currencies.remove(&key).is_some();
        if !removed {
            tracing::error!(symbol = %key, "Tried to unregister an unknown currency");
        }
        removed
    }

    /// Register a watched token contract under the given token standard.
    ///
    /// Pushes to the type-specific list and the general currency map, firing the
    /// token callbacks and then the general registration callbacks.
    pub fn register_token(
        &self,
        token_type: TokenType,
        platform: BlockchainPlatform,
        mut registration: ContractRegistration,
    ) -> bool {
        registration.contract_address = normalize_address(&registration.contract_address);
        let currency = registration.to_currency(token_type, platform);

        tracing::info!(
            token_type = token_type.as_str(),
            contract = %registration.contract_address,
            symbol = %registration.symbol,
            name = %registration.name,
            decimals = registration.decimals,
            "Registering token contract"
        );

        // List entry and currency go in under one write.
        let (token_callbacks, fired) = {
            let mut callbacks = lock(&self.callbacks);
            let mut state = write(&self.state);
            let Some(fired) = insert_currency(&mut callbacks, &mut state, &currency) else {
                return false;
            };
            state
                .tokens
                .entry(token_type)
                .or_default()
                .push(registration.clone());
            let token_callbacks = callbacks
                .token_registered
                .get(&token_type)
                .cloned()
                .unwrap_or_default();
            (token_callbacks, fired)
        };

        for callback in token_callbacks {
            callback(&registration);
        }
        fired.run(&currency);
        true
    }

    /// Remove a token contract from both its type list and the currency map.
    pub fn unregister_token(&self, token_type: TokenType, contract_address: &str) -> bool {
        let address = normalize_address(contract_address);
        tracing::info!(token_type = token_type.as_str(), contract = %address, "Unregistering token contract");

        {
            let mut state = write(&self.state);
            if let Some(list) = state.tokens.get_mut(&token_type) {
                if let Some(pos) = list.iter().position(|t| t.contract_address == address) {
                    list.remove(pos);
                }
            }
        }

        self.unregister_currency(&token_type.symbol_for(&address))
    }

    pub fn register_bep20_token(&self, registration: ContractRegistration) -> bool {
        self.register_token(
            TokenType::Bep20,
            BlockchainPlatform::BinanceSmartChain,
            registration,
        )
    }

    pub fn unregister_bep20_token(&self, contract_address: &str) -> bool {
        self.unregister_token(TokenType::Bep20, contract_address)
    }

    pub fn get_one_currency(&self, symbol: &str) -> Result<Currency, RegistryError> {
        let key = symbol.to_lowercase();
        read(&self.state)
            .currencies
            .get(&key)
            .cloned()
            .ok_or(RegistryError::CurrencyNotFound(key))
    }

    pub fn has_one_currency(&self, symbol: &str) -> bool {
        read(&self.state).currencies.contains_key(&symbol.to_lowercase())
    }

    pub fn get_all_currencies(&self) -> Vec<Currency> {
        read(&self.state).currencies.values().cloned().collect()
    }

    pub fn get_one_native_currency(
        &self,
        platform: BlockchainPlatform,
    ) -> Result<Currency, RegistryError> {
        read(&self.state)
            .currencies
            .values()
            .find(|c| c.is_native && c.platform == platform)
            .cloned()
            .ok_or_else(|| RegistryError::NativeCurrencyNotFound(platform.to_string()))
    }

    pub fn get_all_tokens(&self, token_type: TokenType) -> Vec<ContractRegistration> {
        read(&self.state)
            .tokens
            .get(&token_type)
            .cloned()
            .unwrap_or_default()
    }

    /// Contracts currently watched on a platform.
    pub fn contracts_of_platform(&self, platform: BlockchainPlatform) -> Vec<ContractRegistration> {
        self.get_all_tokens(platform.token_type())
    }

    pub fn get_one_token(
        &self,
        token_type: TokenType,
        contract_address: &str,
    ) -> Result<ContractRegistration, RegistryError> {
        let address = normalize_address(contract_address);
        read(&self.state)
            .tokens
            .get(&token_type)
            .and_then(|list| list.iter().find(|t| t.contract_address == address))
            .cloned()
            .ok_or_else(|| RegistryError::CurrencyNotFound(token_type.symbol_for(&address)))
    }

    /// Merge a config write over whatever is stored for the currency.
    ///
    /// Fields present in `patch` win; fields it leaves out keep their stored
    /// value. A currency without a stored config starts from its platform's
    /// native config. Listeners receive the merged config.
    pub fn set_currency_config(
        &self,
        currency: &Currency,
        patch: CurrencyConfigPatch,
    ) -> Result<CurrencyConfig, RegistryError> {
        let key = currency.key();

        let (merged, listeners) = {
            let callbacks = lock(&self.callbacks);
            let mut state = write(&self.state);
            let merged = match config_or_native(&state, currency) {
                Some(existing) => patch.apply_to(existing),
                None => patch.into_config(&key)?,
            };
            state.configs.insert(key.clone(), merged.clone());
            (merged, callbacks.config_set.clone())
        };

        tracing::info!(
            symbol = %key,
            endpoint = %merged.rpc_endpoint,
            confirmations = merged.required_confirmations,
            "Currency config set"
        );

        for callback in listeners {
            callback(currency, &merged);
        }
        Ok(merged)
    }

    /// Config of a currency, falling back to its platform's native currency.
    pub fn get_currency_config(&self, currency: &Currency) -> Result<CurrencyConfig, RegistryError> {
        let state = read(&self.state);
        config_or_native(&state, currency)
            .cloned()
            .ok_or_else(|| RegistryError::ConfigNotFound(currency.key()))
    }

    /// Apply stored config rows keyed by symbol. Every symbol must already be
    /// registered; the first unknown one is returned as an error.
    pub fn apply_stored_configs(
        &self,
        rows: Vec<(String, CurrencyConfigPatch)>,
    ) -> Result<usize, RegistryError> {
        let mut applied = 0;
        for (symbol, patch) in rows {
            let currency = self.get_one_currency(&symbol)?;
            self.set_currency_config(&currency, patch)?;
            applied += 1;
        }
        Ok(applied)
    }

    pub fn on_currency_registered(&self, callback: impl Fn(&Currency) + Send + Sync + 'static) {
        lock(&self.callbacks)
            .currency_registered
            .push(Arc::new(callback));
    }

    /// Run `callback` once the currency exists; immediately if it already does.
    pub fn on_specific_currency_registered(
        &self,
        symbol: &str,
        callback: impl FnOnce() + Send + 'static,
    ) {
        let key = symbol.to_lowercase();
        {
            let mut callbacks = lock(&self.callbacks);
            if !read(&self.state).currencies.contains_key(&key) {
                callbacks
                    .specific_registered
                    .entry(key)
                    .or_default()
                    .push(Box::new(callback));
                return;
            }
        }
        callback();
    }

    /// Subscribe to token registrations, replaying the ones already registered.
    pub fn on_token_registered(
        &self,
        token_type: TokenType,
        callback: impl Fn(&ContractRegistration) + Send + Sync + 'static,
    ) {
        let callback: TokenCallback = Arc::new(callback);
        let existing = {
            let mut callbacks = lock(&self.callbacks);
            let existing = read(&self.state)
                .tokens
                .get(&token_type)
                .cloned()
                .unwrap_or_default();
            callbacks
                .token_registered
                .entry(token_type)
                .or_default()
                .push(callback.clone());
            existing
        };

        for token in &existing {
            callback(token);
        }
    }

    pub fn on_bep20_token_registered(
        &self,
        callback: impl Fn(&ContractRegistration) + Send + Sync + 'static,
    ) {
        self.on_token_registered(TokenType::Bep20, callback);
    }

    pub fn on_currency_config_set(
        &self,
        callback: impl Fn(&Currency, &CurrencyConfig) + Send + Sync + 'static,
    ) {
        lock(&self.callbacks).config_set.push(Arc::new(callback));
    }
}

/// Callbacks owed for one newly inserted currency.
struct Fired {
    general: Vec<CurrencyCallback>,
    specific: Vec<SpecificCallback>,
}

impl Fired {
    fn run(self, currency: &Currency) {
        for callback in self.general {
            callback(currency);
        }
        for callback in self.specific {
            callback();
        }
    }
}

fn insert_currency(
    callbacks: &mut Callbacks,
    state: &mut RegistryState,
    currency: &Currency,
) -> Option<Fired> {
    let key = currency.key();
    if state.currencies.contains_key(&key) {
        tracing::warn!(symbol = %key, "Currency registered multiple times");
        return None;
    }
    state.currencies.insert(key.clone(), currency.clone());
    Some(Fired {
        general: callbacks.currency_registered.clone(),
        specific: callbacks.specific_registered.remove(&key).unwrap_or_default(),
    })
}

fn config_or_native<'a>(state: &'a RegistryState, currency: &Currency) -> Option<&'a CurrencyConfig> {
    state.configs.get(&currency.key()).or_else(|| {
        state
            .currencies
            .values()
            .find(|c| c.is_native && c.platform == currency.platform)
            .and_then(|native| state.configs.get(&native.key()))
    })
}

fn native_currencies() -> Vec<Currency> {
    vec![
        Currency::native("eth", "Ethereum", BlockchainPlatform::Ethereum, 18),
        Currency::native("bnb", "BinanceSmartChain", BlockchainPlatform::BinanceSmartChain, 18),
        Currency::native("matic", "Polygon", BlockchainPlatform::Polygon, 18),
    ]
}

// A poisoned lock only means a listener panicked; the maps themselves stay consistent.
fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn read<T>(l: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(l: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(|e| e.into_inner())
}

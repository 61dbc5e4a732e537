use thiserror::Error;

/// Lookup and configuration failures raised by the currency and gateway registries.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("cannot find currency with symbol: {0}")]
    CurrencyNotFound(String),

    #[error("cannot find native currency for platform: {0}")]
    NativeCurrencyNotFound(String),

    #[error("cannot find currency config for symbol: {0}")]
    ConfigNotFound(String),

    #[error("currency config for {symbol} is missing required field `{field}`")]
    IncompleteConfig { symbol: String, field: &'static str },

    #[error("unknown blockchain platform: {0}")]
    UnknownPlatform(String),

    #[error("no gateway factory registered for currency: {0}")]
    GatewayFactoryMissing(String),
}

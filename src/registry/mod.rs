pub mod currency;
pub mod gateway;
pub mod types;

pub use currency::CurrencyRegistry;
pub use gateway::GatewayRegistry;

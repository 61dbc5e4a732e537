use async_trait::async_trait;
use serde::Deserialize;
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::db::repository;
use crate::gateway::decoder::AbiCatalog;
use crate::gateway::events::EventExtractors;
use crate::registry::types::{BlockchainPlatform, ContractRegistration, TokenType};
use crate::registry::CurrencyRegistry;

pub const EVENT_TOKEN_ADDED: &str = "EVENT_NEW_ERC20_TOKEN_ADDED";
pub const EVENT_TOKEN_REMOVED: &str = "EVENT_NEW_ERC20_TOKEN_REMOVED";

#[derive(Debug, Deserialize)]
struct RawMessage {
    event: String,
    data: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationEvent {
    TokenAdded(String),
    TokenRemoved(String),
}

/// Parse a notification. Messages for another application, malformed JSON and
/// unknown events all yield `None`.
pub fn parse_message(app_id: &str, channel: &str, payload: &str) -> Option<RegistrationEvent> {
    if channel != app_id {
        return None;
    }
    let message: RawMessage = match serde_json::from_str(payload) {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!(channel, payload, error = %e, "Unexpected registration message");
            return None;
        }
    };
    let address = match message.data {
        serde_json::Value::String(s) => s.trim().to_string(),
        other => other.to_string(),
    };
    match message.event.as_str() {
        EVENT_TOKEN_ADDED => Some(RegistrationEvent::TokenAdded(address)),
        EVENT_TOKEN_REMOVED => Some(RegistrationEvent::TokenRemoved(address)),
        other => {
            tracing::debug!(event = other, "Ignoring registration event");
            None
        }
    }
}

/// Source of full contract metadata for a notified address.
#[async_trait]
pub trait TokenLookup: Send + Sync {
    /// `(platform id, registration)` for the contract, in any address case.
    async fn find(&self, contract_address: &str) -> eyre::Result<Option<(String, ContractRegistration)>>;
}

pub struct PgTokenLookup {
    pool: PgPool,
}

impl PgTokenLookup {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TokenLookup for PgTokenLookup {
    async fn find(&self, contract_address: &str) -> eyre::Result<Option<(String, ContractRegistration)>> {
        repository::find_token_contract(&self.pool, contract_address).await
    }
}

/// Validate a stored contract and register it under its platform's token standard.
pub fn register_contract(
    registry: &CurrencyRegistry,
    abis: &AbiCatalog,
    extractors: &EventExtractors,
    platform: &str,
    mut registration: ContractRegistration,
) -> eyre::Result<bool> {
    let platform: BlockchainPlatform = platform.parse()?;
    abis.resolve_registration(&mut registration)?;
    let unhandled = extractors.unhandled_events(&registration);
    if !unhandled.is_empty() {
        tracing::warn!(
            contract = %registration.contract_address,
            events = %unhandled.join(","),
            "Watched events without payload extractor will not be dispatched"
        );
    }
    Ok(registry.register_token(platform.token_type(), platform, registration))
}

/// Applies registration notifications to the currency registry.
pub struct RegistrationHandler {
    registry: Arc<CurrencyRegistry>,
    abis: Arc<AbiCatalog>,
    extractors: Arc<EventExtractors>,
    lookup: Arc<dyn TokenLookup>,
}

impl RegistrationHandler {
    pub fn new(
        registry: Arc<CurrencyRegistry>,
        abis: Arc<AbiCatalog>,
        extractors: Arc<EventExtractors>,
        lookup: Arc<dyn TokenLookup>,
    ) -> Self {
        Self {
            registry,
            abis,
            extractors,
            lookup,
        }
    }

    pub async fn handle(&self, event: RegistrationEvent) -> eyre::Result<()> {
        match event {
            RegistrationEvent::TokenAdded(address) => {
                let (platform, registration) = self
                    .lookup
                    .find(&address)
                    .await?
                    .ok_or_else(|| eyre::eyre!("Could not find token contract in database: {}", address))?;
                register_contract(&self.registry, &self.abis, &self.extractors, &platform, registration)?;
            }
            RegistrationEvent::TokenRemoved(address) => {
                let token_types = match self.lookup.find(&address).await? {
                    Some((platform, _)) => vec![platform.parse::<BlockchainPlatform>()?.token_type()],
                    // row already gone: drop it wherever it is listed
                    None => vec![TokenType::Bep20, TokenType::Erc20],
                };
                for token_type in token_types {
                    if self.registry.has_one_currency(&token_type.symbol_for(&address)) {
                        self.registry.unregister_token(token_type, &address);
                    }
                }
            }
        }
        Ok(())
    }
}

/// Follow the registration channel until shutdown.
pub async fn listen(
    pool: &PgPool,
    app_id: &str,
    handler: Arc<RegistrationHandler>,
    shutdown: CancellationToken,
) -> eyre::Result<()> {
    let mut listener = PgListener::connect_with(pool).await?;
    listener.listen(app_id).await?;
    tracing::info!(channel = app_id, "Listening for contract registrations");

    loop {
        let notification = tokio::select! {
            _ = shutdown.cancelled() => break,
            n = listener.recv() => n?,
        };
        let Some(event) = parse_message(app_id, notification.channel(), notification.payload()) else {
            continue;
        };
        tracing::info!(event = ?event, "Registration notification received");
        if let Err(e) = handler.handle(event).await {
            tracing::error!(error = %e, "Failed to apply registration");
        }
    }

    tracing::info!(channel = app_id, "Registration listener stopped");
    Ok(())
}

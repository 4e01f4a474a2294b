//! The streaming seam the orchestrator depends on, and model routing.

use crate::adapters::ProviderFamily;
use crate::client::ProviderClient;
use crate::error::ProviderError;
use crate::types::ChatRequest;
use async_trait::async_trait;
use futures::Stream;
use std::collections::HashMap;
use std::pin::Pin;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Ordered token deltas from one provider call.
///
/// The stream ends after the provider's end-of-stream marker, after the
/// first `Err` item, or once the call is cancelled.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, ProviderError>> + Send>>;

/// Something that can stream a chat completion.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn stream_chat(
        &self,
        request: ChatRequest,
        cancel: CancellationToken,
    ) -> Result<TokenStream, ProviderError>;
}

/// Routes each request to the client for its model's provider family.
#[derive(Clone, Default)]
pub struct ProviderRouter {
    clients: HashMap<ProviderFamily, ProviderClient>,
}

impl ProviderRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client, replacing any previous client for its family.
    pub fn with_client(mut self, client: ProviderClient) -> Self {
        self.insert(client);
        self
    }

    pub fn insert(&mut self, client: ProviderClient) {
        self.clients.insert(client.family(), client);
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Families that have a client, in a stable order.
    pub fn configured_families(&self) -> Vec<ProviderFamily> {
        ProviderFamily::ALL
            .into_iter()
            .filter(|f| self.clients.contains_key(f))
            .collect()
    }

    /// Client serving `model_id`.
    pub fn client_for(&self, model_id: &str) -> Result<&ProviderClient, ProviderError> {
        let family = ProviderFamily::for_model(model_id);
        self.clients
            .get(&family)
            .ok_or_else(|| ProviderError::UnsupportedModel(model_id.to_string()))
    }
}

#[async_trait]
impl ChatProvider for ProviderRouter {
    async fn stream_chat(
        &self,
        request: ChatRequest,
        cancel: CancellationToken,
    ) -> Result<TokenStream, ProviderError> {
        let client = self.client_for(&request.model)?;
        debug!(provider = %client.family(), model = %request.model, "Routing chat stream");
        client.chat_stream(request, cancel).await
    }
}

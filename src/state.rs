use crate::config::AppConfig;
use crate::evolution::WhatsAppProvider;
use crate::reconciler::InstanceReconciler;
use crate::store::{ConversationStore, InstanceStore, ProductStore};
use crate::webhook::WebhookIngestor;
use std::sync::Arc;

/// Shared application state handed to every router.
pub struct AppState {
    pub config: AppConfig,
    pub instances: Arc<dyn InstanceStore>,
    pub conversations: Arc<dyn ConversationStore>,
    pub products: Arc<dyn ProductStore>,
    pub provider: Arc<dyn WhatsAppProvider>,
    pub reconciler: Arc<InstanceReconciler>,
    pub ingestor: Arc<WebhookIngestor>,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        instances: Arc<dyn InstanceStore>,
        conversations: Arc<dyn ConversationStore>,
        products: Arc<dyn ProductStore>,
        provider: Arc<dyn WhatsAppProvider>,
    ) -> Self {
        let http = reqwest::Client::new();
        let reconciler = Arc::new(InstanceReconciler::new(
            Arc::clone(&instances),
            Arc::clone(&provider),
        ));
        let ingestor = Arc::new(WebhookIngestor::new(
            Arc::clone(&instances),
            Arc::clone(&conversations),
            http,
            config.webhook.brain_url.clone(),
            config.webhook.brain_secret.clone(),
        ));
        Self {
            config,
            instances,
            conversations,
            products,
            provider,
            reconciler,
            ingestor,
        }
    }
}

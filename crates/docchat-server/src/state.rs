use std::sync::Arc;

use crate::config::Settings;
use crate::document::ProcessingDispatcher;
use crate::services::{ChatService, CompletionService, ResponseCache, RetentionManager};
use crate::store::ConversationStore;
use crate::utils::limiters::Limiters;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub dispatcher: ProcessingDispatcher,
    pub store: Arc<ConversationStore>,
    pub chat: ChatService,
    pub retention: RetentionManager,
    pub limiters: Limiters,
}

impl AppState {
    pub fn new(
        settings: Settings,
        store: Arc<ConversationStore>,
        completion: Arc<dyn CompletionService>,
    ) -> Self {
        let limiters = Limiters::new(&settings.limits);
        let dispatcher = ProcessingDispatcher::with_defaults(&settings).with_limiters(limiters.clone());
        let cache = ResponseCache::new(settings.cache.max_entries);
        let chat = ChatService::new(
            store.clone(),
            completion,
            cache,
            limiters.clone(),
            settings.llm.clone(),
            settings.cache.ttl(),
        );
        let retention = RetentionManager::new(store.clone(), &settings.retention);

        Self {
            settings: Arc::new(settings),
            dispatcher,
            store,
            chat,
            retention,
            limiters,
        }
    }

    pub fn cache(&self) -> &ResponseCache {
        self.chat.cache()
    }
}

use std::sync::Arc;

use application::{ChatService, RealtimeHub, TypingRelay};
use config::RealtimeConfig;

use crate::JwtService;

#[derive(Clone)]
pub struct AppState {
    pub chat_service: Arc<ChatService>,
    pub hub: Arc<RealtimeHub>,
    pub typing: Arc<TypingRelay>,
    pub jwt_service: Arc<JwtService>,
    pub realtime: RealtimeConfig,
}

impl AppState {
    pub fn new(
        chat_service: Arc<ChatService>,
        hub: Arc<RealtimeHub>,
        jwt_service: Arc<JwtService>,
        realtime: RealtimeConfig,
    ) -> Self {
        let typing = Arc::new(TypingRelay::new(hub.clone()));
        Self {
            chat_service,
            hub,
            typing,
            jwt_service,
            realtime,
        }
    }
}

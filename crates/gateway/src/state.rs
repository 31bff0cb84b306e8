use std::sync::Arc;
use tagger::InterrogationService;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<InterrogationService>,
}

impl AppState {
    pub fn new(service: InterrogationService) -> Self {
        Self {
            service: Arc::new(service),
        }
    }
}

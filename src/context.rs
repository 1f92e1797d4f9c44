use crate::admin::ControlPlane;
use crate::delivery_worker::{DeadLetterHandler, StreamQueue};
use crate::store::DeliveryStore;
use courier_config::Config;
use std::sync::Arc;

/// Application context containing shared dependencies of the HTTP surface
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<Config>,
    pub store: Arc<dyn DeliveryStore>,
    pub control: ControlPlane,
    pub queue: StreamQueue,
    pub dead_letters: DeadLetterHandler,
}

impl AppContext {
    /// Creates a new application context around an admin store connection
    pub fn new(config: Arc<Config>, store: Arc<dyn DeliveryStore>) -> Self {
        Self {
            control: ControlPlane::new(store.clone(), &config.queue),
            queue: StreamQueue::new(store.clone(), &config.queue),
            dead_letters: DeadLetterHandler::new(store.clone(), &config.queue),
            config,
            store,
        }
    }
}

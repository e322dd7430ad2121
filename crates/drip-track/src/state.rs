use std::sync::Arc;

use drip_db::DripDb;
use drip_engine::DeliveryScheduler;

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DripDb>,
    pub scheduler: Arc<DeliveryScheduler>,
}

impl AppState {
    pub fn new(db: Arc<DripDb>, scheduler: Arc<DeliveryScheduler>) -> Self {
        Self { db, scheduler }
    }
}

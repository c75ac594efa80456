pub mod alert_engine;
pub mod breaker;
pub mod budget;
pub mod config;
pub mod field_sets;
pub mod gateway;
pub mod geohash;
pub mod handlers;
pub mod load_shed;
pub mod metrics;
pub mod models;
pub mod redact;
pub mod retention;
pub mod search_cache;
pub mod searches;
pub mod service_mode;
pub mod singleflight;
pub mod store;
pub mod tile_cache;

use std::sync::Arc;

use gateway::Gateway;
use load_shed::LoadShedder;
use service_mode::ModeController;
use store::Store;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub gateway: Arc<Gateway>,
    pub mode: Arc<ModeController>,
    pub shedder: Arc<LoadShedder>,
}

use mcm_provider::ProviderRegistry;
use mcm_provider::engine::EngineConfig;

use crate::config::AppConfig;

#[derive(Clone)]
pub struct AppState {
    pub providers: ProviderRegistry,
    pub engine_config: EngineConfig,
    pub config: AppConfig,
}

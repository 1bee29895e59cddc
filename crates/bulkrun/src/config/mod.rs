pub mod loader;
pub mod schema;

pub use loader::{
    apply_env_overrides, load_config, load_config_from_str, load_effective_config, validate_config,
};
pub use schema::{
    BatchingConfig, Config, ExecutorConfig, QueueConfig, RetryConfig, WebhookConfig,
};

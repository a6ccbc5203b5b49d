//! Relay configuration: schema, discovery and `${ENV}` substitution.

pub mod env_subst;
pub mod loader;
pub mod schema;

pub use {
    loader::{
        clear_config_dir, config_dir, data_dir, discover_and_load, load_config, set_config_dir,
    },
    schema::{AuthConfig, RelayConfig, ServerConfig, StorageConfig},
};

//! Configuration loading from files and environment variables.

use config::{Config, ConfigBuilder, Environment, File, builder::DefaultState};

use crate::error::{ServiceError, ServiceResult};

use super::AppConfig;

/// Load configuration from `config.*` (optional) and `DOCPIPE__*` env vars
pub fn load_config() -> ServiceResult<AppConfig> {
    let builder = Config::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(
            Environment::with_prefix("DOCPIPE")
                .separator("__")
                .try_parsing(true),
        );

    let config = deserialize(builder)?;
    validate(&config)?;
    Ok(config)
}

fn deserialize(builder: ConfigBuilder<DefaultState>) -> ServiceResult<AppConfig> {
    builder
        .build()
        .map_err(|e| ServiceError::Config {
            message: format!("Failed to build config: {}", e),
        })?
        .try_deserialize()
        .map_err(|e| ServiceError::Config {
            message: format!("Failed to deserialize config: {}", e),
        })
}

fn validate(config: &AppConfig) -> ServiceResult<()> {
    if config.queue.workers == 0 {
        return Err(ServiceError::Config {
            message: "queue.workers must be at least 1".to_string(),
        });
    }
    if config.queue.max_attempts == 0 {
        return Err(ServiceError::Config {
            message: "queue.max_attempts must be at least 1".to_string(),
        });
    }
    if config.inference.embedding_dimensions == 0 {
        return Err(ServiceError::Config {
            message: "inference.embedding_dimensions must be positive".to_string(),
        });
    }
    if config.storage.presign_secret.is_none() {
        tracing::warn!(
            "storage.presign_secret is not set, presigned URLs use a development secret"
        );
    }
    Ok(())
}

use super::{types::Config, ConfigError};

/// Validate configuration
/// Currently validates:
/// - Server port is not 0
/// - Every pipeline concurrency limit is at least 1
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    // Server validation
    if config.server.port == 0 {
        return Err(ConfigError::ValidationError(
            "server.port cannot be 0".to_string(),
        ));
    }

    let pipeline = &config.pipeline;
    for (name, value) in [
        ("download_concurrency", pipeline.download_concurrency),
        ("convert_concurrency", pipeline.convert_concurrency),
        ("enrich_concurrency", pipeline.enrich_concurrency),
    ] {
        if value == 0 {
            return Err(ConfigError::ValidationError(format!(
                "pipeline.{} must be at least 1",
                name
            )));
        }
    }

    if config.jobs.update_buffer == 0 {
        return Err(ConfigError::ValidationError(
            "jobs.update_buffer must be at least 1".to_string(),
        ));
    }

    Ok(())
}

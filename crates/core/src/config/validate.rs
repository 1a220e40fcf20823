use super::{types::Config, ConfigError};
use crate::job::Stage;

/// Longest DICOM application entity title.
const MAX_AE_TITLE_LEN: usize = 16;

/// Validate configuration
///
/// Rejects values that would leave the service unable to run a job:
/// port 0, empty worker or slot pools, retry policies that never try or
/// shrink their backoff, empty tool paths and unusable AE titles.
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    // Server validation
    if config.server.port == 0 {
        return Err(invalid("server.port cannot be 0"));
    }

    // Scheduler validation
    let scheduler = &config.scheduler;
    if scheduler.workers == 0 {
        return Err(invalid("scheduler.workers must be at least 1"));
    }
    if scheduler.accelerator_slots == 0 {
        return Err(invalid("scheduler.accelerator_slots must be at least 1"));
    }
    if scheduler.general_slots == 0 {
        return Err(invalid("scheduler.general_slots must be at least 1"));
    }
    if scheduler.lease_ttl_ms == 0 {
        return Err(invalid("scheduler.lease_ttl_ms cannot be 0"));
    }

    // Retry validation
    for stage in Stage::ALL {
        let policy = config.retry.policy(stage);
        if policy.max_attempts == 0 {
            return Err(invalid(format!(
                "retry.{}.max_attempts must be at least 1",
                stage
            )));
        }
        if policy.backoff_multiplier < 1.0 {
            return Err(invalid(format!(
                "retry.{}.backoff_multiplier must be at least 1.0",
                stage
            )));
        }
        if policy.timeout_ms == 0 {
            return Err(invalid(format!("retry.{}.timeout_ms cannot be 0", stage)));
        }
    }

    // Tool validation
    let tools = [
        ("tools.dcm2niix.path", &config.tools.dcm2niix.path),
        ("tools.totalspineseg.path", &config.tools.totalspineseg.path),
        (
            "tools.itkimage2segimage.path",
            &config.tools.itkimage2segimage.path,
        ),
        ("pacs.storescu_path", &config.pacs.storescu_path),
    ];
    for (name, path) in tools {
        if path.as_os_str().is_empty() {
            return Err(invalid(format!("{} cannot be empty", name)));
        }
    }

    // PACS validation
    for (name, title) in [
        ("pacs.called_ae", &config.pacs.called_ae),
        ("pacs.calling_ae", &config.pacs.calling_ae),
    ] {
        if title.trim().is_empty() {
            return Err(invalid(format!("{} cannot be empty", name)));
        }
        if title.len() > MAX_AE_TITLE_LEN {
            return Err(invalid(format!(
                "{} is longer than {} characters",
                name, MAX_AE_TITLE_LEN
            )));
        }
    }
    if config.pacs.host.trim().is_empty() {
        return Err(invalid("pacs.host cannot be empty"));
    }

    Ok(())
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError(message.into())
}

use anyhow::anyhow;

use super::Config;

/// Reject values the fixer cannot run with
pub fn validate_config(config: &Config) -> Result<(), anyhow::Error> {
    if config.worker_threads == Some(0) {
        return Err(anyhow!("worker_threads must be greater than 0"));
    }

    if config.stats.interval_secs == 0 {
        return Err(anyhow!("stats.interval_secs must be greater than 0"));
    }

    if config.fetch.timeout_secs == 0 {
        return Err(anyhow!("fetch.timeout_secs must be greater than 0"));
    }

    if config.fetch.user_agent.trim().is_empty() {
        return Err(anyhow!("fetch.user_agent cannot be empty"));
    }

    if let Some(roots) = &config.roots {
        if roots.as_os_str().is_empty() {
            return Err(anyhow!("roots cannot be an empty path"));
        }
    }

    Ok(())
}

/// Configuration loading from TOML file
use std::path::Path;

use crate::error::{EngineError, Result};
use crate::types::{EngineConfig, ThrottleMode};
use crate::utils::{parse_wall_clock, parse_weekday};

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<EngineConfig> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| EngineError::ConfigError(format!("Failed to read config file: {}", e)))?;

    let config: EngineConfig = toml::from_str(&content)
        .map_err(|e| EngineError::ConfigError(format!("Failed to parse config: {}", e)))?;

    validate_config(&config)?;

    Ok(config)
}

pub fn validate_config(config: &EngineConfig) -> Result<()> {
    if config.ring_capacity == 0 {
        return Err(EngineError::ConfigError("ring_capacity must be > 0".to_string()));
    }

    if config.write_queue_capacity == 0 {
        return Err(EngineError::ConfigError("write_queue_capacity must be > 0".to_string()));
    }

    if config.outbound_queue_capacity == 0 {
        return Err(EngineError::ConfigError("outbound_queue_capacity must be > 0".to_string()));
    }

    if config.retention_days == 0 {
        return Err(EngineError::ConfigError("retention_days must be > 0".to_string()));
    }

    if !(0.0..=1.0).contains(&config.throttle_drop_rate) {
        return Err(EngineError::ConfigError(format!(
            "throttle_drop_rate must be within 0..1, got {}",
            config.throttle_drop_rate
        )));
    }

    if config.throttle_mode == ThrottleMode::Throttled && config.throttle_drop_rate == 0.0 {
        return Err(EngineError::ConfigError(
            "throttle_mode THROTTLED requires throttle_drop_rate > 0".to_string(),
        ));
    }

    if config.stop_out_pct <= 0.0 || config.margin_call_pct <= 0.0 {
        return Err(EngineError::ConfigError(
            "margin_call_pct and stop_out_pct must be > 0".to_string(),
        ));
    }

    if config.stop_out_pct > config.margin_call_pct {
        return Err(EngineError::ConfigError(format!(
            "stop_out_pct {} must be <= margin_call_pct {}",
            config.stop_out_pct, config.margin_call_pct
        )));
    }

    if parse_wall_clock(&config.swap_rollover_time).is_none() {
        return Err(EngineError::ConfigError(format!(
            "Invalid swap_rollover_time: {}",
            config.swap_rollover_time
        )));
    }

    if config.swap_rollover_tz.parse::<chrono_tz::Tz>().is_err() {
        return Err(EngineError::ConfigError(format!(
            "Invalid swap_rollover_tz: {}",
            config.swap_rollover_tz
        )));
    }

    if parse_weekday(&config.triple_swap_weekday).is_none() {
        return Err(EngineError::ConfigError(format!(
            "Invalid triple_swap_weekday: {}",
            config.triple_swap_weekday
        )));
    }

    Ok(())
}

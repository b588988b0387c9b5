//! Configuration validation.

use super::Config;
use crate::error::{MigrateError, Result};

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    if let Some(ref run_id) = config.run_id {
        crate::core::naming::validate_identifier(run_id)?;
        if run_id.contains(['/', '\\']) {
            return Err(MigrateError::Config(format!(
                "run_id must not contain path separators, got '{}'",
                run_id
            )));
        }
    }

    // Decoder validation
    if config.decoder.sample_lines == 0 {
        return Err(MigrateError::Config(
            "decoder.sample_lines must be at least 1".into(),
        ));
    }
    if let Some(d) = config.decoder.delimiter {
        if d == '"' || d == '\n' || d == '\r' || !d.is_ascii() {
            return Err(MigrateError::Config(format!(
                "decoder.delimiter must be a single ASCII separator, got {:?}",
                d
            )));
        }
    }

    // Analysis validation
    if config.analysis.sample_size == 0 {
        return Err(MigrateError::Config(
            "analysis.sample_size must be at least 1".into(),
        ));
    }
    if config.analysis.chunk_size == 0 {
        return Err(MigrateError::Config(
            "analysis.chunk_size must be at least 1".into(),
        ));
    }
    check_ratio("analysis.nullable_threshold", config.analysis.nullable_threshold)?;
    check_ratio("analysis.enum_max_ratio", config.analysis.enum_max_ratio)?;
    check_ratio("analysis.pattern_min_ratio", config.analysis.pattern_min_ratio)?;

    // Memory validation
    let m = &config.memory;
    check_ratio("memory.warning_threshold", m.warning_threshold)?;
    check_ratio("memory.critical_threshold", m.critical_threshold)?;
    check_ratio("memory.emergency_threshold", m.emergency_threshold)?;
    if !(m.warning_threshold < m.critical_threshold && m.critical_threshold < m.emergency_threshold)
    {
        return Err(MigrateError::Config(format!(
            "memory thresholds must be increasing (warning {} < critical {} < emergency {})",
            m.warning_threshold, m.critical_threshold, m.emergency_threshold
        )));
    }
    if let Some(0) = m.ceiling_bytes {
        return Err(MigrateError::Config(
            "memory.ceiling_bytes must be greater than 0".into(),
        ));
    }
    if m.history_size < 2 {
        return Err(MigrateError::Config(
            "memory.history_size must be at least 2".into(),
        ));
    }

    // Batch validation
    let b = &config.batch;
    if b.min_batch_size == 0 {
        return Err(MigrateError::Config(
            "batch.min_batch_size must be at least 1".into(),
        ));
    }
    if b.min_batch_size > b.max_batch_size {
        return Err(MigrateError::Config(format!(
            "batch.min_batch_size ({}) exceeds batch.max_batch_size ({})",
            b.min_batch_size, b.max_batch_size
        )));
    }
    if b.batch_size < b.min_batch_size || b.batch_size > b.max_batch_size {
        return Err(MigrateError::Config(format!(
            "batch.batch_size ({}) must be within [{}, {}]",
            b.batch_size, b.min_batch_size, b.max_batch_size
        )));
    }
    if b.checkpoint_interval == 0 {
        return Err(MigrateError::Config(
            "batch.checkpoint_interval must be at least 1".into(),
        ));
    }
    if let Some(0) = b.workers {
        return Err(MigrateError::Config(
            "batch.workers must be at least 1".into(),
        ));
    }
    if let Some(0) = b.batch_timeout_secs {
        return Err(MigrateError::Config(
            "batch.batch_timeout_secs must be at least 1".into(),
        ));
    }

    // Retry validation
    let r = &config.retry;
    if r.max_attempts == 0 {
        return Err(MigrateError::Config(
            "retry.max_attempts must be at least 1".into(),
        ));
    }
    if r.base_delay_ms > r.max_delay_ms {
        return Err(MigrateError::Config(format!(
            "retry.base_delay_ms ({}) exceeds retry.max_delay_ms ({})",
            r.base_delay_ms, r.max_delay_ms
        )));
    }
    check_ratio("retry.max_failure_ratio", r.max_failure_ratio)?;
    if r.sub_batch_size == 0 {
        return Err(MigrateError::Config(
            "retry.sub_batch_size must be at least 1".into(),
        ));
    }

    // Checkpoint validation
    if config.checkpoint.retention == 0 {
        return Err(MigrateError::Config(
            "checkpoint.retention must be at least 1".into(),
        ));
    }

    // Progress validation
    if config.progress.min_percent_delta < 0.0 {
        return Err(MigrateError::Config(
            "progress.min_percent_delta must not be negative".into(),
        ));
    }
    if config.progress.throughput_window == 0 {
        return Err(MigrateError::Config(
            "progress.throughput_window must be at least 1".into(),
        ));
    }

    Ok(())
}

fn check_ratio(name: &str, value: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&value) || value.is_nan() {
        return Err(MigrateError::Config(format!(
            "{} must be within [0, 1], got {}",
            name, value
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        Config::default()
    }

    #[test]
    fn test_valid_config() {
        let config = valid_config();
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_inverted_batch_bounds() {
        let mut config = valid_config();
        config.batch.min_batch_size = 600;
        config.batch.max_batch_size = 100;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_batch_size_outside_bounds() {
        let mut config = valid_config();
        config.batch.batch_size = 6000;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_thresholds_out_of_order() {
        let mut config = valid_config();
        config.memory.critical_threshold = 0.6;
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("increasing"));
    }

    #[test]
    fn test_failure_ratio_out_of_range() {
        let mut config = valid_config();
        config.retry.max_failure_ratio = 1.5;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_zero_checkpoint_interval() {
        let mut config = valid_config();
        config.batch.checkpoint_interval = 0;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_run_id_with_path_separator() {
        let mut config = valid_config();
        config.run_id = Some("../escape".into());
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_quote_delimiter_rejected() {
        let mut config = valid_config();
        config.decoder.delimiter = Some('"');
        assert!(validate(&config).is_err());
    }
}

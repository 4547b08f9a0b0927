//! Operator configuration

use crate::error::{OperatorError, Result};
use crate::osb::DEFAULT_BROKER_TIMEOUT;
use crate::runtime::{ControllerConfig, ExponentialBackoff, DEFAULT_RESYNC_PERIOD, DEFAULT_WORKERS};
use std::time::Duration;
use validator::{Validate, ValidationError};

fn validate_broker_timeout(value: &Duration) -> std::result::Result<(), ValidationError> {
    if value.is_zero() || *value > Duration::from_secs(3600) {
        return Err(ValidationError::new("invalid_broker_timeout")
            .with_message("broker timeout must be between 1s and 1h".into()));
    }
    Ok(())
}

fn validate_resync_period(value: &Duration) -> std::result::Result<(), ValidationError> {
    if *value < Duration::from_secs(1) {
        return Err(ValidationError::new("invalid_resync_period")
            .with_message("resync period must be at least 1s".into()));
    }
    Ok(())
}

/// Validated settings the controllers run with
#[derive(Debug, Clone, Validate)]
pub struct OperatorConfig {
    /// Namespace to watch; all namespaces when `None`
    pub watch_namespace: Option<String>,

    /// Concurrent reconciles per controller
    #[validate(range(min = 1, max = 256, message = "workers must be between 1 and 256"))]
    pub workers: usize,

    /// Timeout of each broker request
    #[validate(custom(function = "validate_broker_timeout"))]
    pub broker_timeout: Duration,

    /// Period between full resyncs
    #[validate(custom(function = "validate_resync_period"))]
    pub resync_period: Duration,

    /// Retry backoff after failed reconciles
    pub backoff: ExponentialBackoff,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            watch_namespace: None,
            workers: DEFAULT_WORKERS,
            broker_timeout: DEFAULT_BROKER_TIMEOUT,
            resync_period: DEFAULT_RESYNC_PERIOD,
            backoff: ExponentialBackoff::default(),
        }
    }
}

impl OperatorConfig {
    /// Check the settings, mapping failures to [`OperatorError::InvalidConfig`]
    pub fn validated(self) -> Result<Self> {
        self.validate()
            .map_err(|e| OperatorError::InvalidConfig(e.to_string()))?;
        Ok(self)
    }

    /// Runtime settings shared by every controller
    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            namespace: self.watch_namespace.clone(),
            workers: self.workers,
            resync_period: self.resync_period,
            backoff: self.backoff,
        }
    }
}

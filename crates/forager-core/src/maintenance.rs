//! Maintenance-page detection and downtime estimation.
//!
//! Some target sites take scheduled maintenance windows and serve a notice
//! page ("available again in 30 minutes") instead of content. That page is
//! a scheduling signal, not a failure: the job should come back after the
//! window, not burn retries against it. The detector is stateless — pure
//! classification over a fetched body.

use std::time::Duration;

use chrono::Utc;
use regex::Regex;

use crate::error::AppError;

/// Configuration for maintenance detection.
#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    /// Literal markers (matched case-insensitively) identifying a
    /// maintenance page.
    pub markers: Vec<String>,

    /// Delay to assume when the page gives no parseable duration.
    pub default_delay: Duration,

    /// Multiplier applied to any parsed duration. Sites habitually
    /// under-estimate their own downtime.
    pub safety_multiplier: f64,

    /// Flat buffer added on top of the multiplied duration.
    pub safety_buffer: Duration,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            markers: vec![
                "system maintenance".to_string(),
                "under maintenance".to_string(),
                "scheduled maintenance".to_string(),
                "temporarily unavailable".to_string(),
                "we'll be back shortly".to_string(),
            ],
            default_delay: Duration::from_secs(1800),
            safety_multiplier: 1.5,
            safety_buffer: Duration::from_secs(60),
        }
    }
}

/// Stateless maintenance-page classifier.
///
/// The duration pattern is compiled once at construction — no module-level
/// state.
#[derive(Clone)]
pub struct MaintenanceDetector {
    config: MaintenanceConfig,
    markers_lower: Vec<String>,
    duration_pattern: Regex,
}

impl MaintenanceDetector {
    pub fn new(config: MaintenanceConfig) -> Self {
        let markers_lower = config.markers.iter().map(|m| m.to_lowercase()).collect();
        let duration_pattern = Regex::new(r"(?i)available\s+again\s+in\s+(\d+)\s+(second|minute|hour)s?\b")
            .expect("duration pattern is a valid regex");
        Self {
            config,
            markers_lower,
            duration_pattern,
        }
    }

    /// True if the body contains any known maintenance marker.
    pub fn is_maintenance_page(&self, body: &str) -> bool {
        let body = body.to_lowercase();
        self.markers_lower.iter().any(|m| body.contains(m))
    }

    /// Extract the announced downtime, padded so we always over-estimate:
    /// `parsed × safety_multiplier + safety_buffer`. Returns the configured
    /// default delay when no phrase matches.
    pub fn parse_duration(&self, body: &str) -> Duration {
        let Some(caps) = self.duration_pattern.captures(body) else {
            return self.config.default_delay;
        };

        let amount: u64 = match caps[1].parse() {
            Ok(n) => n,
            Err(_) => return self.config.default_delay,
        };
        let unit_secs = match caps[2].to_lowercase().as_str() {
            "second" => 1,
            "minute" => 60,
            "hour" => 3600,
            _ => return self.config.default_delay,
        };

        let parsed = Duration::from_secs(amount * unit_secs);
        parsed.mul_f64(self.config.safety_multiplier) + self.config.safety_buffer
    }

    /// Raise [`AppError::Maintenance`] if the body is a maintenance page.
    ///
    /// The error carries the padded delay and the computed resume
    /// timestamp; callers reschedule, they do not retry inline.
    pub fn check(&self, body: &str) -> Result<(), AppError> {
        if !self.is_maintenance_page(body) {
            return Ok(());
        }

        let delay = self.parse_duration(body);
        let resume_at = Utc::now() + chrono::TimeDelta::from_std(delay).unwrap_or_default();
        tracing::info!(
            delay_ms = %delay.as_millis(),
            %resume_at,
            "Maintenance page detected"
        );
        Err(AppError::Maintenance { resume_at, delay })
    }
}

impl Default for MaintenanceDetector {
    fn default() -> Self {
        Self::new(MaintenanceConfig::default())
    }
}

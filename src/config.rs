//! Environment-variable configuration with compiled-in defaults.
//!
//! Every knob is optional; a missing variable falls back to the default and a
//! malformed one is a hard startup error (exit code 1).

use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value:?}")]
    InvalidValue { name: &'static str, value: String },

    #[error("{name} must be {constraint} (got {value})")]
    Constraint {
        name: &'static str,
        constraint: &'static str,
        value: String,
    },
}

/// Which LLM backend the enricher talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmProviderKind {
    Gemini,
    OpenAi,
    None,
}

impl FromStr for LlmProviderKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "gemini" => Ok(Self::Gemini),
            "openai" => Ok(Self::OpenAi),
            "none" => Ok(Self::None),
            _ => Err(()),
        }
    }
}

/// Runtime configuration for all components.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub bind_addr: String,

    // Detector
    pub tick_interval_seconds: u64,
    pub rule_refresh_seconds: u64,
    pub window_minutes_rate: i64,
    pub min_consecutive_errors: u64,
    pub recovery_threshold: usize,
    pub cooldown_seconds: i64,

    // Metric store
    pub bucket_ttl_seconds: u64,

    // Ingestor
    pub ingest_max_in_flight: usize,

    // Enricher
    pub enrich_workers: usize,
    pub llm_timeout_seconds: u64,
    pub llm_provider: LlmProviderKind,
    pub gemini_api_key: Option<String>,
    pub openai_api_key: Option<String>,
    /// Endpoint override, mainly for tests and self-hosted gateways.
    pub llm_base_url: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: "data/paysentinel.db".to_string(),
            bind_addr: "0.0.0.0:8000".to_string(),
            tick_interval_seconds: 10,
            rule_refresh_seconds: 10,
            window_minutes_rate: 10,
            min_consecutive_errors: 8,
            recovery_threshold: 5,
            cooldown_seconds: 600,
            bucket_ttl_seconds: 1800,
            ingest_max_in_flight: 256,
            enrich_workers: 4,
            llm_timeout_seconds: 15,
            llm_provider: LlmProviderKind::Gemini,
            gemini_api_key: None,
            openai_api_key: None,
            llm_base_url: None,
        }
    }
}

fn parse_var<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| ConfigError::InvalidValue { name, value: raw }),
        Err(_) => Ok(default),
    }
}

fn string_var(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn optional_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl Config {
    /// Load from the process environment, validating cross-field constraints.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Config::default();

        let cfg = Config {
            database_path: string_var("DATABASE_PATH", &defaults.database_path),
            bind_addr: string_var("BIND_ADDR", &defaults.bind_addr),
            tick_interval_seconds: parse_var(
                "TICK_INTERVAL_SECONDS",
                defaults.tick_interval_seconds,
            )?,
            rule_refresh_seconds: parse_var("RULE_REFRESH_SECONDS", defaults.rule_refresh_seconds)?,
            window_minutes_rate: parse_var("WINDOW_MINUTES_RATE", defaults.window_minutes_rate)?,
            min_consecutive_errors: parse_var(
                "MIN_CONSECUTIVE_ERRORS",
                defaults.min_consecutive_errors,
            )?,
            recovery_threshold: parse_var("RECOVERY_THRESHOLD", defaults.recovery_threshold)?,
            cooldown_seconds: parse_var("COOLDOWN_SECONDS", defaults.cooldown_seconds)?,
            bucket_ttl_seconds: parse_var("BUCKET_TTL_SECONDS", defaults.bucket_ttl_seconds)?,
            ingest_max_in_flight: parse_var(
                "INGEST_MAX_IN_FLIGHT",
                defaults.ingest_max_in_flight,
            )?,
            enrich_workers: parse_var("ENRICH_WORKERS", defaults.enrich_workers)?,
            llm_timeout_seconds: parse_var("LLM_TIMEOUT_SECONDS", defaults.llm_timeout_seconds)?,
            llm_provider: match std::env::var("LLM_PROVIDER") {
                Ok(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
                    name: "LLM_PROVIDER",
                    value: raw,
                })?,
                Err(_) => defaults.llm_provider,
            },
            gemini_api_key: optional_var("GEMINI_API_KEY"),
            openai_api_key: optional_var("OPENAI_API_KEY"),
            llm_base_url: optional_var("LLM_BASE_URL"),
        };

        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_interval_seconds == 0 {
            return Err(ConfigError::Constraint {
                name: "TICK_INTERVAL_SECONDS",
                constraint: "greater than zero",
                value: self.tick_interval_seconds.to_string(),
            });
        }
        if self.window_minutes_rate <= 0 {
            return Err(ConfigError::Constraint {
                name: "WINDOW_MINUTES_RATE",
                constraint: "greater than zero",
                value: self.window_minutes_rate.to_string(),
            });
        }
        // Buckets must outlive the longest evaluation window, otherwise the
        // detector reads partially-expired windows.
        if (self.bucket_ttl_seconds as i64) <= self.window_minutes_rate * 60 {
            return Err(ConfigError::Constraint {
                name: "BUCKET_TTL_SECONDS",
                constraint: "strictly greater than WINDOW_MINUTES_RATE * 60",
                value: self.bucket_ttl_seconds.to_string(),
            });
        }
        if self.enrich_workers == 0 {
            return Err(ConfigError::Constraint {
                name: "ENRICH_WORKERS",
                constraint: "greater than zero",
                value: self.enrich_workers.to_string(),
            });
        }
        if self.ingest_max_in_flight == 0 {
            return Err(ConfigError::Constraint {
                name: "INGEST_MAX_IN_FLIGHT",
                constraint: "greater than zero",
                value: self.ingest_max_in_flight.to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.tick_interval_seconds, 10);
        assert_eq!(cfg.rule_refresh_seconds, 10);
        assert_eq!(cfg.window_minutes_rate, 10);
        assert_eq!(cfg.min_consecutive_errors, 8);
        assert_eq!(cfg.recovery_threshold, 5);
        assert_eq!(cfg.cooldown_seconds, 600);
        assert_eq!(cfg.bucket_ttl_seconds, 1800);
        assert_eq!(cfg.ingest_max_in_flight, 256);
        assert_eq!(cfg.enrich_workers, 4);
        assert_eq!(cfg.llm_timeout_seconds, 15);
        assert_eq!(cfg.llm_provider, LlmProviderKind::Gemini);
        cfg.validate().unwrap();
    }

    #[test]
    fn test_ttl_must_cover_window() {
        let cfg = Config {
            bucket_ttl_seconds: 600,
            window_minutes_rate: 10,
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_zero_workers_rejected() {
        let cfg = Config {
            enrich_workers: 0,
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_provider_parsing() {
        assert_eq!(
            "gemini".parse::<LlmProviderKind>().unwrap(),
            LlmProviderKind::Gemini
        );
        assert_eq!(
            "OPENAI".parse::<LlmProviderKind>().unwrap(),
            LlmProviderKind::OpenAi
        );
        assert_eq!(
            "none".parse::<LlmProviderKind>().unwrap(),
            LlmProviderKind::None
        );
        assert!("mistral".parse::<LlmProviderKind>().is_err());
    }
}

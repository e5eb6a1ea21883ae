use std::env;

use uuid::Uuid;

use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Json,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub http_port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub hub_command_buffer: usize,
    pub hub_connection_buffer: usize,
    pub event_queue_capacity: usize,
    pub event_max_redeliveries: u32,
    pub event_redelivery_delay_ms: u64,
    pub audit_capacity: usize,
    pub fallback_speed_kmh: f64,
    pub candidate_provider_ids: Vec<Uuid>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_port: 3000,
            log_level: "info".to_string(),
            log_format: LogFormat::Compact,
            hub_command_buffer: 256,
            hub_connection_buffer: 64,
            event_queue_capacity: 1024,
            event_max_redeliveries: 5,
            event_redelivery_delay_ms: 100,
            audit_capacity: 256,
            fallback_speed_kmh: 30.0,
            candidate_provider_ids: Vec::new(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let _ = dotenvy::dotenv();
        let defaults = Self::default();

        let log_format = match env::var("LOG_FORMAT") {
            Ok(raw) => parse_log_format(&raw)?,
            Err(_) => defaults.log_format,
        };

        let fallback_speed_kmh = parse_or_default("FALLBACK_SPEED_KMH", defaults.fallback_speed_kmh)?;
        if fallback_speed_kmh <= 0.0 {
            return Err(AppError::Internal(
                "invalid FALLBACK_SPEED_KMH: must be > 0".to_string(),
            ));
        }

        Ok(Self {
            http_port: parse_or_default("HTTP_PORT", defaults.http_port)?,
            log_level: env::var("LOG_LEVEL").unwrap_or(defaults.log_level),
            log_format,
            hub_command_buffer: parse_or_default("HUB_COMMAND_BUFFER", defaults.hub_command_buffer)?,
            hub_connection_buffer: parse_or_default(
                "HUB_CONNECTION_BUFFER",
                defaults.hub_connection_buffer,
            )?,
            event_queue_capacity: parse_or_default(
                "EVENT_QUEUE_CAPACITY",
                defaults.event_queue_capacity,
            )?,
            event_max_redeliveries: parse_or_default(
                "EVENT_MAX_REDELIVERIES",
                defaults.event_max_redeliveries,
            )?,
            event_redelivery_delay_ms: parse_or_default(
                "EVENT_REDELIVERY_DELAY_MS",
                defaults.event_redelivery_delay_ms,
            )?,
            audit_capacity: parse_or_default("AUDIT_CAPACITY", defaults.audit_capacity)?,
            fallback_speed_kmh,
            candidate_provider_ids: match env::var("CANDIDATE_PROVIDER_IDS") {
                Ok(raw) => parse_uuid_list(&raw)?,
                Err(_) => defaults.candidate_provider_ids,
            },
        })
    }
}

fn parse_or_default<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|err| AppError::Internal(format!("invalid {key}: {err}"))),
        Err(_) => Ok(default),
    }
}

fn parse_log_format(raw: &str) -> Result<LogFormat, AppError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "compact" | "" => Ok(LogFormat::Compact),
        "json" => Ok(LogFormat::Json),
        other => Err(AppError::Internal(format!(
            "invalid LOG_FORMAT: {other}, expected compact/json"
        ))),
    }
}

fn parse_uuid_list(raw: &str) -> Result<Vec<Uuid>, AppError> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            Uuid::parse_str(part)
                .map_err(|err| AppError::Internal(format!("invalid CANDIDATE_PROVIDER_IDS: {err}")))
        })
        .collect()
}

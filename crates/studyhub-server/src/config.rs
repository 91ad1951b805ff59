use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};
use tracing::warn;

use studyhub_api::state::ServiceSettings;
use studyhub_gateway::dispatcher::Dispatcher;

const DEV_JWT_SECRET: &str = "dev-secret-change-me";

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub jwt_secret: String,
    pub fanout_buffer: usize,
    pub notify_queue: usize,
    pub page_limit_max: u32,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let jwt_secret = match std::env::var("STUDYHUB_JWT_SECRET") {
            Ok(secret) if !secret.is_empty() => secret,
            _ => {
                warn!("STUDYHUB_JWT_SECRET not set, using the development secret");
                DEV_JWT_SECRET.to_string()
            }
        };

        Ok(Self {
            host: std::env::var("STUDYHUB_HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: parsed("STUDYHUB_PORT", 3000)?,
            db_path: PathBuf::from(std::env::var("STUDYHUB_DB_PATH").unwrap_or_else(|_| "studyhub.db".into())),
            jwt_secret,
            fanout_buffer: parsed("STUDYHUB_FANOUT_BUFFER", Dispatcher::DEFAULT_BUFFER)?,
            notify_queue: parsed("STUDYHUB_NOTIFY_QUEUE", ServiceSettings::default().notify_queue)?,
            page_limit_max: parsed("STUDYHUB_PAGE_LIMIT_MAX", ServiceSettings::default().page_limit_max)?,
        })
    }

    pub fn service_settings(&self) -> ServiceSettings {
        ServiceSettings {
            page_limit_max: self.page_limit_max,
            notify_queue: self.notify_queue,
        }
    }
}

fn parsed<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} must be a number, got {:?}", key, raw)),
        Err(_) => Ok(default),
    }
}

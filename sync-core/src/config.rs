//! Process configuration (§6, §10.3).
//!
//! The teacher reads `env::var` at point of use; this collects the same
//! direct reads into one struct built once at startup so the binaries fail
//! fast instead of panicking deep inside a connector.

use std::env;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingVar(&'static str),
    #[error("environment variable {0} is not valid: {1}")]
    InvalidVar(&'static str, String),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub database_name: Option<String>,
    pub encryption_key: Vec<u8>,
    pub tick_interval: Duration,
    pub worker_id: String,
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::MissingVar(name))
}

fn optional(name: &'static str) -> Option<String> {
    env::var(name).ok()
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = required("DATABASE_URL")?;
        let database_name = optional("DATABASE_NAME");

        let encryption_key_hex = required("ENCRYPTION_KEY")?;
        let encryption_key = decode_hex(&encryption_key_hex)
            .map_err(|e| ConfigError::InvalidVar("ENCRYPTION_KEY", e))?;
        if encryption_key.len() != 32 {
            return Err(ConfigError::InvalidVar(
                "ENCRYPTION_KEY",
                format!("expected 32 bytes (AES-256), got {}", encryption_key.len()),
            ));
        }

        let tick_secs: u64 = match optional("SYNCD_TICK_SECS") {
            Some(s) => s
                .parse()
                .map_err(|_| ConfigError::InvalidVar("SYNCD_TICK_SECS", s))?,
            None => 60,
        };

        let worker_id = optional("SYNCD_WORKER_ID").unwrap_or_else(generate_worker_id);

        Ok(Config {
            database_url,
            database_name,
            encryption_key,
            tick_interval: Duration::from_secs(tick_secs),
            worker_id,
        })
    }
}

fn decode_hex(s: &str) -> Result<Vec<u8>, String> {
    if s.len() % 2 != 0 {
        return Err("odd-length hex string".to_string());
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(|e| e.to_string()))
        .collect()
}

fn generate_worker_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let bytes: [u8; 8] = rng.r#gen();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_hex() {
        assert_eq!(decode_hex("00ff").unwrap(), vec![0x00, 0xff]);
        assert!(decode_hex("0").is_err());
        assert!(decode_hex("zz").is_err());
    }
}

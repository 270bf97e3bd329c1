use crate::cache::RenditionSpec;
use crate::resolver::RenditionKind;
use anyhow::{Context, Result, anyhow};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_INLINE_SIZE: RenditionSpec = RenditionSpec {
    width: 1024,
    height: 0,
};
pub const DEFAULT_THUMB_SIZE: RenditionSpec = RenditionSpec {
    width: 100,
    height: 100,
};

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub cache_dir: PathBuf,
    pub db_max_connections: u32,
    pub max_in_flight_requests: usize,
    pub max_concurrent_renditions: usize,
    pub rendition_wait: Duration,
    pub renditions: RenditionSizes,
    pub route_overrides: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenditionSizes {
    pub inline: RenditionSpec,
    pub thumb: RenditionSpec,
}

impl Default for RenditionSizes {
    fn default() -> Self {
        Self {
            inline: DEFAULT_INLINE_SIZE,
            thumb: DEFAULT_THUMB_SIZE,
        }
    }
}

impl RenditionSizes {
    /// `None` for raw, which is served unscaled.
    pub fn spec_for(&self, kind: RenditionKind) -> Option<RenditionSpec> {
        match kind {
            RenditionKind::Raw => None,
            RenditionKind::Inline => Some(self.inline),
            RenditionKind::Thumb => Some(self.thumb),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = parse_u16("PORT", 8080);
        let db_path = PathBuf::from(
            env::var("LIBRARY_DB_PATH")
                .unwrap_or_else(|_| "/var/lib/photolib/photo.db".to_string()),
        );
        let cache_dir = PathBuf::from(
            env::var("CACHE_DIR").unwrap_or_else(|_| "/var/cache/photolib".to_string()),
        );
        let db_max_connections = parse_u32("DB_MAX_CONNECTIONS", 5).max(1);
        let max_in_flight_requests = parse_usize("MAX_IN_FLIGHT_REQUESTS", 256);
        let default_renditions = std::thread::available_parallelism()
            .map(|count| count.get())
            .unwrap_or(4);
        let max_concurrent_renditions =
            parse_usize("MAX_CONCURRENT_RENDITIONS", default_renditions).max(1);
        let rendition_wait = Duration::from_secs(parse_u64("RENDITION_WAIT_SECONDS", 30));
        let renditions = RenditionSizes {
            inline: parse_rendition_env("INLINE_SIZE", DEFAULT_INLINE_SIZE)?,
            thumb: parse_rendition_env("THUMB_SIZE", DEFAULT_THUMB_SIZE)?,
        };
        let route_overrides = match env::var("ROUTES") {
            Ok(raw) if !raw.trim().is_empty() => parse_json::<HashMap<String, String>>(&raw)
                .context("ROUTES must be a JSON object of endpoint to pattern")?,
            _ => HashMap::new(),
        };

        Ok(Self {
            host,
            port,
            db_path,
            cache_dir,
            db_max_connections,
            max_in_flight_requests,
            max_concurrent_renditions,
            rendition_wait,
            renditions,
            route_overrides,
        })
    }
}

/// Parses `WxH`; either side may be `0` to keep the aspect ratio.
pub fn parse_rendition_spec(raw: &str) -> Result<RenditionSpec> {
    let trimmed = raw.trim().to_ascii_lowercase();
    let (width, height) = trimmed
        .split_once('x')
        .ok_or_else(|| anyhow!("rendition size must look like WIDTHxHEIGHT"))?;
    let width = width
        .trim()
        .parse::<u32>()
        .with_context(|| format!("invalid rendition width in {raw:?}"))?;
    let height = height
        .trim()
        .parse::<u32>()
        .with_context(|| format!("invalid rendition height in {raw:?}"))?;
    Ok(RenditionSpec { width, height })
}

fn parse_rendition_env(key: &str, default: RenditionSpec) -> Result<RenditionSpec> {
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => {
            parse_rendition_spec(&raw).with_context(|| format!("invalid {key}"))
        }
        _ => Ok(default),
    }
}

fn parse_u16(key: &str, default: u16) -> u16 {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn parse_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn parse_json<T: DeserializeOwned>(raw: &str) -> Result<T> {
    Ok(serde_json::from_str(raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, OnceLock};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    fn with_env_lock<F: FnOnce()>(f: F) {
        let lock = ENV_LOCK.get_or_init(|| Mutex::new(()));
        let _guard = lock.lock().unwrap_or_else(|err| err.into_inner());
        f();
    }

    fn clear_env() {
        for key in [
            "INLINE_SIZE",
            "THUMB_SIZE",
            "ROUTES",
            "CACHE_DIR",
            "LIBRARY_DB_PATH",
        ] {
            unsafe { env::remove_var(key) };
        }
    }

    #[test]
    fn rendition_spec_parses_both_axes() {
        let spec = parse_rendition_spec(" 640X0 ").unwrap();
        assert_eq!(
            spec,
            RenditionSpec {
                width: 640,
                height: 0
            }
        );
        assert!(parse_rendition_spec("640").is_err());
        assert!(parse_rendition_spec("ax10").is_err());
        assert!(parse_rendition_spec("-1x10").is_err());
    }

    #[test]
    fn from_env_uses_documented_defaults() {
        with_env_lock(|| {
            clear_env();
            let config = Config::from_env().unwrap();
            assert_eq!(config.renditions.inline, DEFAULT_INLINE_SIZE);
            assert_eq!(config.renditions.thumb, DEFAULT_THUMB_SIZE);
            assert_eq!(config.cache_dir, PathBuf::from("/var/cache/photolib"));
            assert!(config.route_overrides.is_empty());
            assert!(config.max_concurrent_renditions >= 1);
        });
    }

    #[test]
    fn from_env_reads_overrides() {
        with_env_lock(|| {
            clear_env();
            unsafe { env::set_var("THUMB_SIZE", "200x0") };
            unsafe { env::set_var("ROUTES", r#"{"events":"/gallery"}"#) };
            let config = Config::from_env().unwrap();
            assert_eq!(
                config.renditions.thumb,
                RenditionSpec {
                    width: 200,
                    height: 0
                }
            );
            assert_eq!(
                config.route_overrides.get("events").map(String::as_str),
                Some("/gallery")
            );
            clear_env();
        });
    }

    #[test]
    fn from_env_rejects_bad_sizes() {
        with_env_lock(|| {
            clear_env();
            unsafe { env::set_var("INLINE_SIZE", "wide") };
            assert!(Config::from_env().is_err());
            clear_env();
        });
    }

    #[test]
    fn spec_for_raw_is_none() {
        let sizes = RenditionSizes::default();
        assert_eq!(sizes.spec_for(RenditionKind::Raw), None);
        assert_eq!(sizes.spec_for(RenditionKind::Thumb), Some(DEFAULT_THUMB_SIZE));
        assert_eq!(sizes.spec_for(RenditionKind::Inline), Some(DEFAULT_INLINE_SIZE));
    }
}

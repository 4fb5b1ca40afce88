//! Configuration.
//!
//! A deployment has two layers of settings: `data`, fixed when the device was
//! set up (host, port, ...), and `options`, which may be changed later. Every
//! field is resolved once, in this order: options, then data, then the
//! built-in default.

use serde_derive::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{BridgeError, Result};
use crate::registers::{WallboxModel, MAX_WALLBOXES};

pub const DEFAULT_PORT: u16 = 502;
pub const DEFAULT_UNIT_ID: u8 = 1;
pub const DEFAULT_REGISTER_OFFSET: i8 = 0;
pub const DEFAULT_SCAN_INTERVAL: u64 = 5;
pub const DEFAULT_WALLBOXES: u8 = 1;

pub const REGISTER_OFFSET_RANGE: std::ops::RangeInclusive<i64> = -2..=2;
pub const SCAN_INTERVAL_RANGE: std::ops::RangeInclusive<i64> = 2..=60;

/// One source of settings. Anything left `None` falls through to the next layer.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigLayer {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub unit_id: Option<u8>,
    pub register_offset: Option<i64>,
    pub scan_interval: Option<i64>,
    pub wallboxes: Option<i64>,
    pub wallbox_model: Option<String>,
}

impl ConfigLayer {
    /// Reads the `E3DC_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            host: env::var("E3DC_HOST").ok().filter(|h| !h.trim().is_empty()),
            port: env_parse("E3DC_PORT")?,
            unit_id: env_parse("E3DC_UNIT_ID")?,
            register_offset: env_parse("E3DC_REGISTER_OFFSET")?,
            scan_interval: env_parse("E3DC_SCAN_INTERVAL")?,
            wallboxes: env_parse("E3DC_WALLBOXES")?,
            wallbox_model: env::var("E3DC_WALLBOX_MODEL").ok(),
        })
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            BridgeError::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        serde_json::from_str(&contents).map_err(|e| {
            BridgeError::Configuration(format!("cannot parse {}: {e}", path.display()))
        })
    }
}

fn env_parse<T: FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) if raw.trim().is_empty() => Ok(None),
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| BridgeError::Configuration(format!("{name}=`{raw}`: {e}"))),
        Err(_) => Ok(None),
    }
}

/// Fully resolved settings for one device.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub unit_id: u8,
    pub register_offset: i8,
    pub scan_interval: Duration,
    pub wallboxes: u8,
    pub wallbox_model: WallboxModel,
}

impl Config {
    /// Resolves `options` over `data` over the defaults and checks every range.
    pub fn resolve(data: &ConfigLayer, options: &ConfigLayer) -> Result<Self> {
        let host = options
            .host
            .clone()
            .or_else(|| data.host.clone())
            .ok_or_else(|| BridgeError::Configuration("host is required".into()))?;

        let register_offset = pick(options.register_offset, data.register_offset)
            .unwrap_or(i64::from(DEFAULT_REGISTER_OFFSET));
        let scan_interval = pick(options.scan_interval, data.scan_interval)
            .unwrap_or(DEFAULT_SCAN_INTERVAL as i64);
        let wallboxes =
            pick(options.wallboxes, data.wallboxes).unwrap_or(i64::from(DEFAULT_WALLBOXES));
        let wallbox_model = match options.wallbox_model.as_ref().or(data.wallbox_model.as_ref()) {
            Some(name) => name.parse()?,
            None => WallboxModel::default(),
        };

        Ok(Self {
            host,
            port: pick(options.port, data.port).unwrap_or(DEFAULT_PORT),
            unit_id: pick(options.unit_id, data.unit_id).unwrap_or(DEFAULT_UNIT_ID),
            register_offset: in_range("register_offset", register_offset, REGISTER_OFFSET_RANGE)?
                as i8,
            scan_interval: Duration::from_secs(
                in_range("scan_interval", scan_interval, SCAN_INTERVAL_RANGE)? as u64,
            ),
            wallboxes: in_range("wallboxes", wallboxes, 0..=i64::from(MAX_WALLBOXES))? as u8,
            wallbox_model,
        })
    }

    /// Config with defaults for everything but the host.
    pub fn for_host(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
            unit_id: DEFAULT_UNIT_ID,
            register_offset: DEFAULT_REGISTER_OFFSET,
            scan_interval: Duration::from_secs(DEFAULT_SCAN_INTERVAL),
            wallboxes: DEFAULT_WALLBOXES,
            wallbox_model: WallboxModel::default(),
        }
    }
}

fn pick<T>(option: Option<T>, data: Option<T>) -> Option<T> {
    option.or(data)
}

fn in_range(field: &str, value: i64, range: std::ops::RangeInclusive<i64>) -> Result<i64> {
    if range.contains(&value) {
        Ok(value)
    } else {
        Err(BridgeError::Configuration(format!(
            "{field} must be between {} and {}, got {value}",
            range.start(),
            range.end()
        )))
    }
}

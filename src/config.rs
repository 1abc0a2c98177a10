//! Runtime configuration.
//!
//! Loaded from a TOML file in the user's config directory (overridable via
//! `PODLINK_CONFIG_PATH`); a default file is written on first use. Timing
//! defaults mirror the named constants in [`crate::coordinator`].

use std::{env, fs, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use crate::{
   coordinator::{INTER_SCAN_PAUSE, SCAN_WINDOW},
   error::{PodLinkError, Result},
};

/// Main configuration structure.
#[derive(Serialize, Deserialize, Clone)]
pub struct Config {
   /// Adapter to scan on; the default adapter when unset.
   #[serde(default)]
   pub adapter: Option<SmolStr>,

   #[serde(default)]
   pub known_devices: Vec<KnownDevice>,

   /// Length of one BLE discovery window, in seconds.
   #[serde(default = "default_scan_window")]
   pub scan_window_secs: u64,

   /// Pause between scan iterations, in seconds.
   #[serde(default = "default_scan_pause")]
   pub scan_pause_secs: u64,

   /// Log filter hint for the embedding process.
   #[serde(default)]
   pub log_filter: Option<SmolStr>,
}

/// A device the user has named.
#[derive(Serialize, Deserialize, Clone)]
pub struct KnownDevice {
   pub address: String,
   pub name: String,
}

const fn default_scan_window() -> u64 {
   SCAN_WINDOW.as_secs()
}

const fn default_scan_pause() -> u64 {
   INTER_SCAN_PAUSE.as_secs()
}

impl Default for Config {
   fn default() -> Self {
      Self {
         adapter: None,
         known_devices: vec![],
         scan_window_secs: default_scan_window(),
         scan_pause_secs: default_scan_pause(),
         log_filter: None,
      }
   }
}

impl Config {
   /// Loads configuration from disk, creating the default on first use.
   pub fn load() -> Result<Self> {
      let config_path = Self::config_path()?;

      if config_path.exists() {
         let contents = fs::read_to_string(&config_path)?;
         Ok(toml::from_str(&contents)?)
      } else {
         let config = Self::default();
         config.save()?;
         Ok(config)
      }
   }

   /// Saves the current configuration to disk.
   pub fn save(&self) -> Result<()> {
      let config_path = Self::config_path()?;

      if let Some(parent) = config_path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(&config_path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      if let Ok(path) = env::var("PODLINK_CONFIG_PATH") {
         return Ok(PathBuf::from(path));
      }

      Ok(dirs::config_dir()
         .ok_or(PodLinkError::ConfigDirNotFound)?
         .join("podlink")
         .join("config.toml"))
   }

   /// Checks if the given address is a known device and returns its name.
   pub fn is_known_device(&self, address: &str) -> Option<&str> {
      self
         .known_devices
         .iter()
         .find(|device| device.address.eq_ignore_ascii_case(address))
         .map(|device| device.name.as_str())
   }

   pub fn scan_window(&self) -> Duration {
      Duration::from_secs(self.scan_window_secs)
   }

   pub fn scan_pause(&self) -> Duration {
      Duration::from_secs(self.scan_pause_secs)
   }
}

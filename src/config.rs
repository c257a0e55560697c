//! Configuration management for the hub service.
//!
//! This module handles loading and saving configuration from disk,
//! including the default scan window and the optional startup hub.

use std::{env, fs, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::{HubError, Result};

/// Main configuration structure for the service.
#[derive(Serialize, Deserialize, Clone)]
pub struct Config {
   #[serde(default = "default_scan_timeout")]
   pub scan_timeout_sec: u64,

   /// Hub to connect to when the service starts, if any.
   #[serde(default)]
   pub auto_connect_address: Option<String>,
}

const fn default_scan_timeout() -> u64 {
   5
}

impl Default for Config {
   fn default() -> Self {
      Self {
         scan_timeout_sec: default_scan_timeout(),
         auto_connect_address: None,
      }
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      let config_path = Self::config_path()?;

      if config_path.exists() {
         let contents = fs::read_to_string(&config_path)?;
         Ok(toml::from_str(&contents)?)
      } else {
         // Create default config
         let config = Self::default();
         config.save()?;
         Ok(config)
      }
   }

   /// Saves the current configuration to disk.
   pub fn save(&self) -> Result<()> {
      let config_path = Self::config_path()?;

      // Ensure directory exists
      if let Some(parent) = config_path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(&config_path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(home) = env::var("PYBRICKSD_HOME") {
         PathBuf::from(home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else if let Ok(home) = env::var("HOME") {
         PathBuf::from(home).join(".config")
      } else {
         return Err(HubError::ConfigDirNotFound);
      };

      Ok(config_dir.join("pybricksd").join("config.toml"))
   }

   /// Default discovery window for a top-level scan.
   pub const fn scan_timeout(&self) -> Duration {
      Duration::from_secs(self.scan_timeout_sec)
   }
}

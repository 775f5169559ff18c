//! Configuration management for the handoff service.
//!
//! This module handles loading and saving configuration from disk: which
//! accessory to arbitrate, the takeover policy and the stem bindings.

use std::{
   env, fs,
   path::{Path, PathBuf},
   str::FromStr,
   time::Duration,
};

use bluer::Address;
use serde::{Deserialize, Serialize};

use crate::{
   airpods::{
      arbitrator::{ArbitratorConfig, TakeoverPolicy},
      stem::StemConfig,
   },
   error::{HandoffError, Result},
};

/// Main configuration structure for the service.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Config {
   /// Accessory to arbitrate; the first paired accessory when unset.
   #[serde(default)]
   pub device_address: Option<String>,

   /// Address peers know this controller by; the adapter address when unset.
   #[serde(default)]
   pub self_address: Option<String>,

   #[serde(default = "default_cooldown_ms")]
   pub cooldown_ms: u64,

   #[serde(default = "default_claim_timeout_ms")]
   pub claim_timeout_ms: u64,

   #[serde(default = "default_disappear_timeout")]
   pub disappear_timeout_sec: u64,

   /// Open the session as soon as the accessory broadcasts that nobody is connected.
   #[serde(default)]
   pub connect_when_unclaimed: bool,

   #[serde(default)]
   pub takeover: TakeoverPolicy,

   #[serde(default)]
   pub stem: StemConfig,
}

const fn default_cooldown_ms() -> u64 {
   3000
}

const fn default_claim_timeout_ms() -> u64 {
   5000
}

const fn default_disappear_timeout() -> u64 {
   10
}

impl Default for Config {
   fn default() -> Self {
      Self {
         device_address: None,
         self_address: None,
         cooldown_ms: default_cooldown_ms(),
         claim_timeout_ms: default_claim_timeout_ms(),
         disappear_timeout_sec: default_disappear_timeout(),
         connect_when_unclaimed: false,
         takeover: TakeoverPolicy::default(),
         stem: StemConfig::default(),
      }
   }
}

fn parse_address(s: &str) -> Result<Address> {
   Address::from_str(s).map_err(|_| HandoffError::InvalidAddress(s.to_string()))
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      Self::load_from(&Self::config_path()?)
   }

   pub fn load_from(path: &Path) -> Result<Self> {
      if path.exists() {
         let contents = fs::read_to_string(path)?;
         Ok(toml::from_str(&contents)?)
      } else {
         // Create default config
         let config = Self::default();
         config.save_to(path)?;
         Ok(config)
      }
   }

   pub fn save_to(&self, path: &Path) -> Result<()> {
      // Ensure directory exists
      if let Some(parent) = path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(airpods_home) = env::var("AIRPODS_HOME") {
         PathBuf::from(airpods_home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else if let Ok(home) = env::var("HOME") {
         PathBuf::from(home).join(".config")
      } else {
         return Err(HandoffError::ConfigDirNotFound);
      };

      Ok(config_dir.join("kairpods-handoff").join("config.toml"))
   }

   pub fn device_address(&self) -> Result<Option<Address>> {
      self.device_address.as_deref().map(parse_address).transpose()
   }

   pub fn self_address(&self) -> Result<Option<Address>> {
      self.self_address.as_deref().map(parse_address).transpose()
   }

   pub fn disappear_timeout(&self) -> Duration {
      Duration::from_secs(self.disappear_timeout_sec)
   }

   /// Builds the arbitrator settings for this controller's address.
   pub fn arbitrator(&self, self_mac: Address) -> ArbitratorConfig {
      ArbitratorConfig {
         self_mac,
         policy: self.takeover,
         cooldown: Duration::from_millis(self.cooldown_ms),
         claim_timeout: Duration::from_millis(self.claim_timeout_ms),
         connect_when_unclaimed: self.connect_when_unclaimed,
      }
   }
}

// Copyright (c) 2018 Nuclear Furnace
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.
//! Configuration loading: a base file selected by `SERVICE_ENV_SETTING`
//! (mirroring `zconfig.py`'s `ZConfig`), overridden by CLI flags. See
//! spec.md 6 and SPEC_FULL.md 1.3.

use std::path::PathBuf;

use serde::Deserialize;

use crate::backend::device::DeviceHint;
use crate::common::Protocol;
use crate::dfr::control::BackendAddr;
use crate::errors::ConfigError;

const ENV_VAR: &str = "SERVICE_ENV_SETTING";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Staging,
    Production,
}

impl Environment {
    fn file_stem(self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Staging => "staging",
            Environment::Production => "production",
        }
    }

    /// Reads `SERVICE_ENV_SETTING`, defaulting to `Development` when
    /// unset (matching `zconfig.py`'s fallback), and failing on any other
    /// value.
    pub fn from_env() -> Result<Self, ConfigError> {
        match std::env::var(ENV_VAR) {
            Err(std::env::VarError::NotPresent) => Ok(Environment::Development),
            Ok(ref s) if s.eq_ignore_ascii_case("DEVELOPMENT") => Ok(Environment::Development),
            Ok(ref s) if s.eq_ignore_ascii_case("STAGING") => Ok(Environment::Staging),
            Ok(ref s) if s.eq_ignore_ascii_case("PRODUCTION") => Ok(Environment::Production),
            other => Err(ConfigError::InvalidEnvSetting(other.ok())),
        }
    }
}

/// Topology selector (spec.md 1: LBS vs. DFR).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Topology {
    Lbs,
    Dfr,
}

/// The full set of file-or-flag-supplied settings, matching
/// `helper.py::get_args_parser`'s flag list (SPEC_FULL.md 5).
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub model_dir: PathBuf,
    pub model_name: Option<String>,

    #[serde(default = "default_gpu_memory_fraction")]
    pub gpu_memory_fraction: f32,
    #[serde(default = "default_num_worker")]
    pub num_worker: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_batch_group_timeout_ms")]
    pub batch_group_timeout_ms: u64,
    #[serde(default)]
    pub cpu: bool,
    #[serde(default)]
    pub device_map: Vec<i32>,

    #[serde(default = "default_protocol")]
    pub protocol: Protocol,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_port_out")]
    pub port_out: u16,

    #[serde(default)]
    pub topology: Option<Topology>,
    #[serde(default)]
    pub clients_per_backend: Option<usize>,
    #[serde(default)]
    pub remote_servers: Vec<BackendAddr>,

    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    #[serde(default)]
    pub verbose: bool,
}

fn default_gpu_memory_fraction() -> f32 { 0.2 }
fn default_num_worker() -> usize { 1 }
fn default_batch_size() -> usize { 10 }
fn default_batch_group_timeout_ms() -> u64 { 1 }
fn default_protocol() -> Protocol { Protocol::Obj }
fn default_port() -> u16 { 5555 }
fn default_port_out() -> u16 { 5556 }

impl AppConfig {
    /// Loads the environment-selected config file, if one is present
    /// under `config_root`, then validates the merged result.
    pub fn load(config_root: &std::path::Path) -> Result<Self, ConfigError> {
        let env = Environment::from_env()?;
        let path = config_root.join(format!("{}.json", env.file_stem()));

        let builder = config::Config::builder().add_source(config::File::from(path).required(false));
        let settings = builder.build()?;
        let parsed: AppConfig = settings.try_deserialize()?;
        parsed.validate()?;
        Ok(parsed)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.gpu_memory_fraction) {
            return Err(ConfigError::InvalidMemoryFraction(self.gpu_memory_fraction));
        }
        Ok(())
    }

    /// Resolves the CLI's `-cpu`/`-device_map` flags into a `DeviceHint`
    /// for the device mapper (C10), matching `_get_device_map`'s priority
    /// of explicit device list over auto-probing, and CPU-only overriding
    /// both.
    pub fn device_hint(&self) -> DeviceHint {
        if self.cpu {
            DeviceHint::CpuOnly
        } else if !self.device_map.is_empty() {
            DeviceHint::Explicit(self.device_map.clone())
        } else {
            DeviceHint::Auto
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_env_selected_file_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("development.json"),
            r#"{"model_dir":"/models/dev","num_worker":4,"batch_size":32}"#,
        )
        .unwrap();

        std::env::remove_var(ENV_VAR);
        let config = AppConfig::load(dir.path()).unwrap();
        assert_eq!(config.model_dir, PathBuf::from("/models/dev"));
        assert_eq!(config.num_worker, 4);
        assert_eq!(config.batch_size, 32);
        // unspecified fields still fall back to their defaults.
        assert_eq!(config.port, default_port());
    }

    #[test]
    fn rejects_out_of_range_memory_fraction() {
        let config = AppConfig {
            model_dir: PathBuf::from("/models"),
            model_name: None,
            gpu_memory_fraction: 1.5,
            num_worker: 1,
            batch_size: 1,
            batch_group_timeout_ms: 1,
            cpu: false,
            device_map: vec![],
            protocol: Protocol::Obj,
            port: 5555,
            port_out: 5556,
            topology: None,
            clients_per_backend: None,
            remote_servers: vec![],
            log_dir: None,
            verbose: false,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn device_hint_prefers_cpu_over_explicit_map() {
        let mut config_cpu_only = |cpu: bool, device_map: Vec<i32>| AppConfig {
            model_dir: PathBuf::from("/models"),
            model_name: None,
            gpu_memory_fraction: 0.2,
            num_worker: 1,
            batch_size: 1,
            batch_group_timeout_ms: 1,
            cpu,
            device_map,
            protocol: Protocol::Obj,
            port: 5555,
            port_out: 5556,
            topology: None,
            clients_per_backend: None,
            remote_servers: vec![],
            log_dir: None,
            verbose: false,
        };

        assert_eq!(config_cpu_only(true, vec![0, 1]).device_hint(), DeviceHint::CpuOnly);
        assert_eq!(config_cpu_only(false, vec![0, 1]).device_hint(), DeviceHint::Explicit(vec![0, 1]));
        assert_eq!(config_cpu_only(false, vec![]).device_hint(), DeviceHint::Auto);
    }
}

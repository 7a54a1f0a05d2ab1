use chrono_tz::Tz;
use envconfig::Envconfig;
use evcharge_core::{
    charge_plan::PlanLabels,
    controller::ChargingMode,
    services::{
        nordpool, persistent_state,
        tesla::{api as tesla_api, VehicleId},
    },
    settings::ChargeSettings,
};
use serde::Deserialize;
use serde_yml::{Mapping, Value};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::logging;

#[derive(Envconfig)]
pub struct Environment {
    #[envconfig(from = "CONFIG_FILE")]
    pub config_file: PathBuf,

    #[envconfig(from = "SECRETS_FILE")]
    pub secrets_file: Option<PathBuf>,
}

fn load_file(filename: &Path) -> Result<Value, Error> {
    let f = std::fs::File::open(filename).map_err(|e| Error::File(filename.to_path_buf(), e))?;
    let config: Value =
        serde_yml::from_reader(f).map_err(|e| Error::Yaml(filename.to_path_buf(), e))?;

    Ok(config)
}

impl Environment {
    pub fn config(&self) -> Result<Config, Error> {
        let config = load_file(&self.config_file)?;

        let config = if let Some(secrets_file) = &self.secrets_file {
            let secrets = load_file(secrets_file)?;
            merge_yaml(config, secrets)?
        } else {
            config
        };

        let config: Config = serde_yml::from_value(config)
            .map_err(|e| Error::Yaml(self.config_file.clone(), e))?;

        Ok(config)
    }

    /// Load the environment from the environment variables.
    pub fn load() -> Result<Self, envconfig::Error> {
        Self::init_from_env()
    }
}

#[derive(Deserialize)]
pub struct HomeConfig {
    pub latitude: f64,
    pub longitude: f64,
    pub timezone: Tz,
}

#[derive(Deserialize)]
pub struct VehicleConfig {
    /// Used to name the state files.
    pub id: String,
    pub name: String,
    pub vehicle_id: VehicleId,
    #[serde(default)]
    pub charge_mode: ChargingMode,
    pub settings: ChargeSettings,
    #[serde(default)]
    pub labels: PlanLabels,
}

#[derive(Deserialize)]
pub struct Config {
    pub logging: logging::Config,
    pub persistent_state: persistent_state::Config,
    #[serde(default)]
    pub tesla: tesla_api::Config,
    #[serde(default)]
    pub nordpool: nordpool::Config,
    pub home: HomeConfig,
    pub vehicles: Vec<VehicleConfig>,
}

/// An error loading the Config
#[derive(Error, Debug)]
pub enum Error {
    /// Error reading the file
    #[error("Error reading file {0}: {1}")]
    File(PathBuf, std::io::Error),

    /// Error reading the file
    #[error("Error parsing file {0}: {1}")]
    Yaml(PathBuf, serde_yml::Error),

    /// Error merging the files
    #[error("Types do not match {0} != {1}")]
    Merge(String, String),
}

/// Merge two YAML values, values in `b` win.
///
/// A null in `b` removes the key.
fn merge_yaml(a: Value, b: Value) -> Result<Value, Error> {
    #[allow(clippy::match_same_arms)]
    match (a, b) {
        (Value::Mapping(mut a), Value::Mapping(b)) => {
            let mut r = Mapping::new();
            for (k, vb) in b {
                let va = a.remove(k.clone()).unwrap_or(Value::Null);
                if !vb.is_null() {
                    r.insert(k.clone(), merge_yaml(va, vb)?);
                }
            }
            for (k, va) in a {
                if !va.is_null() {
                    r.insert(k, va);
                }
            }

            Ok(Value::Mapping(r))
        }
        (Value::Number(_), b @ Value::Number(_)) => Ok(b),
        (Value::String(_), b @ Value::String(_)) => Ok(b),
        (Value::Sequence(_), b @ Value::Sequence(_)) => Ok(b),
        (Value::Bool(_), b @ Value::Bool(_)) => Ok(b),
        (Value::Null, b) => Ok(b),
        (_, b @ Value::Null) => Ok(b),
        (a, b) => Err(Error::Merge(
            serde_yml::to_string(&a).unwrap_or_default(),
            serde_yml::to_string(&b).unwrap_or_default(),
        )),
    }
}

//! Save persistent state to disk
use std::{io::Write, marker::PhantomData, path::PathBuf};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur when using a `PersistentState`.
#[derive(Error, Debug)]
pub enum Error {
    /// An IO error occurred.
    #[error("IO error file {0}: {1}")]
    IoError(String, std::io::Error),

    /// An error occurred while serializing or deserializing JSON.
    #[error("JSON error file {0}: {1}")]
    JsonError(String, serde_json::Error),
}

/// Where to keep the state files.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Directory holding one JSON file per row.
    pub state_path: PathBuf,
}

/// This is used to save state.
#[derive(Debug)]
pub struct PersistentStateDatabase {
    path: PathBuf,
}

impl PersistentStateDatabase {
    /// Create a new `PersistentState` instance.
    ///
    /// # Errors
    ///
    /// This function will return an error if the directory does not exist and cannot be
    /// created.
    pub fn new(config: &Config) -> Result<PersistentStateDatabase, Error> {
        let path = config.state_path.clone();

        if !path.is_dir() {
            std::fs::create_dir_all(&path)
                .map_err(|e| Error::IoError(path.to_string_lossy().to_string(), e))?;
        }

        Ok(PersistentStateDatabase { path })
    }

    /// Get a `PersistentState` instance for a given vehicle and name.
    #[must_use]
    pub fn for_name<T>(&self, id: &str, name: &str) -> PersistentStateRow<T>
    where
        T: Serialize + DeserializeOwned,
    {
        let name = format!("{id}_{name}").replace('/', "_");
        let name = format!("{name}.json");
        let path = self.path.join(name);
        PersistentStateRow::new(path)
    }
}

/// This is used to save state.
#[derive(Debug)]
pub struct PersistentStateRow<T: Serialize + DeserializeOwned> {
    path: PathBuf,
    phantom: PhantomData<T>,
}

impl<T: Serialize + DeserializeOwned> PersistentStateRow<T> {
    const fn new(path: PathBuf) -> Self {
        PersistentStateRow {
            path,
            phantom: PhantomData,
        }
    }

    /// Save a value to disk.
    ///
    /// # Errors
    ///
    /// This function will return an error if the value cannot be serialized to JSON or if the file
    /// cannot be written.
    pub fn save(&self, value: &T) -> Result<(), Error> {
        let tmp_file = self.path.with_extension("tmp");

        let file = std::fs::File::create(&tmp_file)
            .map_err(|e| Error::IoError(tmp_file.to_string_lossy().to_string(), e))?;

        let mut writer = std::io::BufWriter::new(file);
        serde_json::to_writer(&mut writer, value)
            .map_err(|e| Error::JsonError(tmp_file.to_string_lossy().to_string(), e))?;

        writer
            .flush()
            .map_err(|e| Error::IoError(tmp_file.to_string_lossy().to_string(), e))?;

        std::fs::rename(tmp_file, &self.path)
            .map_err(|e| Error::IoError(self.path.to_string_lossy().to_string(), e))?;

        Ok(())
    }

    /// Load a value from disk.
    ///
    /// # Errors
    ///
    /// This function will return an error if the file cannot be read or if the value cannot be
    /// deserialized from JSON.
    pub fn load(&self) -> Result<T, Error> {
        let file = std::fs::File::open(&self.path)
            .map_err(|e| Error::IoError(self.path.to_string_lossy().to_string(), e))?;
        let reader = std::io::BufReader::new(file);
        let value = serde_json::from_reader(reader)
            .map_err(|e| Error::JsonError(self.path.to_string_lossy().to_string(), e))?;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[derive(Serialize, Deserialize, Debug, PartialEq, Default)]
    struct Row {
        meter_power: f64,
        mode: String,
    }

    #[test]
    fn test_save_load() {
        let state_path = std::env::temp_dir().join(format!("evcharge-state-{}", std::process::id()));
        let config = Config { state_path };
        let psd = PersistentStateDatabase::new(&config).unwrap();
        let psr = psd.for_name::<Row>("car/1", "controller");

        assert!(matches!(psr.load(), Err(Error::IoError(_, _))));

        let row = Row {
            meter_power: 12.5,
            mode: "automatic".into(),
        };
        psr.save(&row).unwrap();
        assert_eq!(psr.load().unwrap(), row);

        std::fs::remove_dir_all(&config.state_path).unwrap();
    }
}

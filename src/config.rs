//! TOML configuration loading.
//!
//! Every workflow config and [`SweepSpec`](crate::experiment::SweepSpec)
//! derives `Deserialize` with per-field defaults, so partial files work;
//! this module only supplies the file-to-struct plumbing.

use crate::error::ShgError;
use serde::de::DeserializeOwned;
use std::fs;
use std::path::Path;

/// Load any deserializable config struct from a TOML file.
pub fn from_toml_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T, ShgError> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)?;
    toml::from_str(&text)
        .map_err(|err| ShgError::Config(format!("{}: {err}", path.display())))
}

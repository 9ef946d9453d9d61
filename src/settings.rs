use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use ini::Ini;
use tokio::fs;

use crate::error::{Error, Result};

pub const DEFAULT_OUTPUT_LENGTH: usize = 10;

/// Global key/value settings, loaded once at startup from a properties-style
/// file. Cheap to clone and hand to every component.
#[derive(Clone)]
pub struct Settings {
    values: Arc<HashMap<String, String>>,
}

impl Settings {
    pub async fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).await.map_err(|err| {
            Error::Settings(format!("Can't read settings file {}: {err}", path.display()))
        })?;
        let ini = Ini::load_from_str(&content).map_err(|err| {
            Error::Settings(format!("Invalid settings file {}: {err}", path.display()))
        })?;

        let mut values = HashMap::new();
        for (_section, properties) in ini.iter() {
            for (key, value) in properties.iter() {
                values.insert(key.to_string(), value.to_string());
            }
        }

        Ok(Self {
            values: Arc::new(values),
        })
    }

    pub fn from_pairs<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        Self {
            values: Arc::new(pairs.into_iter().collect()),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(|value| value.as_str())
    }

    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }

    /// Base directory against which relative service paths are resolved.
    pub fn root_path(&self) -> PathBuf {
        PathBuf::from(self.get_or("root_path", ""))
    }

    /// Default domain suffix for services that only declare a subdomain.
    pub fn root_domain(&self) -> &str {
        self.get_or("root_domain", "localhost")
    }

    /// File name of the per-service settings document.
    pub fn service_json(&self) -> &str {
        self.get_or("service_json", "service.json")
    }

    pub fn service_list_path(&self) -> PathBuf {
        self.root_path()
            .join(self.get_or("service_list", "service_list.json"))
    }

    /// Capacity of the per-stream log buffers.
    pub fn output_length(&self) -> usize {
        self.get("output_length")
            .and_then(|value| value.parse().ok())
            .unwrap_or(DEFAULT_OUTPUT_LENGTH)
    }

    pub fn vcl_path(&self) -> PathBuf {
        PathBuf::from(self.get_or("vcl_path", "services.vcl"))
    }

    /// Command used to make the edge proxy pick up a regenerated route
    /// configuration.
    pub fn varnish_reload(&self) -> &str {
        self.get_or("varnish_reload", "sudo /usr/sbin/service varnish reload")
    }
}

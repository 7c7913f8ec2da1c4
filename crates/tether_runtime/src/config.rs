use serde::{Deserialize, Serialize};

pub const IN_MEMORY_URL: &str = "sqlite::memory:";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub database_url: String,
    /// Enforce `REFERENCES` constraints on the connection.
    pub foreign_keys: bool,
    pub create_if_missing: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: IN_MEMORY_URL.to_string(),
            foreign_keys: true,
            create_if_missing: true,
        }
    }
}

impl StoreConfig {
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = url.into();
        self
    }

    pub fn is_in_memory(&self) -> bool {
        self.database_url.contains(":memory:") || self.database_url.contains("mode=memory")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_in_memory_with_foreign_keys() {
        let config = StoreConfig::default();
        assert!(config.is_in_memory());
        assert!(config.foreign_keys);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: StoreConfig = serde_json::from_str(r#"{ "database_url": "sqlite://tether.db" }"#).unwrap();
        assert_eq!(config.database_url, "sqlite://tether.db");
        assert!(!config.is_in_memory());
        assert!(config.foreign_keys);
    }
}

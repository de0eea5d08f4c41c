use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Registry record of one storage node instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub name: String,
    pub id: String,
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub endpoints: Vec<String>,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub environment: String,
}

impl ServiceInfo {
    pub fn new(name: impl Into<String>, address: impl Into<String>, port: u16) -> Self {
        let name = name.into();
        Self {
            id: Self::new_instance_id(&name),
            name,
            address: address.into(),
            port,
            version: env!("CARGO_PKG_VERSION").to_string(),
            metadata: HashMap::new(),
            endpoints: Vec::new(),
            start_time: Utc::now(),
            environment: String::new(),
        }
    }

    /// `{name}-{hostname}-{unix_nanos}`
    pub fn new_instance_id(name: &str) -> String {
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());
        let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        format!("{}-{}-{}", name, host, nanos)
    }

    /// Base URL of the node. A `public_url` metadata entry wins over address and port.
    pub fn url(&self) -> String {
        if let Some(url) = self.metadata.get("public_url") {
            return url.trim_end_matches('/').to_string();
        }
        if self.address.starts_with("http://") || self.address.starts_with("https://") {
            return format!("{}:{}", self.address.trim_end_matches('/'), self.port);
        }
        format!("http://{}:{}", self.address, self.port)
    }
}

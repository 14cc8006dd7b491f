//! Broker connection settings.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub const TLS_PORT: u16 = 8883;
pub const PLAIN_PORT: u16 = 1883;
pub const DEFAULT_KEEPALIVE_SECS: u64 = 300;
pub const MIN_KEEPALIVE_SECS: u64 = 5;

/// One segment of a topic hash; brokers hand these out as numbers or strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TopicSegment {
    Number(u64),
    Text(String),
}

impl fmt::Display for TopicSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopicSegment::Number(n) => write!(f, "{}", n),
            TopicSegment::Text(s) => f.write_str(s),
        }
    }
}

/// A topic entry, rendered as `type/Group_<group>/Topic_<topic>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicHash {
    #[serde(rename = "type")]
    pub kind: String,
    pub group: TopicSegment,
    pub topic: TopicSegment,
}

impl TopicHash {
    pub fn render(&self) -> String {
        format!("{}/Group_{}/Topic_{}", self.kind, self.group, self.topic)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicHashes {
    pub publish: BTreeMap<String, TopicHash>,
    pub subscribe: BTreeMap<String, TopicHash>,
    #[serde(rename = "pub/sub")]
    pub pub_sub: BTreeMap<String, TopicHash>,
}

/// Connection settings for the telemetry broker.
///
/// Either certificate authentication (`connect_certs`, port 8883) or
/// username/password authentication (port 1883) is used.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub broker: String,
    #[serde(alias = "isCluster")]
    pub is_cluster: bool,
    pub client_id: String,
    #[serde(alias = "connectCerts")]
    pub connect_certs: bool,
    pub username: String,
    pub password: String,
    #[serde(alias = "ca_crt")]
    pub ca_certs: Option<PathBuf>,
    #[serde(alias = "group_1_crt")]
    pub certfile: Option<PathBuf>,
    #[serde(alias = "group_1_key")]
    pub keyfile: Option<PathBuf>,
    pub hashes: TopicHashes,
    /// Key into `hashes.publish` for combined payloads. Used verbatim as the
    /// topic when no such key exists.
    pub telemetry_topic: String,
    pub keepalive_secs: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            broker: "localhost".to_string(),
            is_cluster: false,
            client_id: "keypoint_gauge".to_string(),
            connect_certs: false,
            username: String::new(),
            password: String::new(),
            ca_certs: None,
            certfile: None,
            keyfile: None,
            hashes: TopicHashes::default(),
            telemetry_topic: "YOLOframe".to_string(),
            keepalive_secs: DEFAULT_KEEPALIVE_SECS,
        }
    }
}

impl ConnectionConfig {
    /// Read a JSON connection file. Certificate paths are resolved against
    /// the directory that holds the file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        let mut config: Self = serde_json::from_str(&contents)?;

        let base = path.parent().unwrap_or_else(|| Path::new(""));
        for file in [&mut config.ca_certs, &mut config.certfile, &mut config.keyfile] {
            if let Some(p) = file.as_mut() {
                if p.is_relative() {
                    *p = base.join(&*p);
                }
            }
        }

        tracing::info!(path = %path.display(), broker = %config.broker_host(), "loaded connection config");
        Ok(config)
    }

    /// Build a configuration from `MQTT_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            broker: lookup("MQTT_BROKER").unwrap_or(defaults.broker),
            username: lookup("MQTT_USERNAME").unwrap_or_default(),
            password: lookup("MQTT_PASSWORD").unwrap_or_default(),
            client_id: lookup("MQTT_CLIENT_ID").unwrap_or(defaults.client_id),
            connect_certs: lookup("MQTT_USE_CERTS").map(|v| v.eq_ignore_ascii_case("true")).unwrap_or(false),
            ca_certs: lookup("MQTT_CA_CERTS").map(PathBuf::from),
            certfile: lookup("MQTT_CERTFILE").map(PathBuf::from),
            keyfile: lookup("MQTT_KEYFILE").map(PathBuf::from),
            ..defaults
        }
    }

    /// Host name to connect to, with the `mqtt.` prefix for clusters.
    pub fn broker_host(&self) -> String {
        if self.is_cluster {
            format!("mqtt.{}", self.broker)
        } else {
            self.broker.clone()
        }
    }

    pub fn port(&self) -> u16 {
        if self.connect_certs {
            TLS_PORT
        } else {
            PLAIN_PORT
        }
    }

    pub fn publish_topic(&self, name: &str) -> Option<String> {
        self.hashes.publish.get(name).map(TopicHash::render)
    }

    /// Topic for combined payloads.
    pub fn telemetry_topic(&self) -> String {
        self.publish_topic(&self.telemetry_topic)
            .unwrap_or_else(|| self.telemetry_topic.clone())
    }

    /// Topics to subscribe to after each successful connect.
    pub fn subscribe_topics(&self) -> Vec<String> {
        self.hashes
            .subscribe
            .values()
            .chain(self.hashes.pub_sub.values())
            .map(TopicHash::render)
            .collect()
    }

    pub fn validate(&self) -> Result<()> {
        if self.broker.trim().is_empty() {
            return Err(Error::InvalidConfig("broker must not be empty".to_string()));
        }
        if self.client_id.trim().is_empty() {
            return Err(Error::InvalidConfig("client_id must not be empty".to_string()));
        }
        if self.keepalive_secs < MIN_KEEPALIVE_SECS {
            return Err(Error::InvalidConfig(format!(
                "keepalive_secs must be at least {}, got {}",
                MIN_KEEPALIVE_SECS, self.keepalive_secs
            )));
        }

        if self.connect_certs {
            let files = [("ca_certs", &self.ca_certs), ("certfile", &self.certfile), ("keyfile", &self.keyfile)];
            for (name, file) in files {
                match file {
                    Some(p) if p.is_file() => {}
                    Some(p) => {
                        return Err(Error::InvalidConfig(format!("{} not found: {}", name, p.display())));
                    }
                    None => return Err(Error::InvalidConfig(format!("{} is required with connect_certs", name))),
                }
            }
        } else if self.username.is_empty() || self.password.is_empty() {
            return Err(Error::InvalidConfig(
                "username and password are required without connect_certs".to_string(),
            ));
        }

        Ok(())
    }
}

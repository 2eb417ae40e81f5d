//! Rendered network settings, as sent to agents and the CPI

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;

/// Network properties a job can pin to one of its networks
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefaultProperty {
    Dns,
    Gateway,
}

impl DefaultProperty {
    pub const ALL: [DefaultProperty; 2] = [DefaultProperty::Dns, DefaultProperty::Gateway];
}

impl fmt::Display for DefaultProperty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DefaultProperty::Dns => write!(f, "dns"),
            DefaultProperty::Gateway => write!(f, "gateway"),
        }
    }
}

/// Settings for one network of one VM
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkSettings {
    pub ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
    #[serde(default)]
    pub cloud_properties: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns: Option<Vec<Ipv4Addr>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<Ipv4Addr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Vec<DefaultProperty>>,
}

/// Network name to rendered settings
pub type NetworkSettingsMap = BTreeMap<String, NetworkSettings>;

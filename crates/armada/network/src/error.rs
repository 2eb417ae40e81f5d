//! Network reservation errors

use std::net::Ipv4Addr;
use thiserror::Error;

/// Network errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NetworkError {
    #[error("Invalid range `{range}': a subnet needs more than one address")]
    InvalidRange { range: String },

    #[error("Invalid gateway {gateway} for `{range}': {reason}")]
    InvalidGateway {
        gateway: Ipv4Addr,
        range: String,
        reason: &'static str,
    },

    #[error("Reserved IP {ip} must be an available address (not gateway, etc.) inside the range")]
    InvalidReservedIp { ip: Ipv4Addr },

    #[error("Static IP {ip} must be an available address (not reserved) inside the range")]
    InvalidStaticIp { ip: Ipv4Addr },

    #[error("Invalid IP or IP range `{0}'")]
    InvalidIpSpan(String),

    #[error("Network `{network}' has overlapping subnets: `{range}'")]
    OverlappingSubnet { network: String, range: String },

    #[error("Not enough dynamic IPs in `{scope}'")]
    NoCapacity { scope: String },

    #[error("IP {ip} is not inside any subnet of the network")]
    NotInRange { ip: Ipv4Addr },

    #[error("IP {ip} does not belong to the dynamic pool")]
    NotDynamic { ip: Ipv4Addr },

    #[error("Invalid IP to release {ip}: neither in dynamic nor in static pool")]
    InvalidRelease { ip: Ipv4Addr },

    #[error("`{origin}' asked for a static IP {ip} but it's already reserved/in use")]
    AlreadyInUse { origin: String, ip: Ipv4Addr },

    #[error("`{origin}' asked for a static IP {ip} but it's in the dynamic pool")]
    WrongType { origin: String, ip: Ipv4Addr },

    #[error("`{origin}' asked for a dynamic IP but there were no more available")]
    NotEnoughCapacity { origin: String },

    #[error("`{origin}' failed to reserve {what}: {reason}")]
    Reservation {
        origin: String,
        what: String,
        reason: String,
    },
}

/// Result type for network operations
pub type Result<T> = std::result::Result<T, NetworkError>;

//! Binding of one instance to one network

use crate::reservation::Reservation;
use std::net::Ipv4Addr;

/// An instance's address on one network
///
/// A static network carries its manifest address from the start and only
/// needs the reservation confirmed; a dynamic one is unbound until the
/// compiler hands it an address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceNetwork {
    name: String,
    ip: Option<Ipv4Addr>,
    static_ip: bool,
    reserved: bool,
}

impl InstanceNetwork {
    pub fn dynamic(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ip: None,
            static_ip: false,
            reserved: false,
        }
    }

    pub fn with_static_ip(name: impl Into<String>, ip: Ipv4Addr) -> Self {
        Self {
            name: name.into(),
            ip: Some(ip),
            static_ip: true,
            reserved: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ip(&self) -> Option<Ipv4Addr> {
        self.ip
    }

    pub fn is_static(&self) -> bool {
        self.static_ip
    }

    pub fn is_reserved(&self) -> bool {
        self.reserved
    }

    /// Accept an address the live VM already holds
    ///
    /// Returns true if the address was accepted. A static network accepts
    /// only its own address; a dynamic network accepts a dynamic address
    /// while it is still unbound. Anything else leaves the binding untouched.
    pub fn use_reservation(&mut self, ip: Ipv4Addr, is_static: bool) -> bool {
        match self.ip {
            Some(bound) if bound == ip && is_static && self.static_ip => {
                self.reserved = true;
                true
            }
            None if !is_static && !self.static_ip => {
                self.ip = Some(ip);
                self.reserved = true;
                true
            }
            _ => false,
        }
    }

    /// Reservation request matching this binding
    pub fn reservation(&self) -> Reservation {
        match (self.static_ip, self.ip) {
            (true, Some(ip)) => Reservation::static_ip(ip),
            _ => Reservation::dynamic(),
        }
    }

    /// Take the address of a fulfilled reservation
    ///
    /// Returns false and leaves the binding unchanged if the reservation is
    /// not fulfilled or does not satisfy this network.
    pub fn bind(&mut self, reservation: &Reservation) -> bool {
        let accepted = self.reservation().take(reservation);
        match accepted.ip() {
            Some(ip) => {
                self.ip = Some(ip);
                self.reserved = true;
                true
            }
            None => false,
        }
    }

    /// Replace a dynamic address with another dynamic address
    ///
    /// Used when an instance adopts an idle VM that already holds an address
    /// on this network. Returns the address that was held before.
    pub fn rebind_dynamic(&mut self, ip: Ipv4Addr) -> Option<Ipv4Addr> {
        if self.static_ip {
            return None;
        }
        self.reserved = true;
        self.ip.replace(ip)
    }
}

//! One contiguous address range and its static/dynamic pools

use crate::error::{NetworkError, Result};
use crate::reservation::ReservationKind;
use crate::span::IpSpan;
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::net::Ipv4Addr;

/// Subnet as declared in a manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubnetSpec {
    pub range: Ipv4Net,
    #[serde(default)]
    pub gateway: Option<Ipv4Addr>,
    #[serde(default)]
    pub dns: Option<Vec<Ipv4Addr>>,
    #[serde(default)]
    pub cloud_properties: Value,
    #[serde(default)]
    pub reserved: Vec<IpSpan>,
    #[serde(default, rename = "static")]
    pub static_ips: Vec<IpSpan>,
}

impl SubnetSpec {
    pub fn new(range: Ipv4Net) -> Self {
        Self {
            range,
            gateway: None,
            dns: None,
            cloud_properties: Value::Object(Default::default()),
            reserved: Vec::new(),
            static_ips: Vec::new(),
        }
    }

    pub fn with_gateway(mut self, gateway: Ipv4Addr) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn with_dns(mut self, dns: Vec<Ipv4Addr>) -> Self {
        self.dns = Some(dns);
        self
    }

    pub fn with_reserved(mut self, span: IpSpan) -> Self {
        self.reserved.push(span);
        self
    }

    pub fn with_static(mut self, span: IpSpan) -> Self {
        self.static_ips.push(span);
        self
    }

    pub fn with_cloud_properties(mut self, cloud_properties: Value) -> Self {
        self.cloud_properties = cloud_properties;
        self
    }
}

/// Address pools of one subnet
///
/// `available_static` and `available_dynamic` are always disjoint, and the
/// gateway, network and broadcast addresses never enter either pool.
#[derive(Debug, Clone)]
pub struct AddressSubnet {
    range: Ipv4Net,
    gateway: Option<Ipv4Addr>,
    dns: Option<Vec<Ipv4Addr>>,
    cloud_properties: Value,
    available_dynamic: BTreeSet<u32>,
    available_static: BTreeSet<u32>,
    // Initial pools, used to route released addresses back where they came from
    dynamic_pool: BTreeSet<u32>,
    static_pool: BTreeSet<u32>,
}

impl AddressSubnet {
    pub fn new(spec: &SubnetSpec) -> Result<Self> {
        let range = spec.range.trunc();
        let first = u32::from(range.network());
        let last = u32::from(range.broadcast());

        if last <= first {
            return Err(NetworkError::InvalidRange {
                range: spec.range.to_string(),
            });
        }

        if let Some(gateway) = spec.gateway {
            if !range.contains(&gateway) {
                return Err(NetworkError::InvalidGateway {
                    gateway,
                    range: range.to_string(),
                    reason: "gateway must be inside the range",
                });
            }
        }

        let mut available_dynamic: BTreeSet<u32> = (first..=last).collect();
        available_dynamic.remove(&first);
        available_dynamic.remove(&last);
        if let Some(gateway) = spec.gateway {
            available_dynamic.remove(&u32::from(gateway));
        }

        for ip in spec.reserved.iter().flat_map(IpSpan::iter) {
            if !available_dynamic.remove(&u32::from(ip)) {
                return Err(NetworkError::InvalidReservedIp { ip });
            }
        }

        let mut available_static = BTreeSet::new();
        for ip in spec.static_ips.iter().flat_map(IpSpan::iter) {
            if !available_dynamic.remove(&u32::from(ip)) {
                return Err(NetworkError::InvalidStaticIp { ip });
            }
            available_static.insert(u32::from(ip));
        }

        Ok(Self {
            range,
            gateway: spec.gateway,
            dns: spec.dns.clone(),
            cloud_properties: spec.cloud_properties.clone(),
            dynamic_pool: available_dynamic.clone(),
            static_pool: available_static.clone(),
            available_dynamic,
            available_static,
        })
    }

    pub fn range(&self) -> &Ipv4Net {
        &self.range
    }

    pub fn gateway(&self) -> Option<Ipv4Addr> {
        self.gateway
    }

    pub fn dns(&self) -> Option<&[Ipv4Addr]> {
        self.dns.as_deref()
    }

    pub fn cloud_properties(&self) -> &Value {
        &self.cloud_properties
    }

    pub fn netmask(&self) -> Ipv4Addr {
        self.range.netmask()
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.range.contains(&ip)
    }

    pub fn available_dynamic_count(&self) -> usize {
        self.available_dynamic.len()
    }

    pub fn available_static_count(&self) -> usize {
        self.available_static.len()
    }

    pub fn is_available_dynamic(&self, ip: Ipv4Addr) -> bool {
        self.available_dynamic.contains(&u32::from(ip))
    }

    pub fn is_available_static(&self, ip: Ipv4Addr) -> bool {
        self.available_static.contains(&u32::from(ip))
    }

    /// True if the ranges are equal or either one contains the other
    pub fn overlaps(&self, other: &AddressSubnet) -> bool {
        self.range == other.range
            || self.range.contains(&other.range)
            || other.range.contains(&self.range)
    }

    /// Claim a specific address, reporting which pool it came from
    ///
    /// `None` means the address is taken or was never available.
    pub fn reserve_ip(&mut self, ip: Ipv4Addr) -> Option<ReservationKind> {
        let key = u32::from(ip);
        if self.available_static.remove(&key) {
            Some(ReservationKind::Static)
        } else if self.available_dynamic.remove(&key) {
            Some(ReservationKind::Dynamic)
        } else {
            None
        }
    }

    /// Pop the lowest free dynamic address
    pub fn allocate_dynamic_ip(&mut self) -> Result<Ipv4Addr> {
        self.available_dynamic
            .pop_first()
            .map(Ipv4Addr::from)
            .ok_or_else(|| NetworkError::NoCapacity {
                scope: self.range.to_string(),
            })
    }

    /// Return a dynamic address to the pool
    ///
    /// Addresses that were never part of the dynamic pool are refused, so a
    /// static address can not leak into dynamic allocation.
    pub fn release_dynamic_ip(&mut self, ip: Ipv4Addr) -> Result<()> {
        if !self.contains(ip) {
            return Err(NetworkError::NotInRange { ip });
        }
        let key = u32::from(ip);
        if !self.dynamic_pool.contains(&key) {
            return Err(NetworkError::NotDynamic { ip });
        }
        self.available_dynamic.insert(key);
        Ok(())
    }

    /// Return an address to whichever pool it was drawn from
    pub fn release_ip(&mut self, ip: Ipv4Addr) -> Result<()> {
        if !self.contains(ip) {
            return Err(NetworkError::NotInRange { ip });
        }
        let key = u32::from(ip);
        if self.dynamic_pool.contains(&key) {
            self.available_dynamic.insert(key);
        } else if self.static_pool.contains(&key) {
            self.available_static.insert(key);
        } else {
            return Err(NetworkError::InvalidRelease { ip });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    fn subnet_spec(range: &str) -> SubnetSpec {
        SubnetSpec::new(range.parse().unwrap())
    }

    #[test]
    fn test_dynamic_pool_excludes_network_broadcast_and_gateway() {
        let subnet = AddressSubnet::new(&subnet_spec("10.0.0.0/24").with_gateway(ip("10.0.0.1")))
            .unwrap();

        assert!(!subnet.is_available_dynamic(ip("10.0.0.0")));
        assert!(!subnet.is_available_dynamic(ip("10.0.0.1")));
        assert!(!subnet.is_available_dynamic(ip("10.0.0.255")));
        assert_eq!(subnet.available_dynamic_count(), 252);
        assert_eq!(subnet.netmask(), ip("255.255.255.0"));
    }

    #[test]
    fn test_single_address_range_is_invalid() {
        let err = AddressSubnet::new(&subnet_spec("10.0.0.7/32")).unwrap_err();
        assert!(matches!(err, NetworkError::InvalidRange { .. }));
    }

    #[test]
    fn test_gateway_outside_range_is_invalid() {
        let err =
            AddressSubnet::new(&subnet_spec("10.0.0.0/24").with_gateway(ip("10.0.1.1"))).unwrap_err();
        assert!(matches!(err, NetworkError::InvalidGateway { .. }));
    }

    #[test]
    fn test_reserved_and_static_are_removed_from_dynamic_pool() {
        let spec = subnet_spec("10.0.0.0/24")
            .with_gateway(ip("10.0.0.1"))
            .with_reserved("10.0.0.2 - 10.0.0.9".parse().unwrap())
            .with_static("10.0.0.10 - 10.0.0.19".parse().unwrap());
        let subnet = AddressSubnet::new(&spec).unwrap();

        assert_eq!(subnet.available_dynamic_count(), 252 - 8 - 10);
        assert_eq!(subnet.available_static_count(), 10);
        assert!(subnet.is_available_static(ip("10.0.0.10")));
        assert!(!subnet.is_available_dynamic(ip("10.0.0.10")));
        assert!(!subnet.is_available_dynamic(ip("10.0.0.5")));
    }

    #[test]
    fn test_double_reservation_is_rejected() {
        let spec = subnet_spec("10.0.0.0/24")
            .with_gateway(ip("10.0.0.1"))
            .with_reserved(IpSpan::single(ip("10.0.0.1")));
        assert_eq!(
            AddressSubnet::new(&spec).unwrap_err(),
            NetworkError::InvalidReservedIp { ip: ip("10.0.0.1") }
        );

        let spec = subnet_spec("10.0.0.0/24")
            .with_reserved(IpSpan::single(ip("10.0.0.5")))
            .with_static(IpSpan::single(ip("10.0.0.5")));
        assert_eq!(
            AddressSubnet::new(&spec).unwrap_err(),
            NetworkError::InvalidStaticIp { ip: ip("10.0.0.5") }
        );
    }

    #[test]
    fn test_reserve_prefers_static_pool_then_dynamic() {
        let spec = subnet_spec("10.0.0.0/24").with_static(IpSpan::single(ip("10.0.0.50")));
        let mut subnet = AddressSubnet::new(&spec).unwrap();

        assert_eq!(subnet.reserve_ip(ip("10.0.0.50")), Some(ReservationKind::Static));
        assert_eq!(subnet.reserve_ip(ip("10.0.0.51")), Some(ReservationKind::Dynamic));
        assert_eq!(subnet.reserve_ip(ip("10.0.0.50")), None);
        assert_eq!(subnet.reserve_ip(ip("10.0.0.0")), None);
    }

    #[test]
    fn test_allocate_pops_lowest_and_reports_capacity() {
        let mut subnet = AddressSubnet::new(&subnet_spec("10.0.0.0/30")).unwrap();

        assert_eq!(subnet.allocate_dynamic_ip().unwrap(), ip("10.0.0.1"));
        assert_eq!(subnet.allocate_dynamic_ip().unwrap(), ip("10.0.0.2"));
        assert!(matches!(
            subnet.allocate_dynamic_ip(),
            Err(NetworkError::NoCapacity { .. })
        ));
    }

    #[test]
    fn test_release_dynamic_checks_range_and_pool() {
        let spec = subnet_spec("10.0.0.0/24").with_static(IpSpan::single(ip("10.0.0.50")));
        let mut subnet = AddressSubnet::new(&spec).unwrap();
        let allocated = subnet.allocate_dynamic_ip().unwrap();

        assert_eq!(
            subnet.release_dynamic_ip(ip("192.168.0.1")),
            Err(NetworkError::NotInRange { ip: ip("192.168.0.1") })
        );
        assert_eq!(
            subnet.release_dynamic_ip(ip("10.0.0.50")),
            Err(NetworkError::NotDynamic { ip: ip("10.0.0.50") })
        );

        subnet.release_dynamic_ip(allocated).unwrap();
        assert_eq!(subnet.allocate_dynamic_ip().unwrap(), allocated);
    }

    #[test]
    fn test_release_routes_back_to_original_pool() {
        let spec = subnet_spec("10.0.0.0/24").with_static(IpSpan::single(ip("10.0.0.50")));
        let mut subnet = AddressSubnet::new(&spec).unwrap();

        subnet.reserve_ip(ip("10.0.0.50"));
        subnet.release_ip(ip("10.0.0.50")).unwrap();
        assert!(subnet.is_available_static(ip("10.0.0.50")));
        assert!(!subnet.is_available_dynamic(ip("10.0.0.50")));

        assert_eq!(
            subnet.release_ip(ip("10.0.0.0")),
            Err(NetworkError::InvalidRelease { ip: ip("10.0.0.0") })
        );
    }

    #[test]
    fn test_overlap_detection() {
        let a = AddressSubnet::new(&subnet_spec("10.0.0.0/16")).unwrap();
        let b = AddressSubnet::new(&subnet_spec("10.0.5.0/24")).unwrap();
        let c = AddressSubnet::new(&subnet_spec("10.1.0.0/24")).unwrap();

        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(a.overlaps(&a.clone()));
        assert!(!b.overlaps(&c));
    }
}

//! A named network: ordered subnets with first-fit dispatch

use crate::error::{NetworkError, Result};
use crate::reservation::{Reservation, ReservationFailure, ReservationKind};
use crate::subnet::{AddressSubnet, SubnetSpec};
use armada_types::{DefaultProperty, NetworkSettings};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use tracing::debug;

/// Network as declared in a manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkSpec {
    pub name: String,
    pub subnets: Vec<SubnetSpec>,
}

/// Ordered list of pairwise non-overlapping subnets
///
/// Subnet order is manifest order and is significant: allocation fills the
/// first subnet before touching the next one.
#[derive(Debug, Clone)]
pub struct Network {
    name: String,
    subnets: Vec<AddressSubnet>,
}

impl Network {
    pub fn new(name: impl Into<String>, subnets: Vec<AddressSubnet>) -> Result<Self> {
        let name = name.into();
        for (i, subnet) in subnets.iter().enumerate() {
            if let Some(other) = subnets[..i].iter().find(|other| other.overlaps(subnet)) {
                debug!(network = %name, range = %subnet.range(), other = %other.range(), "Overlapping subnets");
                return Err(NetworkError::OverlappingSubnet {
                    network: name,
                    range: subnet.range().to_string(),
                });
            }
        }
        Ok(Self { name, subnets })
    }

    pub fn from_spec(spec: &NetworkSpec) -> Result<Self> {
        let subnets = spec
            .subnets
            .iter()
            .map(AddressSubnet::new)
            .collect::<Result<Vec<_>>>()?;
        Self::new(spec.name.clone(), subnets)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn subnets(&self) -> &[AddressSubnet] {
        &self.subnets
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.subnet_for(ip).is_some()
    }

    fn subnet_for(&self, ip: Ipv4Addr) -> Option<&AddressSubnet> {
        self.subnets.iter().find(|subnet| subnet.contains(ip))
    }

    fn subnet_for_mut(&mut self, ip: Ipv4Addr) -> Option<&mut AddressSubnet> {
        self.subnets.iter_mut().find(|subnet| subnet.contains(ip))
    }

    /// Claim a specific address in the subnet that owns it
    pub fn reserve_ip(&mut self, ip: Ipv4Addr) -> Option<ReservationKind> {
        self.subnet_for_mut(ip)?.reserve_ip(ip)
    }

    /// Lowest free dynamic address of the first subnet that has one
    pub fn allocate_dynamic_ip(&mut self) -> Result<Ipv4Addr> {
        for subnet in self.subnets.iter_mut() {
            if let Ok(ip) = subnet.allocate_dynamic_ip() {
                return Ok(ip);
            }
        }
        Err(NetworkError::NoCapacity {
            scope: self.name.clone(),
        })
    }

    pub fn release_dynamic_ip(&mut self, ip: Ipv4Addr) -> Result<()> {
        self.subnet_for_mut(ip)
            .ok_or(NetworkError::NotInRange { ip })?
            .release_dynamic_ip(ip)
    }

    /// Return an address to the pool it was originally drawn from
    pub fn release_ip(&mut self, ip: Ipv4Addr) -> Result<()> {
        self.subnet_for_mut(ip)
            .ok_or(NetworkError::NotInRange { ip })?
            .release_ip(ip)
    }

    /// Process a reservation against this network
    ///
    /// Reservations that are already fulfilled are returned untouched. A
    /// static request that lands in the dynamic pool is undone and fails with
    /// `WrongType`.
    pub fn reserve(&mut self, reservation: Reservation) -> Reservation {
        if reservation.is_reserved() {
            return reservation;
        }

        match reservation.requested_ip() {
            Some(ip) => match self.reserve_ip(ip) {
                Some(kind) => match reservation.requested_kind() {
                    Some(wanted) if wanted != kind => {
                        if let Err(error) = self.release_ip(ip) {
                            debug!(network = %self.name, %ip, %error, "Failed to undo mistyped reservation");
                        }
                        reservation.failed(ReservationFailure::WrongType)
                    }
                    _ => reservation.fulfilled(ip, kind),
                },
                None => reservation.failed(ReservationFailure::Used),
            },
            None => match self.allocate_dynamic_ip() {
                Ok(ip) => reservation.fulfilled(ip, ReservationKind::Dynamic),
                Err(_) => reservation.failed(ReservationFailure::Capacity),
            },
        }
    }

    /// Release whatever a fulfilled reservation holds
    pub fn release(&mut self, reservation: &Reservation) -> Result<()> {
        match reservation.ip() {
            Some(ip) => self.release_ip(ip),
            None => Ok(()),
        }
    }

    /// Render the settings a VM needs for `ip` on this network
    ///
    /// `None` when no subnet contains the address.
    pub fn network_settings(
        &self,
        ip: Ipv4Addr,
        default_properties: Option<&[DefaultProperty]>,
    ) -> Option<NetworkSettings> {
        let subnet = self.subnet_for(ip)?;
        Some(NetworkSettings {
            ip,
            netmask: subnet.netmask(),
            cloud_properties: subnet.cloud_properties().clone(),
            dns: subnet.dns().map(<[Ipv4Addr]>::to_vec),
            gateway: subnet.gateway(),
            default: default_properties.map(|props| {
                let mut props = props.to_vec();
                props.sort();
                props
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::span::IpSpan;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    fn subnet(range: &str) -> AddressSubnet {
        AddressSubnet::new(&SubnetSpec::new(range.parse().unwrap())).unwrap()
    }

    #[test]
    fn test_overlapping_subnets_are_rejected() {
        let err = Network::new("a", vec![subnet("10.0.0.0/16"), subnet("10.0.1.0/24")]).unwrap_err();
        assert!(matches!(err, NetworkError::OverlappingSubnet { .. }));
    }

    #[test]
    fn test_allocation_is_first_fit_in_subnet_order() {
        let mut network =
            Network::new("a", vec![subnet("10.0.1.0/30"), subnet("10.0.0.0/24")]).unwrap();

        assert_eq!(network.allocate_dynamic_ip().unwrap(), ip("10.0.1.1"));
        assert_eq!(network.allocate_dynamic_ip().unwrap(), ip("10.0.1.2"));
        assert_eq!(network.allocate_dynamic_ip().unwrap(), ip("10.0.0.1"));
    }

    #[test]
    fn test_capacity_error_names_network() {
        let mut network = Network::new("tiny", vec![subnet("10.0.0.0/30")]).unwrap();
        network.allocate_dynamic_ip().unwrap();
        network.allocate_dynamic_ip().unwrap();

        assert_eq!(
            network.allocate_dynamic_ip(),
            Err(NetworkError::NoCapacity {
                scope: "tiny".into()
            })
        );
    }

    #[test]
    fn test_reserve_routes_to_owning_subnet() {
        let mut network =
            Network::new("a", vec![subnet("10.0.0.0/24"), subnet("10.0.1.0/24")]).unwrap();

        assert_eq!(network.reserve_ip(ip("10.0.1.9")), Some(ReservationKind::Dynamic));
        assert_eq!(network.reserve_ip(ip("10.0.1.9")), None);
        assert_eq!(network.reserve_ip(ip("172.16.0.1")), None);
        assert_eq!(
            network.release_dynamic_ip(ip("172.16.0.1")),
            Err(NetworkError::NotInRange { ip: ip("172.16.0.1") })
        );
    }

    #[test]
    fn test_static_request_in_dynamic_pool_is_wrong_type_and_undone() {
        let mut network = Network::new("a", vec![subnet("10.0.0.0/24")]).unwrap();

        let outcome = network.reserve(Reservation::static_ip(ip("10.0.0.5")));
        assert!(!outcome.is_reserved());
        assert!(matches!(outcome.into_ip("web/0"), Err(NetworkError::WrongType { .. })));
        assert_eq!(network.reserve_ip(ip("10.0.0.5")), Some(ReservationKind::Dynamic));
    }

    #[test]
    fn test_reserve_existing_reports_pool() {
        let spec = SubnetSpec::new("10.0.0.0/24".parse().unwrap())
            .with_static(IpSpan::single(ip("10.0.0.100")));
        let mut network = Network::new("a", vec![AddressSubnet::new(&spec).unwrap()]).unwrap();

        let outcome = network.reserve(Reservation::existing(ip("10.0.0.100")));
        assert_eq!(outcome.kind(), Some(ReservationKind::Static));

        let outcome = network.reserve(Reservation::existing(ip("10.0.0.100")));
        assert!(matches!(outcome.into_ip("vm"), Err(NetworkError::Reservation { .. })));
    }

    #[test]
    fn test_network_settings_rendering() {
        let spec = SubnetSpec::new("10.0.0.0/24".parse().unwrap())
            .with_gateway(ip("10.0.0.1"))
            .with_dns(vec![ip("8.8.8.8")]);
        let network = Network::new("a", vec![AddressSubnet::new(&spec).unwrap()]).unwrap();

        let settings = network
            .network_settings(
                ip("10.0.0.7"),
                Some(&[DefaultProperty::Gateway, DefaultProperty::Dns]),
            )
            .unwrap();
        assert_eq!(settings.ip, ip("10.0.0.7"));
        assert_eq!(settings.netmask, ip("255.255.255.0"));
        assert_eq!(settings.gateway, Some(ip("10.0.0.1")));
        assert_eq!(settings.dns, Some(vec![ip("8.8.8.8")]));
        assert_eq!(
            settings.default,
            Some(vec![DefaultProperty::Dns, DefaultProperty::Gateway])
        );

        assert!(network.network_settings(ip("10.0.9.7"), None).is_none());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Allocate,
        Reserve(u8),
        Release(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            Just(Op::Allocate),
            any::<u8>().prop_map(Op::Reserve),
            any::<usize>().prop_map(Op::Release),
        ]
    }

    proptest! {
        #[test]
        fn prop_no_double_allocation(ops in proptest::collection::vec(op(), 1..200)) {
            let spec = SubnetSpec::new("10.0.0.0/24".parse().unwrap())
                .with_gateway(ip("10.0.0.1"))
                .with_static("10.0.0.200 - 10.0.0.220".parse().unwrap());
            let mut network = Network::new("p", vec![AddressSubnet::new(&spec).unwrap()]).unwrap();
            let mut held: Vec<Ipv4Addr> = Vec::new();

            for op in ops {
                match op {
                    Op::Allocate => {
                        if let Ok(ip) = network.allocate_dynamic_ip() {
                            prop_assert!(!held.contains(&ip));
                            held.push(ip);
                        }
                    }
                    Op::Reserve(last) => {
                        let candidate = Ipv4Addr::new(10, 0, 0, last);
                        if network.reserve_ip(candidate).is_some() {
                            prop_assert!(!held.contains(&candidate));
                            held.push(candidate);
                        }
                    }
                    Op::Release(i) => {
                        if !held.is_empty() {
                            let ip = held.swap_remove(i % held.len());
                            network.release_ip(ip).unwrap();
                        }
                    }
                }
            }

            let unique: HashSet<_> = held.iter().collect();
            prop_assert_eq!(unique.len(), held.len());
        }
    }
}

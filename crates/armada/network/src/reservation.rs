//! Reservation state machine
//!
//! A reservation is a value: reserving one against a network consumes it and
//! returns the outcome, so compiler phases can be exercised independently.

use crate::error::NetworkError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;

/// Pool an address is drawn from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReservationKind {
    Static,
    Dynamic,
}

impl fmt::Display for ReservationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReservationKind::Static => write!(f, "static"),
            ReservationKind::Dynamic => write!(f, "dynamic"),
        }
    }
}

/// Why a reservation could not be fulfilled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationFailure {
    /// The address is taken or outside every subnet
    Used,
    /// No dynamic address left
    Capacity,
    /// The address exists but lives in the other pool
    WrongType,
}

impl fmt::Display for ReservationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReservationFailure::Used => write!(f, "used"),
            ReservationFailure::Capacity => write!(f, "capacity"),
            ReservationFailure::WrongType => write!(f, "wrong type"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationState {
    Unreserved,
    Reserved { ip: Ipv4Addr, kind: ReservationKind },
    Failed { reason: ReservationFailure },
}

/// A requested or fulfilled address claim
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    requested_ip: Option<Ipv4Addr>,
    /// `None` accepts whichever pool the requested address sits in
    requested_kind: Option<ReservationKind>,
    state: ReservationState,
}

impl Reservation {
    /// Any free dynamic address
    pub fn dynamic() -> Self {
        Self {
            requested_ip: None,
            requested_kind: Some(ReservationKind::Dynamic),
            state: ReservationState::Unreserved,
        }
    }

    /// A specific address from the static pool
    pub fn static_ip(ip: Ipv4Addr) -> Self {
        Self {
            requested_ip: Some(ip),
            requested_kind: Some(ReservationKind::Static),
            state: ReservationState::Unreserved,
        }
    }

    /// An address already in use by a running VM, from either pool
    pub fn existing(ip: Ipv4Addr) -> Self {
        Self {
            requested_ip: Some(ip),
            requested_kind: None,
            state: ReservationState::Unreserved,
        }
    }

    pub(crate) fn fulfilled(self, ip: Ipv4Addr, kind: ReservationKind) -> Self {
        Self {
            state: ReservationState::Reserved { ip, kind },
            ..self
        }
    }

    pub(crate) fn failed(self, reason: ReservationFailure) -> Self {
        Self {
            state: ReservationState::Failed { reason },
            ..self
        }
    }

    pub fn state(&self) -> ReservationState {
        self.state
    }

    pub fn requested_ip(&self) -> Option<Ipv4Addr> {
        self.requested_ip
    }

    pub fn requested_kind(&self) -> Option<ReservationKind> {
        self.requested_kind
    }

    pub fn is_reserved(&self) -> bool {
        matches!(self.state, ReservationState::Reserved { .. })
    }

    /// Reserved address, if fulfilled
    pub fn ip(&self) -> Option<Ipv4Addr> {
        match self.state {
            ReservationState::Reserved { ip, .. } => Some(ip),
            _ => None,
        }
    }

    /// Pool of the reserved address, if fulfilled
    pub fn kind(&self) -> Option<ReservationKind> {
        match self.state {
            ReservationState::Reserved { kind, .. } => Some(kind),
            _ => None,
        }
    }

    pub fn is_static(&self) -> bool {
        self.kind() == Some(ReservationKind::Static)
            || (self.kind().is_none() && self.requested_kind == Some(ReservationKind::Static))
    }

    /// Fulfil this reservation from another, already reserved one
    ///
    /// Succeeds only if `other` is reserved, the kinds match, and either the
    /// reservation is dynamic or both name the same address. A reservation
    /// that is already fulfilled is returned untouched.
    pub fn take(self, other: &Reservation) -> Reservation {
        if self.is_reserved() {
            return self;
        }
        let ReservationState::Reserved { ip, kind } = other.state else {
            return self;
        };
        if self.requested_kind.is_some_and(|wanted| wanted != kind) {
            return self;
        }
        if kind == ReservationKind::Static && self.requested_ip != Some(ip) {
            return self;
        }
        self.fulfilled(ip, kind)
    }

    /// Turn the outcome into an address or an actionable error
    ///
    /// `origin` names the requester (`job/index` or a resource pool) so the
    /// error points at the manifest entry that caused it.
    pub fn into_ip(self, origin: &str) -> Result<Ipv4Addr, NetworkError> {
        match self.state {
            ReservationState::Reserved { ip, .. } => Ok(ip),
            ReservationState::Failed { reason } => Err(self.error(origin, reason)),
            ReservationState::Unreserved => Err(NetworkError::Reservation {
                origin: origin.to_string(),
                what: self.describe(),
                reason: "reservation was never processed".to_string(),
            }),
        }
    }

    fn error(&self, origin: &str, reason: ReservationFailure) -> NetworkError {
        let origin = origin.to_string();
        match (self.requested_kind, self.requested_ip, reason) {
            (Some(ReservationKind::Static), Some(ip), ReservationFailure::Used) => {
                NetworkError::AlreadyInUse { origin, ip }
            }
            (Some(ReservationKind::Static), Some(ip), ReservationFailure::WrongType) => {
                NetworkError::WrongType { origin, ip }
            }
            (_, None, ReservationFailure::Capacity) => NetworkError::NotEnoughCapacity { origin },
            _ => NetworkError::Reservation {
                origin,
                what: self.describe(),
                reason: reason.to_string(),
            },
        }
    }

    fn describe(&self) -> String {
        match (self.requested_kind, self.requested_ip) {
            (Some(kind), Some(ip)) => format!("{kind} IP {ip}"),
            (None, Some(ip)) => format!("IP {ip}"),
            (Some(kind), None) => format!("{kind} IP"),
            (None, None) => "IP".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    #[test]
    fn test_take_dynamic_copies_address() {
        let provided = Reservation::existing(ip("10.0.0.7")).fulfilled(ip("10.0.0.7"), ReservationKind::Dynamic);
        let taken = Reservation::dynamic().take(&provided);

        assert!(taken.is_reserved());
        assert_eq!(taken.ip(), Some(ip("10.0.0.7")));
    }

    #[test]
    fn test_take_static_requires_matching_address() {
        let provided = Reservation::existing(ip("10.0.0.7")).fulfilled(ip("10.0.0.7"), ReservationKind::Static);

        assert!(!Reservation::static_ip(ip("10.0.0.8")).take(&provided).is_reserved());
        assert!(Reservation::static_ip(ip("10.0.0.7")).take(&provided).is_reserved());
    }

    #[test]
    fn test_take_rejects_kind_mismatch_and_unreserved() {
        let dynamic = Reservation::existing(ip("10.0.0.7")).fulfilled(ip("10.0.0.7"), ReservationKind::Dynamic);
        assert!(!Reservation::static_ip(ip("10.0.0.7")).take(&dynamic).is_reserved());

        let pending = Reservation::dynamic();
        assert!(!Reservation::dynamic().take(&pending).is_reserved());
    }

    #[test]
    fn test_take_never_overwrites_fulfilled_reservation() {
        let first = Reservation::dynamic().fulfilled(ip("10.0.0.2"), ReservationKind::Dynamic);
        let other = Reservation::dynamic().fulfilled(ip("10.0.0.3"), ReservationKind::Dynamic);

        assert_eq!(first.take(&other).ip(), Some(ip("10.0.0.2")));
    }

    #[test]
    fn test_errors_name_origin() {
        let used = Reservation::static_ip(ip("10.0.0.9")).failed(ReservationFailure::Used);
        assert_eq!(
            used.into_ip("web/0"),
            Err(NetworkError::AlreadyInUse {
                origin: "web/0".into(),
                ip: ip("10.0.0.9")
            })
        );

        let wrong = Reservation::static_ip(ip("10.0.0.9")).failed(ReservationFailure::WrongType);
        assert!(matches!(wrong.into_ip("web/0"), Err(NetworkError::WrongType { .. })));

        let full = Reservation::dynamic().failed(ReservationFailure::Capacity);
        assert_eq!(
            full.into_ip("small"),
            Err(NetworkError::NotEnoughCapacity {
                origin: "small".into()
            })
        );

        let generic = Reservation::existing(ip("10.0.0.9")).failed(ReservationFailure::Used);
        let err = generic.into_ip("vm-1").unwrap_err();
        assert!(err.to_string().contains("vm-1"));
    }
}

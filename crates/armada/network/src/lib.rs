//! Armada Network - IP reservation ledger
//!
//! Every network owns an ordered list of non-overlapping subnets. Each subnet
//! tracks two disjoint pools: static addresses (handed out only on explicit
//! request) and dynamic addresses (handed out lowest-first).
//!
//! Nothing in this crate locks: a network is built once per deploy attempt and
//! mutated by the plan compiler, which runs to completion before any
//! concurrent rollout starts.
//!
//! ## Usage
//!
//! ```
//! use armada_network::{AddressSubnet, Network, SubnetSpec};
//!
//! let subnet = AddressSubnet::new(&SubnetSpec::new("10.0.0.0/24".parse().unwrap())
//!     .with_gateway("10.0.0.1".parse().unwrap()))
//!     .unwrap();
//! let mut network = Network::new("default", vec![subnet]).unwrap();
//! let ip = network.allocate_dynamic_ip().unwrap();
//! assert_eq!(ip.to_string(), "10.0.0.2");
//! ```

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod error;
pub mod instance_network;
pub mod network;
pub mod reservation;
pub mod span;
pub mod subnet;

// Re-exports
pub use error::{NetworkError, Result};
pub use instance_network::InstanceNetwork;
pub use network::{Network, NetworkSpec};
pub use reservation::{Reservation, ReservationFailure, ReservationKind, ReservationState};
pub use span::IpSpan;
pub use subnet::{AddressSubnet, SubnetSpec};

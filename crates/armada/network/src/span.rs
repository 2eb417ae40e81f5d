//! Single addresses and inclusive address ranges as written in manifests

use crate::error::NetworkError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// `"10.0.0.5"` or `"10.0.0.5 - 10.0.0.9"`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IpSpan {
    first: Ipv4Addr,
    last: Ipv4Addr,
}

impl IpSpan {
    pub fn single(ip: Ipv4Addr) -> Self {
        Self { first: ip, last: ip }
    }

    pub fn range(first: Ipv4Addr, last: Ipv4Addr) -> Result<Self, NetworkError> {
        if u32::from(first) > u32::from(last) {
            return Err(NetworkError::InvalidIpSpan(format!("{first} - {last}")));
        }
        Ok(Self { first, last })
    }

    pub fn iter(&self) -> impl Iterator<Item = Ipv4Addr> {
        (u32::from(self.first)..=u32::from(self.last)).map(Ipv4Addr::from)
    }

    pub fn len(&self) -> usize {
        (u32::from(self.last) - u32::from(self.first)) as usize + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

impl FromStr for IpSpan {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse = |part: &str| {
            part.trim()
                .parse::<Ipv4Addr>()
                .map_err(|_| NetworkError::InvalidIpSpan(s.to_string()))
        };

        match s.split_once('-') {
            Some((first, last)) => IpSpan::range(parse(first)?, parse(last)?),
            None => Ok(IpSpan::single(parse(s)?)),
        }
    }
}

impl TryFrom<String> for IpSpan {
    type Error = NetworkError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<IpSpan> for String {
    fn from(span: IpSpan) -> Self {
        span.to_string()
    }
}

impl From<Ipv4Addr> for IpSpan {
    fn from(ip: Ipv4Addr) -> Self {
        IpSpan::single(ip)
    }
}

impl fmt::Display for IpSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.first == self.last {
            write!(f, "{}", self.first)
        } else {
            write!(f, "{} - {}", self.first, self.last)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single_and_range() {
        let single: IpSpan = "10.0.0.5".parse().unwrap();
        assert_eq!(single.len(), 1);

        let range: IpSpan = "10.0.0.5 - 10.0.0.9".parse().unwrap();
        let ips: Vec<_> = range.iter().map(|ip| ip.to_string()).collect();
        assert_eq!(ips.first().map(String::as_str), Some("10.0.0.5"));
        assert_eq!(ips.last().map(String::as_str), Some("10.0.0.9"));
        assert_eq!(range.len(), 5);
    }

    #[test]
    fn test_parse_rejects_backwards_range() {
        assert!("10.0.0.9 - 10.0.0.5".parse::<IpSpan>().is_err());
        assert!("ten".parse::<IpSpan>().is_err());
    }
}

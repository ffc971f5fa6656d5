use std::{fmt, net::IpAddr, str::FromStr};

/// The observed (ip, port) tuple identifying a single VPN client session.
///
/// The canonical textual encoding is `{ip}.{port}` with the port after the
/// final dot, so the value can be embedded in colon-delimited DB keys and
/// still be parsed back unambiguously.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address {
    pub ip: IpAddr,
    pub port: u16,
}

impl Address {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Address { ip, port }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.ip, self.port)
    }
}

impl FromStr for Address {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ip, port) = s.rsplit_once('.').ok_or(())?;
        Ok(Address {
            ip: ip.parse().map_err(|_| ())?,
            port: port.parse().map_err(|_| ())?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_round_trip() {
        let addr: Address = "10.13.37.2.5001".parse().unwrap();
        assert_eq!(addr.ip, "10.13.37.2".parse::<IpAddr>().unwrap());
        assert_eq!(addr.port, 5001);
        assert_eq!(addr.to_string(), "10.13.37.2.5001");
    }

    #[test]
    fn test_address_ipv6() {
        let addr: Address = "fd00::2.1194".parse().unwrap();
        assert_eq!(addr.ip, "fd00::2".parse::<IpAddr>().unwrap());
        assert_eq!(addr.port, 1194);
        assert_eq!(addr.to_string(), "fd00::2.1194");
    }

    #[test]
    fn test_address_rejects_garbage() {
        assert!("10.0.0.2".parse::<Address>().is_err()); // port missing
        assert!("not-an-ip.5001".parse::<Address>().is_err());
        assert!("10.0.0.2.notaport".parse::<Address>().is_err());
        assert!("".parse::<Address>().is_err());
    }
}

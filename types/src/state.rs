use std::{fmt, str::FromStr};

/// Lifecycle state of a per-user challenge cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClusterStatus {
    /// The composition is running and reachable.
    Up,

    /// The last connection dropped; the status key carries a TTL and the
    /// cluster will be torn down when it expires.
    Expiring,

    /// The composition's containers are stopped but not removed.
    Stopped,

    /// The composition has been (or should be assumed) torn down. A cluster
    /// with no recorded status is treated the same way.
    Down,
}

impl ClusterStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterStatus::Up => "up",
            ClusterStatus::Expiring => "expiring",
            ClusterStatus::Stopped => "stopped",
            ClusterStatus::Down => "down",
        }
    }
}

impl fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClusterStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "up" => Ok(ClusterStatus::Up),
            "expiring" => Ok(ClusterStatus::Expiring),
            "stopped" => Ok(ClusterStatus::Stopped),
            "down" => Ok(ClusterStatus::Down),
            _ => Err(()),
        }
    }
}

/// State of one VLAN sub-interface on a VPN's veth, keyed by vlan id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkState {
    /// The sub-interface exists and is administratively up.
    Up,

    /// The sub-interface is attached to its cluster's default bridge.
    Bridged,

    /// The sub-interface is down or gone.
    Down,
}

impl LinkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkState::Up => "up",
            LinkState::Bridged => "bridged",
            LinkState::Down => "down",
        }
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LinkState {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "up" => Ok(LinkState::Up),
            "bridged" => Ok(LinkState::Bridged),
            "down" => Ok(LinkState::Down),
            _ => Err(()),
        }
    }
}

/// Administrative state of the host-side veth endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VethState {
    Up,
    Down,
}

impl VethState {
    pub fn as_str(&self) -> &'static str {
        match self {
            VethState::Up => "up",
            VethState::Down => "down",
        }
    }
}

impl fmt::Display for VethState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VethState {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "up" => Ok(VethState::Up),
            "down" => Ok(VethState::Down),
            _ => Err(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_values() {
        // The lower-case wire form is what the hooks write and the
        // handlers parse back; it is a compatibility contract.
        assert_eq!(ClusterStatus::Expiring.as_str(), "expiring");
        assert_eq!("stopped".parse::<ClusterStatus>(), Ok(ClusterStatus::Stopped));
        assert_eq!(LinkState::Bridged.as_str(), "bridged");
        assert_eq!("up".parse::<LinkState>(), Ok(LinkState::Up));
        assert_eq!("down".parse::<VethState>(), Ok(VethState::Down));
    }

    #[test]
    fn test_unknown_values_are_rejected() {
        assert!("running".parse::<ClusterStatus>().is_err());
        assert!("UP".parse::<ClusterStatus>().is_err());
        assert!("".parse::<LinkState>().is_err());
        assert!("promisc".parse::<VethState>().is_err());
    }
}

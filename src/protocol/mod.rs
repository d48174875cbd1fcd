pub mod v5;

use std::fmt;

/// IP protocol numbers the flow code cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpProtocol {
    Icmp,
    Tcp,
    Udp,
    Icmpv6,
    Unknown(u8),
}

impl From<u8> for IpProtocol {
    fn from(value: u8) -> Self {
        match value {
            1 => IpProtocol::Icmp,
            6 => IpProtocol::Tcp,
            17 => IpProtocol::Udp,
            58 => IpProtocol::Icmpv6,
            other => IpProtocol::Unknown(other),
        }
    }
}

impl IpProtocol {
    pub fn as_u8(&self) -> u8 {
        match self {
            IpProtocol::Icmp => 1,
            IpProtocol::Tcp => 6,
            IpProtocol::Udp => 17,
            IpProtocol::Icmpv6 => 58,
            IpProtocol::Unknown(v) => *v,
        }
    }

    /// ICMP and ICMPv6 carry type/code in the destination port.
    pub fn is_icmp(&self) -> bool {
        matches!(self, IpProtocol::Icmp | IpProtocol::Icmpv6)
    }
}

impl fmt::Display for IpProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpProtocol::Icmp => write!(f, "ICMP"),
            IpProtocol::Tcp => write!(f, "TCP"),
            IpProtocol::Udp => write!(f, "UDP"),
            IpProtocol::Icmpv6 => write!(f, "ICMPv6"),
            IpProtocol::Unknown(v) => write!(f, "Proto({})", v),
        }
    }
}

/// Errors from fixed-layout parsing.
#[derive(Debug)]
pub enum ParseError {
    /// Not enough bytes to parse the structure
    TooShort { expected: usize, actual: usize },
    /// Invalid header values
    InvalidHeader(String),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::TooShort { expected, actual } => {
                write!(f, "input too short: need {} bytes, got {}", expected, actual)
            }
            ParseError::InvalidHeader(msg) => write!(f, "invalid header: {}", msg),
        }
    }
}

impl std::error::Error for ParseError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_roundtrips_number() {
        for n in [1u8, 6, 17, 58, 132] {
            assert_eq!(IpProtocol::from(n).as_u8(), n);
        }
        assert!(IpProtocol::from(58).is_icmp());
        assert!(!IpProtocol::from(17).is_icmp());
        assert_eq!(IpProtocol::from(132).to_string(), "Proto(132)");
    }
}

//! Tunnel Configuration
//!
//! The parameters needed to bring up one WireGuard session. A
//! [`TunnelConfig`] is built by the controller for every activation attempt,
//! travels to the daemon inside an `activate` frame, and is validated there
//! before anything touches the network.

use crate::keys::{KeyError, PrivateKey, PublicKey};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// A CIDR range such as `10.0.0.0/8` or `::/0`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "IpRangeWire", into = "IpRangeWire")]
pub struct IpRange {
    address: IpAddr,
    prefix: u8,
}

impl IpRange {
    /// Create a range, rejecting prefixes longer than the address family allows
    pub fn new(address: IpAddr, prefix: u8) -> Result<Self, ConfigError> {
        let max = if address.is_ipv6() { 128 } else { 32 };
        if prefix > max {
            return Err(ConfigError::InvalidPrefix { address, prefix });
        }
        Ok(Self { address, prefix })
    }

    /// Host route for a single address (/32 or /128)
    pub fn host(address: IpAddr) -> Self {
        let prefix = if address.is_ipv6() { 128 } else { 32 };
        Self { address, prefix }
    }

    pub fn address(&self) -> IpAddr {
        self.address
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn is_ipv6(&self) -> bool {
        self.address.is_ipv6()
    }

    /// Check whether an address falls inside this range
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.address, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = prefix_mask(self.prefix, 32) as u32;
                u32::from(net) & mask == u32::from(ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = prefix_mask(self.prefix, 128);
                u128::from(net) & mask == u128::from(ip) & mask
            }
            _ => false,
        }
    }
}

fn prefix_mask(prefix: u8, bits: u32) -> u128 {
    if prefix == 0 {
        0
    } else {
        let width_mask = if bits == 128 { u128::MAX } else { (1u128 << bits) - 1 };
        (u128::MAX << (bits - prefix as u32)) & width_mask
    }
}

impl fmt::Display for IpRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix)
    }
}

impl FromStr for IpRange {
    type Err = ConfigError;

    /// Parse CIDR notation (e.g., "0.0.0.0/0"). A bare address is a host route.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s.split_once('/') {
            Some((ip, prefix)) => {
                let address: IpAddr = ip.parse()
                    .map_err(|_| ConfigError::InvalidAddress(s.to_string()))?;
                let prefix: u8 = prefix.parse()
                    .map_err(|_| ConfigError::InvalidAddress(s.to_string()))?;
                Self::new(address, prefix)
            }
            None => {
                let address: IpAddr = s.parse()
                    .map_err(|_| ConfigError::InvalidAddress(s.to_string()))?;
                Ok(Self::host(address))
            }
        }
    }
}

/// Wire shape of an allowed IP range: `{"address", "range", "isIpv6"}`
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IpRangeWire {
    address: String,
    range: u8,
    #[serde(default)]
    is_ipv6: bool,
}

impl TryFrom<IpRangeWire> for IpRange {
    type Error = ConfigError;

    fn try_from(wire: IpRangeWire) -> Result<Self, Self::Error> {
        let address: IpAddr = wire.address.parse()
            .map_err(|_| ConfigError::InvalidAddress(wire.address.clone()))?;
        if address.is_ipv6() != wire.is_ipv6 {
            return Err(ConfigError::InvalidAddress(wire.address));
        }
        IpRange::new(address, wire.range)
    }
}

impl From<IpRange> for IpRangeWire {
    fn from(range: IpRange) -> Self {
        Self {
            address: range.address.to_string(),
            range: range.prefix,
            is_ipv6: range.is_ipv6(),
        }
    }
}

/// Parameters for one tunnel session
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelConfig {
    /// Device private key (base64)
    pub private_key: String,
    /// Device tunnel address, IPv4 (CIDR)
    #[serde(default)]
    pub device_ipv4_address: String,
    /// Device tunnel address, IPv6 (CIDR)
    #[serde(default)]
    pub device_ipv6_address: String,
    /// Server address inside the tunnel, IPv4
    #[serde(default)]
    pub server_ipv4_gateway: String,
    /// Server address inside the tunnel, IPv6
    #[serde(default)]
    pub server_ipv6_gateway: String,
    /// Server public key (base64)
    pub server_public_key: String,
    /// Server public endpoint, IPv4
    #[serde(default)]
    pub server_ipv4_addr_in: String,
    /// Server public endpoint, IPv6
    #[serde(default)]
    pub server_ipv6_addr_in: String,
    /// Server WireGuard port
    pub server_port: u16,
    #[serde(default)]
    pub ipv6_enabled: bool,
    /// Ranges routed through the tunnel
    #[serde(rename = "allowedIPAddressRanges")]
    pub allowed_ip_address_ranges: Vec<IpRange>,
    /// Optional DNS override; the gateway is used otherwise
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns_server: Option<String>,
}

impl TunnelConfig {
    /// Parse and validate a config from JSON
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(content)
            .map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check everything the daemon needs before touching the interface.
    ///
    /// Rejects configs that would only partially apply: missing keys, no
    /// usable address family, or values containing newlines (which would
    /// corrupt a rendered wg-quick file).
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in self.text_fields() {
            if value.contains('\n') || value.contains('\r') {
                return Err(ConfigError::EmbeddedNewline(field));
            }
        }

        if self.private_key.is_empty() {
            return Err(ConfigError::MissingField("privateKey"));
        }
        PrivateKey::from_base64(&self.private_key)?;

        if self.server_public_key.is_empty() {
            return Err(ConfigError::MissingField("serverPublicKey"));
        }
        PublicKey::from_base64(&self.server_public_key)?;

        if self.server_port == 0 {
            return Err(ConfigError::MissingField("serverPort"));
        }

        if self.device_ipv4_address.is_empty() && self.device_ipv6_address.is_empty() {
            return Err(ConfigError::MissingField("deviceIpv4Address"));
        }
        for address in [&self.device_ipv4_address, &self.device_ipv6_address] {
            if !address.is_empty() {
                address.parse::<IpRange>()?;
            }
        }

        if self.server_ipv4_addr_in.is_empty() && self.server_ipv6_addr_in.is_empty() {
            return Err(ConfigError::MissingField("serverIpv4AddrIn"));
        }
        for address in [
            &self.server_ipv4_addr_in,
            &self.server_ipv6_addr_in,
            &self.server_ipv4_gateway,
            &self.server_ipv6_gateway,
        ] {
            if !address.is_empty() {
                address.parse::<IpAddr>()
                    .map_err(|_| ConfigError::InvalidAddress(address.clone()))?;
            }
        }

        if self.allowed_ip_address_ranges.is_empty() {
            return Err(ConfigError::MissingField("allowedIPAddressRanges"));
        }

        Ok(())
    }

    /// Allowed ranges ordered by decreasing prefix length (most specific first)
    pub fn sorted_ranges(&self) -> Vec<IpRange> {
        let mut ranges = self.allowed_ip_address_ranges.clone();
        ranges.sort_by(|a, b| b.prefix.cmp(&a.prefix));
        ranges
    }

    /// Endpoint the tunnel is established against, IPv4 preferred
    pub fn endpoint(&self) -> Option<IpAddr> {
        [&self.server_ipv4_addr_in, &self.server_ipv6_addr_in]
            .into_iter()
            .find_map(|s| s.parse().ok())
    }

    /// DNS servers for the tunnel: the override, or the gateways
    pub fn dns_servers(&self) -> Vec<String> {
        if let Some(dns) = &self.dns_server {
            return vec![dns.clone()];
        }
        let mut servers = Vec::new();
        if !self.server_ipv4_gateway.is_empty() {
            servers.push(self.server_ipv4_gateway.clone());
        }
        if self.ipv6_enabled && !self.server_ipv6_gateway.is_empty() {
            servers.push(self.server_ipv6_gateway.clone());
        }
        servers
    }

    fn text_fields(&self) -> [(&'static str, &str); 9] {
        [
            ("privateKey", self.private_key.as_str()),
            ("deviceIpv4Address", self.device_ipv4_address.as_str()),
            ("deviceIpv6Address", self.device_ipv6_address.as_str()),
            ("serverIpv4Gateway", self.server_ipv4_gateway.as_str()),
            ("serverIpv6Gateway", self.server_ipv6_gateway.as_str()),
            ("serverPublicKey", self.server_public_key.as_str()),
            ("serverIpv4AddrIn", self.server_ipv4_addr_in.as_str()),
            ("serverIpv6AddrIn", self.server_ipv6_addr_in.as_str()),
            ("dnsServer", self.dns_server.as_deref().unwrap_or("")),
        ]
    }
}

impl fmt::Debug for TunnelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelConfig")
            .field("private_key", &"[redacted]")
            .field("device_ipv4_address", &self.device_ipv4_address)
            .field("device_ipv6_address", &self.device_ipv6_address)
            .field("server_ipv4_gateway", &self.server_ipv4_gateway)
            .field("server_public_key", &crate::keys::short_key(&self.server_public_key))
            .field("server_ipv4_addr_in", &self.server_ipv4_addr_in)
            .field("server_port", &self.server_port)
            .field("ipv6_enabled", &self.ipv6_enabled)
            .field("allowed_ranges", &self.allowed_ip_address_ranges.len())
            .finish()
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid key: {0}")]
    InvalidKey(#[from] KeyError),

    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid prefix /{prefix} for {address}")]
    InvalidPrefix { address: IpAddr, prefix: u8 },

    #[error("Field {0} contains a line break")]
    EmbeddedNewline(&'static str),

    #[error("Parse error: {0}")]
    Parse(String),
}

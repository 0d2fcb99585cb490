//! Node identity and address resolution

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// Default SSH port
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Endpoint supplied by a hosting manager (NAT rule, load balancer port, ...)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

/// Who a node is and where it can be reached
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeIdentity {
    /// Display name
    pub name: String,

    /// Private (cluster network) address
    pub address: IpAddr,

    /// Public address or FQDN
    #[serde(default)]
    pub public_address: Option<String>,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Overrides every other address when set
    #[serde(default)]
    pub endpoint: Option<Endpoint>,
}

fn default_port() -> u16 {
    DEFAULT_SSH_PORT
}

impl NodeIdentity {
    pub fn new(name: impl Into<String>, address: IpAddr) -> Self {
        Self {
            name: name.into(),
            address,
            public_address: None,
            port: DEFAULT_SSH_PORT,
            endpoint: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_public_address(mut self, public_address: impl Into<String>) -> Self {
        self.public_address = Some(public_address.into());
        self
    }

    pub fn with_endpoint(mut self, host: impl Into<String>, port: u16) -> Self {
        self.endpoint = Some(Endpoint {
            host: host.into(),
            port,
        });
        self
    }

    /// Host and port to dial.
    ///
    /// A hosting-manager endpoint wins; otherwise the public address is used
    /// when requested and known; otherwise the private address.
    pub fn resolve(&self, use_public: bool) -> (String, u16) {
        if let Some(endpoint) = &self.endpoint {
            return (endpoint.host.clone(), endpoint.port);
        }

        match (&self.public_address, use_public) {
            (Some(public), true) => (public.clone(), self.port),
            _ => (self.address.to_string(), self.port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node() -> NodeIdentity {
        NodeIdentity::new("manager-0", "10.0.0.10".parse().unwrap())
    }

    #[test]
    fn test_private_by_default() {
        let node = node().with_public_address("manager-0.example.com");
        assert_eq!(node.resolve(false), ("10.0.0.10".to_string(), 22));
    }

    #[test]
    fn test_public_when_requested() {
        let node = node().with_public_address("manager-0.example.com").with_port(2222);
        assert_eq!(
            node.resolve(true),
            ("manager-0.example.com".to_string(), 2222)
        );
    }

    #[test]
    fn test_public_requested_but_unknown() {
        assert_eq!(node().resolve(true), ("10.0.0.10".to_string(), 22));
    }

    #[test]
    fn test_endpoint_override_wins() {
        let node = node()
            .with_public_address("manager-0.example.com")
            .with_endpoint("lb.example.com", 37105);
        assert_eq!(node.resolve(true), ("lb.example.com".to_string(), 37105));
        assert_eq!(node.resolve(false), ("lb.example.com".to_string(), 37105));
    }
}

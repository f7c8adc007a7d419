//! Network topology descriptor.
//!
//! A [`TopologyDescriptor`] is the single validated snapshot of the LAN
//! layout every other component works from. It can only be obtained from
//! [`load_and_validate`] (or [`validate`] when the host check is done
//! separately), so nothing downstream ever sees an address that was not
//! checked against the subnet and the service range.

use crate::config::{keys, RawConfig};
use crate::error::{Result, ShimError};
use crate::network::{host_net, HostNetwork};
use ipnet::Ipv4Net;
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use tracing::{debug, info, instrument};

/// Default name of the shim interface.
pub const DEFAULT_SHIM_NAME: &str = "lanshim0";

/// Default name of the persistent unit.
pub const DEFAULT_UNIT_NAME: &str = "lanshim.service";

/// Longest interface name the kernel accepts (IFNAMSIZ - 1).
const MAX_IFNAME_LEN: usize = 15;

/// Validated network topology.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopologyDescriptor {
    host_interface: String,
    subnet: Ipv4Net,
    gateway: Option<Ipv4Addr>,
    service_range: Ipv4Net,
    services: BTreeMap<String, Ipv4Addr>,
    shim_name: String,
    host_endpoint: Ipv4Addr,
    endpoint_override: bool,
    unit_name: String,
}

impl TopologyDescriptor {
    /// Physical interface the shim is stacked on.
    pub fn host_interface(&self) -> &str {
        &self.host_interface
    }

    pub fn subnet(&self) -> Ipv4Net {
        self.subnet
    }

    pub fn gateway(&self) -> Option<Ipv4Addr> {
        self.gateway
    }

    /// Sub-range reserved for isolated services.
    pub fn service_range(&self) -> Ipv4Net {
        self.service_range
    }

    /// Service name to address.
    pub fn services(&self) -> &BTreeMap<String, Ipv4Addr> {
        &self.services
    }

    /// Name of the shim interface.
    pub fn shim_name(&self) -> &str {
        &self.shim_name
    }

    /// Address the host answers on inside the service range.
    pub fn host_endpoint(&self) -> Ipv4Addr {
        self.host_endpoint
    }

    /// The host endpoint as a single-host network.
    pub fn host_endpoint_net(&self) -> Ipv4Net {
        host_net(self.host_endpoint)
    }

    /// Name of the persistent unit.
    pub fn unit_name(&self) -> &str {
        &self.unit_name
    }

    /// Render the configuration this descriptor was validated from.
    ///
    /// The derived host endpoint is left out unless it was given explicitly,
    /// so re-validating the output recomputes it the same way.
    pub fn to_raw(&self) -> RawConfig {
        let mut raw = RawConfig::new();
        raw.set(keys::HOST_INTERFACE, self.host_interface.clone());
        raw.set(keys::SUBNET, self.subnet.to_string());
        if let Some(gateway) = self.gateway {
            raw.set(keys::GATEWAY, gateway.to_string());
        }
        raw.set(keys::SERVICE_RANGE, self.service_range.to_string());
        raw.set(keys::INTERFACE_NAME, self.shim_name.clone());
        if self.endpoint_override {
            raw.set(keys::HOST_ENDPOINT, self.host_endpoint.to_string());
        }
        raw.set(keys::UNIT_NAME, self.unit_name.clone());
        for (name, addr) in &self.services {
            raw.set(keys::service(name), addr.to_string());
        }
        raw
    }
}

/// Host endpoint by convention: the last usable address before the range's
/// broadcast address.
pub fn derive_host_endpoint(range: Ipv4Net) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(range.broadcast()).saturating_sub(1))
}

/// Whether `addr` is a host address of `net` (not its network or broadcast address).
fn strictly_inside(net: Ipv4Net, addr: Ipv4Addr) -> bool {
    net.contains(&addr) && addr != net.network() && addr != net.broadcast()
}

fn parse_addr(key: &str, value: &str) -> Result<Ipv4Addr> {
    value
        .parse()
        .map_err(|_| ShimError::validation(key, format!("'{}' is not an IPv4 address", value)))
}

fn parse_cidr(key: &str, value: &str) -> Result<Ipv4Net> {
    let net: Ipv4Net = value
        .parse()
        .map_err(|_| ShimError::validation(key, format!("'{}' is not an IPv4 CIDR", value)))?;
    if net.addr() != net.network() {
        return Err(ShimError::validation(
            key,
            format!("'{}' has host bits set; did you mean {}?", value, net.trunc()),
        ));
    }
    Ok(net)
}

fn validate_ifname(key: &str, name: &str) -> Result<()> {
    if name.len() > MAX_IFNAME_LEN {
        return Err(ShimError::validation(
            key,
            format!("'{}' is longer than {} bytes", name, MAX_IFNAME_LEN),
        ));
    }
    if name == "." || name == ".." || name.chars().any(|c| c == '/' || c == ':' || c.is_whitespace())
    {
        return Err(ShimError::validation(key, format!("'{}' is not a valid interface name", name)));
    }
    Ok(())
}

fn validate_service_name(key: &str, name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if valid {
        Ok(())
    } else {
        Err(ShimError::validation(key, format!("'{}' is not a valid service name", name)))
    }
}

/// Validate raw configuration without consulting the host.
///
/// Fails on the first violation; nothing is applied anywhere.
pub fn validate(raw: &RawConfig) -> Result<TopologyDescriptor> {
    let host_interface = raw.require(keys::HOST_INTERFACE)?.to_string();
    validate_ifname(keys::HOST_INTERFACE, &host_interface)?;

    let shim_name = raw.get(keys::INTERFACE_NAME).unwrap_or(DEFAULT_SHIM_NAME).to_string();
    validate_ifname(keys::INTERFACE_NAME, &shim_name)?;
    if shim_name == host_interface {
        return Err(ShimError::validation(
            keys::INTERFACE_NAME,
            format!("shim name must differ from the host interface '{}'", host_interface),
        ));
    }

    let subnet = parse_cidr(keys::SUBNET, raw.require(keys::SUBNET)?)?;

    let service_range = parse_cidr(keys::SERVICE_RANGE, raw.require(keys::SERVICE_RANGE)?)?;
    if service_range.prefix_len() > 30 {
        return Err(ShimError::validation(
            keys::SERVICE_RANGE,
            format!("{} leaves no room for a host endpoint and a service", service_range),
        ));
    }
    if !subnet.contains(&service_range) {
        return Err(ShimError::validation(
            keys::SERVICE_RANGE,
            format!("{} is not inside subnet {}", service_range, subnet),
        ));
    }

    let gateway = match raw.get(keys::GATEWAY) {
        Some(value) => {
            let gateway = parse_addr(keys::GATEWAY, value)?;
            if !strictly_inside(subnet, gateway) {
                return Err(ShimError::validation(
                    keys::GATEWAY,
                    format!("{} is not a host address of subnet {}", gateway, subnet),
                ));
            }
            if service_range.contains(&gateway) {
                return Err(ShimError::validation(
                    keys::GATEWAY,
                    format!("{} lies inside the service range {}", gateway, service_range),
                ));
            }
            Some(gateway)
        }
        None => None,
    };

    let (host_endpoint, endpoint_override) = match raw.get(keys::HOST_ENDPOINT) {
        Some(value) => {
            let endpoint = parse_addr(keys::HOST_ENDPOINT, value)?;
            if !strictly_inside(service_range, endpoint) {
                return Err(ShimError::validation(
                    keys::HOST_ENDPOINT,
                    format!("{} is not a host address of {}", endpoint, service_range),
                ));
            }
            (endpoint, true)
        }
        None => (derive_host_endpoint(service_range), false),
    };

    let mut services = BTreeMap::new();
    let mut defined_by: BTreeMap<String, &str> = BTreeMap::new();
    for (key, name, value) in raw.services() {
        validate_service_name(key, &name)?;
        if let Some(other) = defined_by.get(&name) {
            return Err(ShimError::validation(
                key,
                format!("service '{}' is already defined by {}", name, other),
            ));
        }
        defined_by.insert(name.clone(), key);
        let addr = parse_addr(key, value)?;
        if !strictly_inside(service_range, addr) {
            return Err(ShimError::validation(
                key,
                format!("{} is not a host address of the service range {}", addr, service_range),
            ));
        }
        if addr == host_endpoint {
            return Err(ShimError::validation(
                key,
                format!("{} is the host endpoint address", addr),
            ));
        }
        if let Some((other, _)) = services.iter().find(|(_, a)| **a == addr) {
            return Err(ShimError::validation(
                key,
                format!("{} is already assigned to service '{}'", addr, other),
            ));
        }
        services.insert(name, addr);
    }
    if services.is_empty() {
        return Err(ShimError::validation(
            format!("{}<NAME>{}", keys::SERVICE_PREFIX, keys::SERVICE_SUFFIX),
            "at least one service address is required",
        ));
    }

    let unit_name = raw.get(keys::UNIT_NAME).unwrap_or(DEFAULT_UNIT_NAME).to_string();
    if !unit_name.ends_with(".service") || unit_name.contains('/') {
        return Err(ShimError::validation(
            keys::UNIT_NAME,
            format!("'{}' is not a service unit name", unit_name),
        ));
    }

    debug!(
        subnet = %subnet,
        range = %service_range,
        endpoint = %host_endpoint,
        services = services.len(),
        "Topology validated"
    );

    Ok(TopologyDescriptor {
        host_interface,
        subnet,
        gateway,
        service_range,
        services,
        shim_name,
        host_endpoint,
        endpoint_override,
        unit_name,
    })
}

/// Validate raw configuration and check that the host interface exists.
#[instrument(skip_all)]
pub async fn load_and_validate(raw: &RawConfig, host: &dyn HostNetwork) -> Result<TopologyDescriptor> {
    let descriptor = validate(raw)?;

    let exists = host.interface_exists(descriptor.host_interface()).await.map_err(|e| {
        ShimError::validation(keys::HOST_INTERFACE, format!("cannot inspect interface: {}", e))
    })?;
    if !exists {
        return Err(ShimError::validation(
            keys::HOST_INTERFACE,
            format!("interface '{}' does not exist", descriptor.host_interface()),
        ));
    }

    info!(
        host_interface = %descriptor.host_interface(),
        shim = %descriptor.shim_name(),
        endpoint = %descriptor.host_endpoint(),
        "Loaded topology"
    );
    Ok(descriptor)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn example() -> RawConfig {
        RawConfig::from_pairs([
            ("SHIM_HOST_INTERFACE", "eth0"),
            ("SHIM_SUBNET", "192.168.1.0/24"),
            ("SHIM_GATEWAY", "192.168.1.1"),
            ("SHIM_SERVICE_RANGE", "192.168.1.240/29"),
            ("SHIM_SERVICE_OLLAMA_ADDR", "192.168.1.241"),
            ("SHIM_SERVICE_WHISPER_ADDR", "192.168.1.242"),
        ])
    }

    fn field_of(err: ShimError) -> String {
        match err {
            ShimError::Validation { field, .. } => field,
            other => panic!("expected validation error, got {other}"),
        }
    }

    fn with(key: &str, value: &str) -> RawConfig {
        let mut raw = example();
        raw.set(key, value);
        raw
    }

    #[test]
    fn test_example_topology() {
        let desc = validate(&example()).unwrap();
        assert_eq!(desc.host_interface(), "eth0");
        assert_eq!(desc.shim_name(), DEFAULT_SHIM_NAME);
        assert_eq!(desc.host_endpoint(), Ipv4Addr::new(192, 168, 1, 246));
        assert_eq!(desc.host_endpoint_net().to_string(), "192.168.1.246/32");
        assert_eq!(desc.services().len(), 2);
        assert_eq!(desc.services()["ollama"], Ipv4Addr::new(192, 168, 1, 241));
        assert_eq!(desc.services()["whisper"], Ipv4Addr::new(192, 168, 1, 242));
        assert_eq!(desc.unit_name(), DEFAULT_UNIT_NAME);
    }

    #[test]
    fn test_derive_host_endpoint() {
        assert_eq!(
            derive_host_endpoint("192.168.1.240/29".parse().unwrap()),
            Ipv4Addr::new(192, 168, 1, 246)
        );
        assert_eq!(
            derive_host_endpoint("10.0.0.0/30".parse().unwrap()),
            Ipv4Addr::new(10, 0, 0, 2)
        );
    }

    #[test]
    fn test_missing_host_interface() {
        let mut raw = example();
        raw.remove("SHIM_HOST_INTERFACE");
        assert_eq!(field_of(validate(&raw).unwrap_err()), "SHIM_HOST_INTERFACE");
    }

    #[test]
    fn test_service_outside_range() {
        for addr in ["192.168.1.230", "192.168.1.248", "10.0.0.5"] {
            let err = validate(&with("SHIM_SERVICE_OLLAMA_ADDR", addr)).unwrap_err();
            assert_eq!(field_of(err), "SHIM_SERVICE_OLLAMA_ADDR", "address {addr}");
        }
    }

    #[test]
    fn test_service_on_network_or_broadcast() {
        for addr in ["192.168.1.240", "192.168.1.247"] {
            let err = validate(&with("SHIM_SERVICE_OLLAMA_ADDR", addr)).unwrap_err();
            assert_eq!(field_of(err), "SHIM_SERVICE_OLLAMA_ADDR");
        }
    }

    #[test]
    fn test_service_on_host_endpoint() {
        let err = validate(&with("SHIM_SERVICE_WHISPER_ADDR", "192.168.1.246")).unwrap_err();
        assert_eq!(field_of(err), "SHIM_SERVICE_WHISPER_ADDR");
    }

    #[test]
    fn test_duplicate_service_address() {
        let err = validate(&with("SHIM_SERVICE_WHISPER_ADDR", "192.168.1.241")).unwrap_err();
        assert_eq!(field_of(err), "SHIM_SERVICE_WHISPER_ADDR");
    }

    #[test]
    fn test_service_name_defined_twice() {
        let err = validate(&with("SHIM_SERVICE_ollama_ADDR", "192.168.1.243")).unwrap_err();
        assert_eq!(field_of(err), "SHIM_SERVICE_ollama_ADDR");

        let mut raw = example();
        raw.set("SHIM_SERVICE_A_B_ADDR", "192.168.1.243");
        raw.set("SHIM_SERVICE_A-B_ADDR", "192.168.1.244");
        let err = validate(&raw).unwrap_err();
        assert_eq!(field_of(err), "SHIM_SERVICE_A_B_ADDR");
    }

    #[test]
    fn test_invalid_service_address() {
        let err = validate(&with("SHIM_SERVICE_OLLAMA_ADDR", "192.168.1.300")).unwrap_err();
        assert_eq!(field_of(err), "SHIM_SERVICE_OLLAMA_ADDR");
    }

    #[test]
    fn test_range_outside_subnet() {
        let err = validate(&with("SHIM_SERVICE_RANGE", "192.168.2.240/29")).unwrap_err();
        assert_eq!(field_of(err), "SHIM_SERVICE_RANGE");
    }

    #[test]
    fn test_range_too_small() {
        let err = validate(&with("SHIM_SERVICE_RANGE", "192.168.1.240/31")).unwrap_err();
        assert_eq!(field_of(err), "SHIM_SERVICE_RANGE");
    }

    #[test]
    fn test_cidr_with_host_bits() {
        let err = validate(&with("SHIM_SUBNET", "192.168.1.7/24")).unwrap_err();
        assert_eq!(field_of(err), "SHIM_SUBNET");
    }

    #[test]
    fn test_gateway_outside_subnet() {
        let err = validate(&with("SHIM_GATEWAY", "10.0.0.1")).unwrap_err();
        assert_eq!(field_of(err), "SHIM_GATEWAY");
    }

    #[test]
    fn test_gateway_inside_service_range() {
        let err = validate(&with("SHIM_GATEWAY", "192.168.1.243")).unwrap_err();
        assert_eq!(field_of(err), "SHIM_GATEWAY");
    }

    #[test]
    fn test_gateway_optional() {
        let mut raw = example();
        raw.remove("SHIM_GATEWAY");
        assert_eq!(validate(&raw).unwrap().gateway(), None);
    }

    #[test]
    fn test_no_services() {
        let mut raw = example();
        raw.remove("SHIM_SERVICE_OLLAMA_ADDR");
        raw.remove("SHIM_SERVICE_WHISPER_ADDR");
        assert!(validate(&raw).is_err());
    }

    #[test]
    fn test_shim_name_rules() {
        let err = validate(&with("SHIM_INTERFACE_NAME", "eth0")).unwrap_err();
        assert_eq!(field_of(err), "SHIM_INTERFACE_NAME");

        let err = validate(&with("SHIM_INTERFACE_NAME", "a-very-long-interface")).unwrap_err();
        assert_eq!(field_of(err), "SHIM_INTERFACE_NAME");

        let desc = validate(&with("SHIM_INTERFACE_NAME", "macvlan-shim")).unwrap();
        assert_eq!(desc.shim_name(), "macvlan-shim");
    }

    #[test]
    fn test_endpoint_override() {
        let desc = validate(&with("SHIM_HOST_ENDPOINT", "192.168.1.245")).unwrap();
        assert_eq!(desc.host_endpoint(), Ipv4Addr::new(192, 168, 1, 245));

        let err = validate(&with("SHIM_HOST_ENDPOINT", "192.168.1.241")).unwrap_err();
        assert_eq!(field_of(err), "SHIM_SERVICE_OLLAMA_ADDR");

        let err = validate(&with("SHIM_HOST_ENDPOINT", "192.168.1.247")).unwrap_err();
        assert_eq!(field_of(err), "SHIM_HOST_ENDPOINT");
    }

    #[test]
    fn test_bad_service_name() {
        let err = validate(&with("SHIM_SERVICE_OLL.AMA_ADDR", "192.168.1.243")).unwrap_err();
        assert_eq!(field_of(err), "SHIM_SERVICE_OLL.AMA_ADDR");
    }

    #[test]
    fn test_to_raw_revalidates_identically() {
        let desc = validate(&example()).unwrap();
        let raw = desc.to_raw();
        assert_eq!(raw.get("SHIM_HOST_ENDPOINT"), None);
        assert_eq!(validate(&raw).unwrap(), desc);

        let pinned = validate(&with("SHIM_HOST_ENDPOINT", "192.168.1.245")).unwrap();
        assert_eq!(pinned.to_raw().get("SHIM_HOST_ENDPOINT"), Some("192.168.1.245"));
        assert_eq!(validate(&pinned.to_raw()).unwrap(), pinned);
    }

    #[tokio::test]
    async fn test_load_and_validate_checks_interface() {
        let host = crate::fakes::FakeHostNetwork::with_interface("eth0");
        assert!(load_and_validate(&example(), host.as_ref()).await.is_ok());

        let other = crate::fakes::FakeHostNetwork::with_interface("wlan0");
        let err = load_and_validate(&example(), other.as_ref()).await.unwrap_err();
        assert_eq!(field_of(err), "SHIM_HOST_INTERFACE");
        assert!(other.mutations().is_empty());
    }
}

//! Linux host network backend.
//!
//! Uses the `ip` command: `ip -json` for inspection, plain `ip` for mutation.

#![cfg(target_os = "linux")]

use super::{privilege, HostNetwork, LinkInfo, RouteInfo, MACVLAN_KIND, MACVLAN_MODE};
use crate::error::HostError;
use crate::exec;
use ipnet::Ipv4Net;
use serde::Deserialize;
use std::net::Ipv4Addr;
use tracing::{debug, instrument};

/// iproute2-backed host network.
#[derive(Debug, Clone)]
pub struct IpCommandNetwork {
    ip: String,
}

impl IpCommandNetwork {
    pub fn new() -> Self {
        Self { ip: "ip".to_string() }
    }

    /// Use a specific `ip` binary.
    pub fn with_binary(ip: impl Into<String>) -> Self {
        Self { ip: ip.into() }
    }

    async fn exec_ip(&self, args: &[&str]) -> Result<String, HostError> {
        exec::run(&self.ip, args).await
    }
}

impl Default for IpCommandNetwork {
    fn default() -> Self {
        Self::new()
    }
}

/// Entry of `ip -details -json addr show`.
#[derive(Debug, Deserialize)]
struct IpLink {
    ifname: String,
    #[serde(default)]
    link: Option<String>,
    #[serde(default)]
    flags: Vec<String>,
    #[serde(default)]
    linkinfo: Option<IpLinkInfo>,
    #[serde(default)]
    addr_info: Vec<IpAddrInfo>,
}

#[derive(Debug, Deserialize)]
struct IpLinkInfo {
    #[serde(default)]
    info_kind: Option<String>,
    #[serde(default)]
    info_data: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct IpAddrInfo {
    family: String,
    local: String,
    prefixlen: u8,
}

/// Entry of `ip -json route show`.
#[derive(Debug, Deserialize)]
struct IpRoute {
    dst: String,
    #[serde(default)]
    dev: Option<String>,
}

fn parse_links(command: &str, json: &str) -> Result<Vec<LinkInfo>, HostError> {
    let links: Vec<IpLink> = serde_json::from_str(json)
        .map_err(|e| HostError::Parse { command: command.to_string(), reason: e.to_string() })?;

    links
        .into_iter()
        .map(|link| {
            let ipv4 = link
                .addr_info
                .iter()
                .filter(|a| a.family == "inet")
                .map(|a| {
                    let addr: Ipv4Addr = a.local.parse().map_err(|e| HostError::Parse {
                        command: command.to_string(),
                        reason: format!("address {}: {}", a.local, e),
                    })?;
                    Ipv4Net::new(addr, a.prefixlen).map_err(|e| HostError::Parse {
                        command: command.to_string(),
                        reason: format!("prefix {}: {}", a.prefixlen, e),
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;

            let kind = link.linkinfo.as_ref().and_then(|i| i.info_kind.clone());
            let mode = link
                .linkinfo
                .as_ref()
                .and_then(|i| i.info_data.as_ref())
                .and_then(|d| d.get("mode"))
                .and_then(|m| m.as_str())
                .map(str::to_string);

            Ok(LinkInfo {
                name: link.ifname,
                kind,
                mode,
                parent: link.link,
                up: link.flags.iter().any(|f| f == "UP"),
                ipv4,
            })
        })
        .collect()
}

fn parse_routes(command: &str, json: &str) -> Result<Vec<RouteInfo>, HostError> {
    // `ip -json route show` prints nothing at all when no route matches.
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }

    let routes: Vec<IpRoute> = serde_json::from_str(json)
        .map_err(|e| HostError::Parse { command: command.to_string(), reason: e.to_string() })?;

    routes
        .into_iter()
        .map(|r| {
            let destination = if r.dst.contains('/') {
                r.dst.parse::<Ipv4Net>().map_err(|e| e.to_string())
            } else {
                r.dst.parse::<Ipv4Addr>().map(Ipv4Net::from).map_err(|e| e.to_string())
            }
            .map_err(|reason| HostError::Parse {
                command: command.to_string(),
                reason: format!("destination {}: {}", r.dst, reason),
            })?;

            Ok(RouteInfo { destination, dev: r.dev.unwrap_or_default() })
        })
        .collect()
}

#[async_trait::async_trait]
impl HostNetwork for IpCommandNetwork {
    fn has_net_admin(&self) -> bool {
        privilege::has_net_admin()
    }

    #[instrument(skip(self))]
    async fn interface_exists(&self, name: &str) -> Result<bool, HostError> {
        Ok(self.link(name).await?.is_some())
    }

    #[instrument(skip(self))]
    async fn link(&self, name: &str) -> Result<Option<LinkInfo>, HostError> {
        let args = ["-details", "-json", "addr", "show", "dev", name];
        let json = match self.exec_ip(&args).await {
            Ok(json) => json,
            Err(e) if e.is_not_found() => {
                debug!("Link {} does not exist", name);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let command = exec::command_line(&self.ip, args);
        Ok(parse_links(&command, &json)?.into_iter().find(|l| l.name == name))
    }

    #[instrument(skip(self))]
    async fn add_macvlan(&self, name: &str, parent: &str) -> Result<(), HostError> {
        self.exec_ip(&[
            "link",
            "add",
            name,
            "link",
            parent,
            "type",
            MACVLAN_KIND,
            "mode",
            MACVLAN_MODE,
        ])
        .await
        .map(drop)
    }

    #[instrument(skip(self))]
    async fn add_address(&self, name: &str, address: Ipv4Net) -> Result<(), HostError> {
        let address = address.to_string();
        self.exec_ip(&["addr", "add", &address, "dev", name]).await.map(drop)
    }

    #[instrument(skip(self))]
    async fn set_link_up(&self, name: &str) -> Result<(), HostError> {
        self.exec_ip(&["link", "set", "dev", name, "up"]).await.map(drop)
    }

    #[instrument(skip(self))]
    async fn delete_link(&self, name: &str) -> Result<bool, HostError> {
        match self.exec_ip(&["link", "delete", "dev", name]).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self))]
    async fn routes_to(&self, destination: Ipv4Net) -> Result<Vec<RouteInfo>, HostError> {
        let dst = destination.to_string();
        let args = ["-json", "route", "show", "exact", dst.as_str()];
        let json = self.exec_ip(&args).await?;
        parse_routes(&exec::command_line(&self.ip, args), &json)
    }

    #[instrument(skip(self))]
    async fn add_route(&self, destination: Ipv4Net, dev: &str) -> Result<(), HostError> {
        let dst = destination.to_string();
        self.exec_ip(&["route", "add", &dst, "dev", dev]).await.map(drop)
    }

    #[instrument(skip(self))]
    async fn delete_route(&self, destination: Ipv4Net, dev: &str) -> Result<bool, HostError> {
        let dst = destination.to_string();
        match self.exec_ip(&["route", "delete", &dst, "dev", dev]).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHIM_JSON: &str = r#"[{"ifindex":7,"link":"eth0","ifname":"lanshim0",
        "flags":["BROADCAST","MULTICAST","UP","LOWER_UP"],"mtu":1500,
        "linkinfo":{"info_kind":"macvlan","info_data":{"mode":"bridge","flags":[]}},
        "addr_info":[{"family":"inet","local":"192.168.1.246","prefixlen":32,"scope":"global"},
                     {"family":"inet6","local":"fe80::1","prefixlen":64,"scope":"link"}]}]"#;

    const PHYSICAL_JSON: &str = r#"[{"ifindex":2,"ifname":"eth0",
        "flags":["BROADCAST","MULTICAST","UP","LOWER_UP"],
        "addr_info":[{"family":"inet","local":"192.168.1.10","prefixlen":24}]}]"#;

    #[test]
    fn test_parse_macvlan_link() {
        let links = parse_links("ip addr show", SHIM_JSON).unwrap();
        assert_eq!(links.len(), 1);

        let link = &links[0];
        assert_eq!(link.name, "lanshim0");
        assert_eq!(link.kind.as_deref(), Some("macvlan"));
        assert_eq!(link.mode.as_deref(), Some("bridge"));
        assert_eq!(link.parent.as_deref(), Some("eth0"));
        assert!(link.up);
        assert_eq!(link.ipv4, vec!["192.168.1.246/32".parse::<Ipv4Net>().unwrap()]);
        assert!(link.is_shim_for("eth0", "192.168.1.246/32".parse().unwrap()));
    }

    #[test]
    fn test_parse_physical_link() {
        let links = parse_links("ip addr show", PHYSICAL_JSON).unwrap();
        assert_eq!(links[0].kind, None);
        assert_eq!(links[0].parent, None);
        assert_eq!(links[0].ipv4[0].prefix_len(), 24);
    }

    #[test]
    fn test_parse_links_rejects_garbage() {
        let err = parse_links("ip addr show", "not json").unwrap_err();
        assert!(matches!(err, HostError::Parse { .. }));
    }

    #[test]
    fn test_parse_routes() {
        let json = r#"[{"dst":"192.168.1.241","dev":"lanshim0","scope":"link","flags":[]},
                       {"dst":"192.168.1.240/29","gateway":"192.168.1.1","dev":"eth0","flags":[]}]"#;
        let routes = parse_routes("ip route show", json).unwrap();
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].destination, "192.168.1.241/32".parse::<Ipv4Net>().unwrap());
        assert_eq!(routes[0].dev, "lanshim0");
        assert_eq!(routes[1].destination.prefix_len(), 29);
        assert_eq!(routes[1].dev, "eth0");
    }

    #[test]
    fn test_parse_routes_empty_output() {
        assert!(parse_routes("ip route show", "").unwrap().is_empty());
        assert!(parse_routes("ip route show", "[]\n").unwrap().is_empty());
    }

    #[tokio::test]
    #[ignore] // Requires CAP_NET_ADMIN
    async fn test_macvlan_roundtrip() {
        let net = IpCommandNetwork::new();
        let name = "lanshim-test0";
        let parent = "lanshim-dummy0";

        if exec::run("ip", ["link", "add", parent, "type", "dummy"]).await.is_err() {
            eprintln!("Skipping test: requires CAP_NET_ADMIN");
            return;
        }

        net.add_macvlan(name, parent).await.unwrap();
        let link = net.link(name).await.unwrap().unwrap();
        assert_eq!(link.kind.as_deref(), Some("macvlan"));
        assert_eq!(link.parent.as_deref(), Some(parent));
        assert!(net.delete_link(name).await.unwrap());
        assert!(!net.delete_link(name).await.unwrap());

        let _ = net.delete_link(parent).await;
    }
}

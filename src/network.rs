//! Queries and mutations of live host network state through iproute2.
//!
//! Presence checks never compare raw strings: the kernel may report a
//! single-host address with or without its mask, so every comparison goes
//! through [`compare_address`].

use crate::runner::{describe, CommandRunner};
use crate::types::{AppError, Result};
use ipnet::IpNet;
use std::net::IpAddr;

pub const IP_CMD: &str = "ip";

/// Destination used by the kernel for the default route.
pub const DEFAULT_DESTINATION: &str = "default";

/// One parsed line of the routing table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    pub address: String,
    pub via: Option<String>,
    pub device: Option<String>,
}

/// Network State Accessor backed by the `ip` tool.
pub struct IpWrapper<R> {
    runner: R,
}

impl<R: CommandRunner> IpWrapper<R> {
    pub fn new(runner: R) -> Self {
        IpWrapper { runner }
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// True iff `device` currently exists as a link.
    pub fn has_link(&self, device: &str) -> Result<bool> {
        let args = ["link", "show", "dev", device];
        tracing::debug!("Executing: {}", describe(IP_CMD, &args));
        let output = self.runner.run(IP_CMD, &args)?;
        Ok(output.is_success())
    }

    /// Addresses (with masks, as reported by the kernel) assigned to `device`.
    pub fn get_addresses(&self, device: &str) -> Result<Vec<String>> {
        let stdout = self.execute(&["addr", "show", "dev", device])?;
        Ok(parse_address_listing(&stdout))
    }

    /// Routes whose destination matches `destination` and, when given, whose
    /// gateway and device match too. The whole table is read and filtered here.
    pub fn get_routes_like(
        &self,
        destination: &str,
        via: Option<&str>,
        device: Option<&str>,
    ) -> Result<Vec<RouteEntry>> {
        let ipv6 = destination.contains(':') || via.is_some_and(|v| v.contains(':'));
        let args: &[&str] = if ipv6 {
            &["-6", "route", "show"]
        } else {
            &["route", "show"]
        };
        let stdout = self.execute(args)?;

        let routes = stdout
            .lines()
            .filter_map(parse_route_line)
            .filter(|route| compare_address(&route.address, destination))
            .filter(|route| match via {
                Some(via) => route
                    .via
                    .as_deref()
                    .is_some_and(|route_via| compare_address(route_via, via)),
                None => true,
            })
            .filter(|route| match device {
                Some(device) => route.device.as_deref() == Some(device),
                None => true,
            })
            .collect();

        Ok(routes)
    }

    pub fn add_address(&self, address: &str, device: &str) -> Result<()> {
        self.execute(&["addr", "add", address, "dev", device])
            .map(drop)
    }

    pub fn remove_address(&self, address: &str, device: &str) -> Result<()> {
        self.execute(&["addr", "del", address, "dev", device])
            .map(drop)
    }

    pub fn add_route(&self, destination: &str, via: Option<&str>, device: Option<&str>) -> Result<()> {
        self.execute(&route_args("add", destination, via, device))
            .map(drop)
    }

    pub fn remove_route(
        &self,
        destination: &str,
        via: Option<&str>,
        device: Option<&str>,
    ) -> Result<()> {
        self.execute(&route_args("del", destination, via, device))
            .map(drop)
    }

    /// Removes every address from `device`.
    pub fn flush(&self, device: &str) -> Result<()> {
        self.execute(&["addr", "flush", "dev", device]).map(drop)
    }

    pub fn bring_up_link(&self, device: &str) -> Result<()> {
        self.execute(&["link", "set", "dev", device, "up"]).map(drop)
    }

    /// Runs `ip` and treats any non-zero status as a failure of this call.
    fn execute(&self, args: &[&str]) -> Result<String> {
        let command = describe(IP_CMD, args);
        tracing::debug!("Executing: {}", command);

        let output = self.runner.run(IP_CMD, args)?;
        if !output.is_success() {
            let error = AppError::CommandFailed {
                command,
                status: output.status,
                output: output.combined_output(),
            };
            tracing::error!("{}", error);
            return Err(error);
        }

        Ok(output.stdout)
    }
}

fn route_args<'a>(
    op: &'a str,
    destination: &'a str,
    via: Option<&'a str>,
    device: Option<&'a str>,
) -> Vec<&'a str> {
    let mut args = vec!["route", op, destination];
    if let Some(via) = via {
        args.extend(["via", via]);
    }
    if let Some(device) = device {
        args.extend(["dev", device]);
    }
    args
}

/// Second token of every `inet`/`inet6` line of `ip addr show`.
fn parse_address_listing(listing: &str) -> Vec<String> {
    listing
        .lines()
        .filter_map(|line| {
            let mut tokens = line.split_whitespace();
            match tokens.next() {
                Some("inet") | Some("inet6") => tokens.next().map(str::to_string),
                _ => None,
            }
        })
        .collect()
}

/// Parses one routing table line.
///
/// The first token is the destination; `via`/`dev` keyword pairs are
/// consumed while they lead the remainder. A bare destination is unusable.
pub fn parse_route_line(line: &str) -> Option<RouteEntry> {
    let mut tokens = line.split_whitespace().peekable();
    let address = tokens.next()?.to_string();
    tokens.peek()?;

    let mut route = RouteEntry {
        address,
        via: None,
        device: None,
    };

    while let Some(&keyword) = tokens.peek() {
        match keyword {
            "via" => {
                tokens.next();
                route.via = tokens.next().map(str::to_string);
            }
            "dev" => {
                tokens.next();
                route.device = tokens.next().map(str::to_string);
            }
            _ => break,
        }
    }

    Some(route)
}

/// Lower-cases `address` and drops an implicit single-host mask
/// (`/32` for IPv4, `/128` for IPv6). Other masks are kept verbatim.
pub fn normalize_address(address: &str) -> String {
    let normalized = address.to_lowercase();

    let Some((addr, mask)) = normalized.split_once('/') else {
        return normalized;
    };

    let host_mask = if addr.contains(':') { "128" } else { "32" };
    if mask == host_mask {
        return addr.to_string();
    }

    normalized
}

pub fn compare_address(a: &str, b: &str) -> bool {
    a == b || normalize_address(a) == normalize_address(b)
}

/// First address of the block in `cidr`, always with an explicit mask.
pub fn get_lowest_ip_in_cidr(cidr: &str) -> Result<String> {
    let invalid = || AppError::InvalidCidr(cidr.to_string());

    let net: IpNet = match cidr.split_once('/') {
        Some(_) => cidr.parse().map_err(|_| invalid())?,
        None => {
            let addr: IpAddr = cidr.parse().map_err(|_| invalid())?;
            let host_prefix = if addr.is_ipv4() { 32 } else { 128 };
            IpNet::new(addr, host_prefix).map_err(|_| invalid())?
        }
    };

    Ok(format!("{}/{}", net.network(), net.prefix_len()))
}

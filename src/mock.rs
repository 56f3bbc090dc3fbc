//! In-memory host for testing.
//!
//! `MockHost` answers the `ip` invocations issued by `IpWrapper` from a
//! small model of links, addresses and routes, records every invocation,
//! and can be told to fail commands, making reconciliation deterministic
//! to test without touching the real network stack.

use std::cell::RefCell;
use std::collections::BTreeMap;

use crate::network::{compare_address, RouteEntry, IP_CMD};
use crate::runner::{describe, CommandOutput, CommandRunner};

#[derive(Debug, Default, Clone)]
struct Link {
    up: bool,
    addresses: Vec<String>,
}

#[derive(Debug, Default)]
struct HostState {
    links: BTreeMap<String, Link>,
    routes: Vec<RouteEntry>,
}

/// A test double that models a host's links, addresses and routes.
#[derive(Debug, Default)]
pub struct MockHost {
    state: RefCell<HostState>,
    commands: RefCell<Vec<String>>,
    failures: RefCell<Vec<String>>,
}

impl MockHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_link(&self, name: &str) {
        self.state
            .borrow_mut()
            .links
            .entry(name.to_string())
            .or_default();
    }

    /// Unplugs a link, dropping its addresses and the routes through it.
    pub fn remove_link(&self, name: &str) {
        let mut state = self.state.borrow_mut();
        state.links.remove(name);
        state
            .routes
            .retain(|route| route.device.as_deref() != Some(name));
    }

    pub fn link_is_up(&self, name: &str) -> bool {
        self.state
            .borrow()
            .links
            .get(name)
            .is_some_and(|link| link.up)
    }

    /// Assigns an address behind the daemon's back.
    pub fn insert_address(&self, device: &str, address: &str) {
        if let Some(link) = self.state.borrow_mut().links.get_mut(device) {
            link.addresses.push(with_host_mask(address));
        }
    }

    /// Inserts a route behind the daemon's back.
    pub fn insert_route(&self, address: &str, via: Option<&str>, device: Option<&str>) {
        self.state.borrow_mut().routes.push(RouteEntry {
            address: address.to_string(),
            via: via.map(str::to_string),
            device: device.map(str::to_string),
        });
    }

    pub fn addresses(&self, device: &str) -> Vec<String> {
        self.state
            .borrow()
            .links
            .get(device)
            .map(|link| link.addresses.clone())
            .unwrap_or_default()
    }

    pub fn routes(&self) -> Vec<RouteEntry> {
        self.state.borrow().routes.clone()
    }

    /// Every command line executed so far, in order.
    pub fn executed_commands(&self) -> Vec<String> {
        self.commands.borrow().clone()
    }

    /// Executed commands that change host state.
    pub fn mutating_commands(&self) -> Vec<String> {
        self.commands
            .borrow()
            .iter()
            .filter(|cmd| !cmd.ends_with(" show") && !cmd.contains(" show "))
            .cloned()
            .collect()
    }

    pub fn clear_commands(&self) {
        self.commands.borrow_mut().clear();
    }

    /// Makes every command whose line starts with `prefix` exit with status 2.
    pub fn fail_on(&self, prefix: &str) {
        self.failures.borrow_mut().push(prefix.to_string());
    }

    pub fn clear_failures(&self) {
        self.failures.borrow_mut().clear();
    }

    fn dispatch(&self, args: &[&str]) -> CommandOutput {
        let mut state = self.state.borrow_mut();

        match args {
            ["link", "show", "dev", dev] => match state.links.get(*dev) {
                Some(link) => CommandOutput::success(format!(
                    "2: {}: <BROADCAST,MULTICAST{}> mtu 1500\n",
                    dev,
                    if link.up { ",UP,LOWER_UP" } else { "" }
                )),
                None => missing_device(dev),
            },
            ["link", "set", "dev", dev, "up"] => match state.links.get_mut(*dev) {
                Some(link) => {
                    link.up = true;
                    CommandOutput::success("")
                }
                None => missing_device(dev),
            },
            ["addr", "show", "dev", dev] => match state.links.get(*dev) {
                Some(link) => CommandOutput::success(address_listing(dev, link)),
                None => missing_device(dev),
            },
            ["addr", "add", address, "dev", dev] => match state.links.get_mut(*dev) {
                Some(link) => {
                    if link.addresses.iter().any(|a| compare_address(a, address)) {
                        return CommandOutput::failure(2, "RTNETLINK answers: File exists");
                    }
                    link.addresses.push(with_host_mask(address));
                    CommandOutput::success("")
                }
                None => missing_device(dev),
            },
            ["addr", "del", address, "dev", dev] => match state.links.get_mut(*dev) {
                Some(link) => match link.addresses.iter().position(|a| compare_address(a, address)) {
                    Some(index) => {
                        link.addresses.remove(index);
                        CommandOutput::success("")
                    }
                    None => CommandOutput::failure(
                        2,
                        "RTNETLINK answers: Cannot assign requested address",
                    ),
                },
                None => missing_device(dev),
            },
            ["addr", "flush", "dev", dev] => match state.links.get_mut(*dev) {
                Some(link) => {
                    link.addresses.clear();
                    CommandOutput::success("")
                }
                None => missing_device(dev),
            },
            ["route", "show"] => CommandOutput::success(route_listing(&state.routes, false)),
            ["-6", "route", "show"] => CommandOutput::success(route_listing(&state.routes, true)),
            ["route", op @ ("add" | "del"), destination, rest @ ..] => {
                let Some(route) = parse_route_spec(destination, rest) else {
                    return CommandOutput::failure(1, "Command line is not complete.");
                };
                if let Some(dev) = route.device.as_deref() {
                    if !state.links.contains_key(dev) {
                        return missing_device(dev);
                    }
                }
                let existing = state.routes.iter().position(|r| {
                    compare_address(&r.address, &route.address)
                        && (route.via.is_none() || r.via == route.via)
                        && (route.device.is_none() || r.device == route.device)
                });
                match (*op, existing) {
                    ("add", Some(_)) => CommandOutput::failure(2, "RTNETLINK answers: File exists"),
                    ("add", None) => {
                        state.routes.push(route);
                        CommandOutput::success("")
                    }
                    (_, Some(index)) => {
                        state.routes.remove(index);
                        CommandOutput::success("")
                    }
                    (_, None) => CommandOutput::failure(2, "RTNETLINK answers: No such process"),
                }
            }
            _ => CommandOutput::failure(255, format!("unsupported: {}", args.join(" "))),
        }
    }
}

impl CommandRunner for MockHost {
    fn run(&self, program: &str, args: &[&str]) -> std::io::Result<CommandOutput> {
        let line = describe(program, args);
        self.commands.borrow_mut().push(line.clone());

        if program != IP_CMD {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("mock: no such program '{}'", program),
            ));
        }

        if self.failures.borrow().iter().any(|prefix| line.starts_with(prefix.as_str())) {
            return Ok(CommandOutput::failure(2, "mock: injected failure"));
        }

        Ok(self.dispatch(args))
    }
}

fn missing_device(dev: &str) -> CommandOutput {
    CommandOutput::failure(1, format!("Device \"{}\" does not exist.", dev))
}

/// The kernel always reports a mask; bare addresses become single-host.
fn with_host_mask(address: &str) -> String {
    if address.contains('/') {
        address.to_string()
    } else if address.contains(':') {
        format!("{}/128", address)
    } else {
        format!("{}/32", address)
    }
}

fn address_listing(dev: &str, link: &Link) -> String {
    let mut listing = format!(
        "2: {}: <BROADCAST,MULTICAST{}> mtu 1500 qdisc fq_codel state {}\n    link/ether 52:54:00:12:34:56 brd ff:ff:ff:ff:ff:ff\n",
        dev,
        if link.up { ",UP,LOWER_UP" } else { "" },
        if link.up { "UP" } else { "DOWN" }
    );
    for address in &link.addresses {
        let family = if address.contains(':') { "inet6" } else { "inet" };
        listing.push_str(&format!(
            "    {} {} scope global {}\n       valid_lft forever preferred_lft forever\n",
            family, address, dev
        ));
    }
    listing
}

fn is_ipv6_route(route: &RouteEntry) -> bool {
    route.address.contains(':') || route.via.as_deref().is_some_and(|via| via.contains(':'))
}

fn route_listing(routes: &[RouteEntry], ipv6: bool) -> String {
    routes
        .iter()
        .filter(|route| is_ipv6_route(route) == ipv6)
        .map(|route| {
            let mut line = route.address.clone();
            if let Some(via) = &route.via {
                line.push_str(&format!(" via {}", via));
            }
            if let Some(dev) = &route.device {
                line.push_str(&format!(" dev {}", dev));
            }
            line.push_str(if route.via.is_some() {
                " proto static\n"
            } else {
                " proto kernel scope link\n"
            });
            line
        })
        .collect()
}

fn parse_route_spec(destination: &str, rest: &[&str]) -> Option<RouteEntry> {
    let mut route = RouteEntry {
        address: destination.to_string(),
        via: None,
        device: None,
    };
    for pair in rest.chunks(2) {
        match pair {
            ["via", via] => route.via = Some(via.to_string()),
            ["dev", dev] => route.device = Some(dev.to_string()),
            _ => return None,
        }
    }
    Some(route)
}

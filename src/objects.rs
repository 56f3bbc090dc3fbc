//! Managed network objects: the addresses and routes a reconciler owns.
//!
//! `apply` and `revert` are idempotent. Both query live state first and only
//! mutate when it differs from what the object wants.

use crate::network::{compare_address, IpWrapper, DEFAULT_DESTINATION};
use crate::runner::CommandRunner;
use crate::types::Result;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectKind {
    Address {
        address: String,
        device: String,
    },
    Route {
        address: String,
        via: Option<String>,
        device: Option<String>,
    },
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectKind::Address { address, device } => {
                write!(f, "address '{}' on '{}'", address, device)
            }
            ObjectKind::Route {
                address,
                via,
                device,
            } => {
                write!(f, "route '{}'", address)?;
                if let Some(via) = via {
                    write!(f, " via '{}'", via)?;
                }
                if let Some(device) = device {
                    write!(f, " dev '{}'", device)?;
                }
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedObject {
    kind: ObjectKind,
    applied: bool,
    virtually_applied: bool,
}

impl ManagedObject {
    fn new(kind: ObjectKind) -> Self {
        ManagedObject {
            kind,
            applied: false,
            virtually_applied: false,
        }
    }

    pub fn address(address: &str, device: &str) -> Self {
        Self::new(ObjectKind::Address {
            address: address.to_string(),
            device: device.to_string(),
        })
    }

    pub fn route(address: &str, via: Option<&str>, device: Option<&str>) -> Self {
        Self::new(ObjectKind::Route {
            address: address.to_string(),
            via: via.map(str::to_string),
            device: device.map(str::to_string),
        })
    }

    /// Default route through `gateway`, on whatever device the kernel picks.
    pub fn default_route(gateway: &str) -> Self {
        Self::route(DEFAULT_DESTINATION, Some(gateway), None)
    }

    pub fn kind(&self) -> &ObjectKind {
        &self.kind
    }

    /// Address for `Address` objects, destination for routes.
    pub fn target(&self) -> &str {
        match &self.kind {
            ObjectKind::Address { address, .. } | ObjectKind::Route { address, .. } => address,
        }
    }

    pub fn is_address(&self) -> bool {
        matches!(self.kind, ObjectKind::Address { .. })
    }

    pub fn is_default_route(&self) -> bool {
        matches!(
            &self.kind,
            ObjectKind::Route { address, device: None, .. } if address == DEFAULT_DESTINATION
        )
    }

    /// Connected route bound to `address`.
    pub fn is_route_to(&self, address: &str) -> bool {
        !self.is_default_route()
            && matches!(&self.kind, ObjectKind::Route { address: a, .. } if a == address)
    }

    pub fn is_applied(&self) -> bool {
        self.applied
    }

    pub fn is_virtually_applied(&self) -> bool {
        self.virtually_applied
    }

    pub fn apply<R: CommandRunner>(&mut self, ip: &IpWrapper<R>, dry_run: bool) -> Result<()> {
        if self.is_present(ip)? || self.virtually_applied {
            return Ok(());
        }

        tracing::info!("Adding {}", self.kind);
        if dry_run {
            self.virtually_applied = true;
        } else {
            match &self.kind {
                ObjectKind::Address { address, device } => ip.add_address(address, device)?,
                ObjectKind::Route {
                    address,
                    via,
                    device,
                } => ip.add_route(address, via.as_deref(), device.as_deref())?,
            }
        }
        self.applied = true;

        Ok(())
    }

    /// Removes the object, but only if this object put it there.
    pub fn revert<R: CommandRunner>(&mut self, ip: &IpWrapper<R>, dry_run: bool) -> Result<()> {
        if !(self.is_present(ip)? || self.virtually_applied) || !self.applied {
            return Ok(());
        }

        tracing::info!("Removing {}", self.kind);
        if dry_run {
            self.virtually_applied = false;
        } else {
            match &self.kind {
                ObjectKind::Address { address, device } => ip.remove_address(address, device)?,
                ObjectKind::Route {
                    address,
                    via,
                    device,
                } => ip.remove_route(address, via.as_deref(), device.as_deref())?,
            }
        }

        Ok(())
    }

    fn is_present<R: CommandRunner>(&self, ip: &IpWrapper<R>) -> Result<bool> {
        match &self.kind {
            ObjectKind::Address { address, device } => Ok(ip
                .get_addresses(device)?
                .iter()
                .any(|assigned| compare_address(assigned, address))),
            ObjectKind::Route {
                address,
                via,
                device,
            } => Ok(!ip
                .get_routes_like(address, via.as_deref(), device.as_deref())?
                .is_empty()),
        }
    }
}

//! Per-interface reconciliation.
//!
//! An `InterfaceReconciler` owns the ordered objects derived from one
//! interface's configuration. Objects are applied primary address first,
//! then secondaries, the connected route and the default route; they are
//! reverted in the exact reverse order.

use crate::config::validate_interface_config;
use crate::network::IpWrapper;
use crate::objects::ManagedObject;
use crate::runner::CommandRunner;
use crate::types::{AppError, InterfaceConfig, LinkPresence, RawInterfaceConfig, Result};
use std::collections::VecDeque;

#[derive(Debug)]
pub struct InterfaceReconciler {
    name: String,
    config: InterfaceConfig,
    objects: Vec<ManagedObject>,
    pending_revert: VecDeque<ManagedObject>,
    link: LinkPresence,
}

impl InterfaceReconciler {
    /// Validates `raw` and builds the canonical object list for `name`.
    pub fn boot(name: &str, raw: &RawInterfaceConfig) -> Result<Self> {
        let config = validate_interface_config(name, raw)?;

        let mut objects = Vec::with_capacity(config.secondary_ips.len() + 3);
        objects.push(ManagedObject::address(&config.primary_ip, name));
        for ip in &config.secondary_ips {
            objects.push(ManagedObject::address(ip, name));
        }
        // bound to the primary address itself; a kernel lists the connected
        // route under the network address (10.0.0.0/24 for 10.0.0.1/24)
        objects.push(ManagedObject::route(&config.primary_ip, None, Some(name)));
        if let Some(gateway) = &config.default_route {
            objects.push(ManagedObject::default_route(gateway));
        }

        Ok(InterfaceReconciler {
            name: name.to_string(),
            config,
            objects,
            pending_revert: VecDeque::new(),
            link: LinkPresence::Unknown,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &InterfaceConfig {
        &self.config
    }

    pub fn objects(&self) -> &[ManagedObject] {
        &self.objects
    }

    pub fn pending_revert(&self) -> impl Iterator<Item = &ManagedObject> {
        self.pending_revert.iter()
    }

    pub fn link_presence(&self) -> LinkPresence {
        self.link
    }

    pub fn is_hotpluggable(&self) -> bool {
        self.config.hotplug
    }

    /// One convergence pass.
    ///
    /// On a failed object every object applied earlier in this pass is
    /// reverted and the error is returned; the remaining objects are skipped.
    pub fn apply<R: CommandRunner>(&mut self, ip: &IpWrapper<R>, dry_run: bool) -> Result<()> {
        let has_link = ip.has_link(&self.name)?;
        let presence = LinkPresence::from(has_link);

        if presence != self.link {
            if !has_link && !self.is_hotpluggable() {
                tracing::error!("Missing link '{}'", self.name);
                return Err(AppError::LinkMissing(self.name.clone()));
            }

            tracing::info!(
                "{} link '{}'",
                if has_link { "Found" } else { "Missing" },
                self.name
            );
            self.link = presence;

            // whatever is on a freshly appeared link was not put there by us
            if has_link {
                self.flush(ip, dry_run)?;
            }
        }

        if !has_link {
            return Ok(());
        }

        while let Some(mut object) = self.pending_revert.pop_front() {
            object.revert(ip, dry_run)?;
        }

        for index in 0..self.objects.len() {
            if let Err(e) = self.objects[index].apply(ip, dry_run) {
                tracing::error!(
                    "Something went wrong for '{}', reverting actions",
                    self.name
                );
                for object in self.objects[..index].iter_mut().rev() {
                    if let Err(revert_err) = object.revert(ip, dry_run) {
                        tracing::error!(
                            "Rollback of {} on '{}' failed: {}",
                            object.kind(),
                            self.name,
                            revert_err
                        );
                    }
                }
                return Err(e);
            }
        }

        Ok(())
    }

    /// Reverts objects retired by a reload, then every object, last applied
    /// first.
    pub fn revert<R: CommandRunner>(&mut self, ip: &IpWrapper<R>, dry_run: bool) -> Result<()> {
        let has_link = ip.has_link(&self.name)?;
        if self.is_hotpluggable() && !has_link {
            return Ok(());
        }

        let mut result = Ok(());
        if has_link {
            while let Some(mut object) = self.pending_revert.pop_front() {
                if let Err(e) = object.revert(ip, dry_run) {
                    tracing::error!("Reverting {} on '{}' failed: {}", object.kind(), self.name, e);
                    if result.is_ok() {
                        result = Err(e);
                    }
                }
            }
        }

        for object in self.objects.iter_mut().rev() {
            if let Err(e) = object.revert(ip, dry_run) {
                tracing::error!("Reverting {} on '{}' failed: {}", object.kind(), self.name, e);
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }

    /// Removes every address from the interface.
    pub fn flush<R: CommandRunner>(&self, ip: &IpWrapper<R>, dry_run: bool) -> Result<()> {
        tracing::info!("Flushing '{}'", self.name);
        if dry_run {
            return Ok(());
        }
        ip.flush(&self.name)
    }

    /// Swaps in a new configuration, touching only what changed.
    ///
    /// Nothing is executed here: objects that left the configuration are
    /// queued for revert and new ones are picked up by the next `apply`.
    /// An invalid configuration leaves the current one in place.
    pub fn reload(&mut self, raw: &RawInterfaceConfig) -> Result<()> {
        let config = match validate_interface_config(&self.name, raw) {
            Ok(config) => config,
            Err(e) => {
                tracing::error!(
                    "Reloading config for '{}' failed, continuing on old config",
                    self.name
                );
                return Err(e);
            }
        };

        if config.default_route != self.config.default_route {
            self.retire_objects(ManagedObject::is_default_route);
            if let Some(gateway) = &config.default_route {
                self.objects.push(ManagedObject::default_route(gateway));
            }
        }

        if config.primary_ip != self.config.primary_ip {
            let old_primary = self.config.primary_ip.clone();
            self.retire_objects(|object| object.is_route_to(&old_primary));
            self.objects.push(ManagedObject::route(
                &config.primary_ip,
                None,
                Some(&self.name),
            ));
        }

        let current = self.config.all_addresses();
        let wanted = config.all_addresses();
        let to_remove: Vec<String> = current
            .iter()
            .filter(|address| !wanted.contains(*address))
            .map(|address| address.to_string())
            .collect();
        let to_add: Vec<String> = wanted
            .iter()
            .filter(|address| !current.contains(*address))
            .map(|address| address.to_string())
            .collect();

        self.retire_objects(|object| {
            object.is_address() && to_remove.iter().any(|address| address == object.target())
        });
        for address in &to_add {
            self.objects.push(ManagedObject::address(address, &self.name));
        }

        self.config = config;
        self.restore_order();

        tracing::info!(
            "Reloaded config for '{}', next cycle changes will be applied",
            self.name
        );
        Ok(())
    }

    /// Queues `object` for revert on the next pass, or drops it when the
    /// link is not known to be present: there is nothing on it to remove.
    pub fn schedule_revert(&mut self, object: ManagedObject) {
        if self.link == LinkPresence::Present {
            self.pending_revert.push_back(object);
        } else {
            tracing::debug!(
                "Discarding {} of '{}', link is not present",
                object.kind(),
                self.name
            );
        }
    }

    fn retire_objects(&mut self, retire: impl Fn(&ManagedObject) -> bool) {
        let (retired, kept): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.objects).into_iter().partition(|o| retire(o));
        self.objects = kept;
        for object in retired {
            self.schedule_revert(object);
        }
    }

    /// Re-establishes the canonical apply order after a reload appended
    /// objects; surviving objects keep their runtime state.
    fn restore_order(&mut self) {
        let config = &self.config;
        let last = config.secondary_ips.len() + 1;
        self.objects.sort_by_key(|object| {
            if object.is_default_route() {
                last + 1
            } else if object.is_address() {
                config
                    .all_addresses()
                    .iter()
                    .position(|address| *address == object.target())
                    .unwrap_or(last)
            } else {
                last
            }
        });
    }
}

//! The control loop: owns every interface reconciler and drives them on a
//! fixed period.

use crate::config::ConfigSource;
use crate::interface::InterfaceReconciler;
use crate::network::IpWrapper;
use crate::runner::CommandRunner;
use crate::signals::SignalLatch;
use crate::types::{AppError, ControlCommand, RawInterfaceConfig, Result};
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;
use tokio::time::MissedTickBehavior;

pub const TICK_PERIOD: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, Default)]
pub struct DaemonOptions {
    pub dry_run: bool,
    pub keep_on_exit: bool,
    pub flush_on_boot: bool,
}

pub struct Daemon<R> {
    ip: IpWrapper<R>,
    source: ConfigSource,
    options: DaemonOptions,
    reconcilers: BTreeMap<String, InterfaceReconciler>,
    pending_flush: VecDeque<String>,
    pending_revert: VecDeque<InterfaceReconciler>,
    stop_requested: bool,
}

impl<R: CommandRunner> Daemon<R> {
    /// Loads `source` and boots a reconciler per interface. Every interface
    /// is validated, so all violations are logged before the first error is
    /// returned.
    pub fn boot(ip: IpWrapper<R>, source: ConfigSource, options: DaemonOptions) -> Result<Self> {
        if options.dry_run {
            tracing::info!("Running in dry-run mode, nothing will be changed");
        }

        let interfaces = source.load()?;

        let mut reconcilers = BTreeMap::new();
        let mut first_error = None;
        for (name, raw) in &interfaces {
            match InterfaceReconciler::boot(name, raw) {
                Ok(reconciler) => {
                    reconcilers.insert(name.clone(), reconciler);
                }
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first_error {
            tracing::error!("Failed to boot, exiting");
            return Err(e);
        }

        let pending_flush = if options.flush_on_boot {
            reconcilers.keys().cloned().collect()
        } else {
            VecDeque::new()
        };

        tracing::info!("Managing {} interface(s)", reconcilers.len());
        Ok(Daemon {
            ip,
            source,
            options,
            reconcilers,
            pending_flush,
            pending_revert: VecDeque::new(),
            stop_requested: false,
        })
    }

    pub fn ip(&self) -> &IpWrapper<R> {
        &self.ip
    }

    pub fn reconcilers(&self) -> &BTreeMap<String, InterfaceReconciler> {
        &self.reconcilers
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested
    }

    /// One convergence round: queued flushes, queued reverts, then `apply`
    /// on every live reconciler. A reconciler that fails is unloaded.
    pub fn tick(&mut self) -> Result<()> {
        let dry_run = self.options.dry_run;

        while let Some(name) = self.pending_flush.pop_front() {
            if let Some(reconciler) = self.reconcilers.get(&name) {
                if let Err(e) = reconciler.flush(&self.ip, dry_run) {
                    tracing::error!("Flushing '{}' failed: {}", name, e);
                }
            }
        }

        self.revert_removed();

        let ip = &self.ip;
        self.reconcilers
            .retain(|name, reconciler| match reconciler.apply(ip, dry_run) {
                Ok(()) => true,
                Err(e) => {
                    tracing::error!(
                        "Management for '{}' crashed ({}), unloading from static-netd",
                        name,
                        e
                    );
                    false
                }
            });

        if self.reconcilers.is_empty() {
            tracing::error!("No interfaces to manage anymore, exiting");
            return Err(AppError::NoInterfaces);
        }

        Ok(())
    }

    pub fn handle(&mut self, command: ControlCommand) {
        match command {
            ControlCommand::Reload => {
                tracing::info!("Reload requested");
                self.request_reload();
            }
            ControlCommand::Shutdown => {
                tracing::info!("Shutdown requested");
                self.shutdown();
            }
        }
    }

    fn request_reload(&mut self) {
        if self.source.path.is_none() {
            tracing::warn!("Reloading with --no-config is useless");
            return;
        }

        let result = self
            .source
            .load()
            .and_then(|interfaces| self.reload(&interfaces));
        match result {
            Ok(rejected) if rejected.is_empty() => tracing::info!("Configuration reloaded"),
            Ok(rejected) => tracing::warn!(
                "Configuration reloaded, {} interface(s) kept their previous config: {}",
                rejected.len(),
                rejected.join(", ")
            ),
            Err(e) => tracing::error!("Reloading failed, nothing done: {}", e),
        }
    }

    /// Diffs the live interfaces against `interfaces`.
    ///
    /// New interfaces are booted first; if any of them fails nothing at all
    /// changes. Otherwise removed interfaces are queued for revert and kept
    /// ones reload their own configuration. Returns the kept interfaces whose
    /// new configuration was rejected; they stay on their previous one.
    pub fn reload(
        &mut self,
        interfaces: &BTreeMap<String, RawInterfaceConfig>,
    ) -> Result<Vec<String>> {
        let to_remove: Vec<String> = self
            .reconcilers
            .keys()
            .filter(|name| !interfaces.contains_key(*name))
            .cloned()
            .collect();
        let to_reload: Vec<String> = self
            .reconcilers
            .keys()
            .filter(|name| interfaces.contains_key(*name))
            .cloned()
            .collect();

        let mut booted = Vec::new();
        let mut first_error = None;
        for (name, raw) in interfaces {
            if self.reconcilers.contains_key(name) {
                continue;
            }
            match InterfaceReconciler::boot(name, raw) {
                Ok(reconciler) => booted.push(reconciler),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        for reconciler in booted {
            tracing::info!("Managing new interface '{}'", reconciler.name());
            self.reconcilers
                .insert(reconciler.name().to_string(), reconciler);
        }

        for name in to_remove {
            if let Some(reconciler) = self.reconcilers.remove(&name) {
                tracing::info!("No longer managing '{}'", name);
                self.schedule_revert(reconciler);
            }
        }

        let mut rejected = Vec::new();
        for name in to_reload {
            if let (Some(reconciler), Some(raw)) =
                (self.reconcilers.get_mut(&name), interfaces.get(&name))
            {
                if reconciler.reload(raw).is_err() {
                    rejected.push(name);
                }
            }
        }

        Ok(rejected)
    }

    fn schedule_revert(&mut self, reconciler: InterfaceReconciler) {
        if self.options.keep_on_exit {
            return;
        }
        self.pending_revert.push_back(reconciler);
    }

    fn revert_removed(&mut self) {
        let dry_run = self.options.dry_run;
        while let Some(mut reconciler) = self.pending_revert.pop_front() {
            if let Err(e) = reconciler.revert(&self.ip, dry_run) {
                tracing::error!("Reverting removed '{}' failed: {}", reconciler.name(), e);
            }
        }
    }

    /// Stops the loop and, unless state is kept on exit, reverts everything,
    /// including interfaces and objects a reload left queued for revert.
    pub fn shutdown(&mut self) {
        if self.options.keep_on_exit {
            tracing::info!("Keeping addresses and routes in place");
            self.stop_requested = true;
            return;
        }

        self.revert_removed();

        let dry_run = self.options.dry_run;
        for (name, reconciler) in self.reconcilers.iter_mut() {
            if let Err(e) = reconciler.revert(&self.ip, dry_run) {
                tracing::error!("Reverting '{}' failed: {}", name, e);
            }
        }

        self.stop_requested = true;
    }
}

/// Runs the fixed-period loop until a shutdown is requested or no
/// interface is left to manage.
///
/// Latched commands are drained at the top of every tick; the tick itself
/// is synchronous and never interleaves with a command.
pub async fn run<R: CommandRunner>(daemon: &mut Daemon<R>, latch: &mut SignalLatch) -> Result<()> {
    let mut interval = tokio::time::interval(TICK_PERIOD);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        interval.tick().await;

        for command in latch.drain() {
            daemon.handle(command);
        }
        if daemon.stop_requested() {
            tracing::info!("Stopped");
            return Ok(());
        }

        daemon.tick()?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockHost;

    fn raw(yaml: &str) -> RawInterfaceConfig {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn daemon_with(
        links: &[&str],
        interfaces: &[(&str, &str)],
        options: DaemonOptions,
    ) -> Result<Daemon<MockHost>> {
        let host = MockHost::new();
        for link in links {
            host.add_link(link);
        }
        let mut daemon = Daemon::boot(IpWrapper::new(host), ConfigSource::default(), options)?;
        let interfaces: BTreeMap<String, RawInterfaceConfig> = interfaces
            .iter()
            .map(|(name, yaml)| (name.to_string(), raw(yaml)))
            .collect();
        daemon.reload(&interfaces)?;
        Ok(daemon)
    }

    #[test]
    fn boot_fails_when_any_interface_is_invalid() {
        let source = ConfigSource {
            path: None,
            interface_override: Some(("eth0".to_string(), raw("primary-ip: nope"))),
        };
        let result = Daemon::boot(IpWrapper::new(MockHost::new()), source, DaemonOptions::default());
        assert!(matches!(result, Err(AppError::InvalidConfig { .. })));
    }

    #[test]
    fn tick_unloads_failing_interfaces() {
        let mut daemon = daemon_with(
            &["eth0"],
            &[("eth0", "primary-ip: 10.0.0.1/24"), ("eth1", "primary-ip: 10.1.0.1/24")],
            DaemonOptions::default(),
        )
        .unwrap();

        daemon.tick().unwrap();
        assert_eq!(daemon.reconcilers().keys().collect::<Vec<_>>(), vec!["eth0"]);

        daemon.ip().runner().remove_link("eth0");
        assert!(matches!(daemon.tick(), Err(AppError::NoInterfaces)));
        assert!(daemon.reconcilers().is_empty());
    }

    #[test]
    fn empty_daemon_exits_on_first_tick() {
        let mut daemon = Daemon::boot(
            IpWrapper::new(MockHost::new()),
            ConfigSource::default(),
            DaemonOptions::default(),
        )
        .unwrap();
        assert!(matches!(daemon.tick(), Err(AppError::NoInterfaces)));
    }

    #[test]
    fn flush_on_boot_runs_before_apply() {
        let source = ConfigSource {
            path: None,
            interface_override: Some(("eth0".to_string(), raw("primary-ip: 10.0.0.1/24"))),
        };
        let host = MockHost::new();
        host.add_link("eth0");
        let options = DaemonOptions {
            flush_on_boot: true,
            ..DaemonOptions::default()
        };
        let mut daemon = Daemon::boot(IpWrapper::new(host), source, options).unwrap();

        daemon.tick().unwrap();

        let commands = daemon.ip().runner().mutating_commands();
        assert_eq!(commands[0], "ip addr flush dev eth0");
        assert_eq!(commands.last().unwrap(), "ip route add 10.0.0.1/24 dev eth0");
    }

    #[test]
    fn reload_adds_and_removes_interfaces() {
        let mut daemon = daemon_with(
            &["eth0", "eth1"],
            &[("eth0", "primary-ip: 10.0.0.1/24")],
            DaemonOptions::default(),
        )
        .unwrap();
        daemon.tick().unwrap();

        let next: BTreeMap<String, RawInterfaceConfig> =
            [("eth1".to_string(), raw("primary-ip: 10.1.0.1/24"))].into();
        daemon.reload(&next).unwrap();
        assert_eq!(daemon.reconcilers().keys().collect::<Vec<_>>(), vec!["eth1"]);

        daemon.ip().runner().clear_commands();
        daemon.tick().unwrap();
        assert_eq!(
            daemon.ip().runner().mutating_commands(),
            vec![
                "ip route del 10.0.0.1/24 dev eth0",
                "ip addr del 10.0.0.1/24 dev eth0",
                "ip addr flush dev eth1",
                "ip addr add 10.1.0.1/24 dev eth1",
                "ip route add 10.1.0.1/24 dev eth1",
            ]
        );
    }

    #[test]
    fn reload_is_aborted_when_a_new_interface_fails_to_boot() {
        let mut daemon = daemon_with(
            &["eth0"],
            &[("eth0", "primary-ip: 10.0.0.1/24")],
            DaemonOptions::default(),
        )
        .unwrap();

        let next: BTreeMap<String, RawInterfaceConfig> = [
            ("eth0".to_string(), raw("primary-ip: 10.0.0.2/24")),
            ("eth1".to_string(), raw("primary-ip: bogus")),
        ]
        .into();
        assert!(daemon.reload(&next).is_err());

        assert_eq!(daemon.reconcilers().keys().collect::<Vec<_>>(), vec!["eth0"]);
        assert_eq!(daemon.reconcilers()["eth0"].config().primary_ip, "10.0.0.1/24");
    }

    #[test]
    fn keep_on_exit_leaves_state() {
        let options = DaemonOptions {
            keep_on_exit: true,
            ..DaemonOptions::default()
        };
        let mut daemon = daemon_with(&["eth0"], &[("eth0", "primary-ip: 10.0.0.1/24")], options)
            .unwrap();
        daemon.tick().unwrap();
        daemon.ip().runner().clear_commands();

        daemon.reload(&BTreeMap::new()).unwrap();
        daemon.handle(ControlCommand::Shutdown);

        assert!(daemon.stop_requested());
        assert!(daemon.ip().runner().mutating_commands().is_empty());
        assert_eq!(daemon.ip().runner().addresses("eth0"), vec!["10.0.0.1/24"]);
    }

    #[test]
    fn shutdown_reverts_everything() {
        let mut daemon = daemon_with(
            &["eth0"],
            &[("eth0", "primary-ip: 10.0.0.1/24\ndefault-route: 10.0.0.254")],
            DaemonOptions::default(),
        )
        .unwrap();
        daemon.tick().unwrap();

        daemon.handle(ControlCommand::Shutdown);

        assert!(daemon.stop_requested());
        assert!(daemon.ip().runner().addresses("eth0").is_empty());
        assert!(daemon.ip().runner().routes().is_empty());
    }

    #[test]
    fn shutdown_right_after_reload_reverts_queued_state() {
        let mut daemon = daemon_with(
            &["eth0", "eth1"],
            &[
                ("eth0", "primary-ip: 10.0.0.1/24\nsecondary-ips: [10.0.0.2/24]"),
                ("eth1", "primary-ip: 10.1.0.1/24"),
            ],
            DaemonOptions::default(),
        )
        .unwrap();
        daemon.tick().unwrap();

        let next: BTreeMap<String, RawInterfaceConfig> =
            [("eth0".to_string(), raw("primary-ip: 10.0.0.1/24"))].into();
        daemon.reload(&next).unwrap();
        daemon.handle(ControlCommand::Shutdown);

        assert!(daemon.stop_requested());
        let host = daemon.ip().runner();
        assert!(host.addresses("eth0").is_empty());
        assert!(host.addresses("eth1").is_empty());
        assert!(host.routes().is_empty());
    }

    #[test]
    fn reload_reports_interfaces_keeping_old_config() {
        let mut daemon = daemon_with(
            &["eth0", "eth1"],
            &[("eth0", "primary-ip: 10.0.0.1/24"), ("eth1", "primary-ip: 10.1.0.1/24")],
            DaemonOptions::default(),
        )
        .unwrap();

        let next: BTreeMap<String, RawInterfaceConfig> = [
            ("eth0".to_string(), raw("primary-ip: 10.0.0.1/99")),
            ("eth1".to_string(), raw("primary-ip: 10.1.0.2/24")),
        ]
        .into();
        let rejected = daemon.reload(&next).unwrap();

        assert_eq!(rejected, vec!["eth0"]);
        assert_eq!(daemon.reconcilers()["eth0"].config().primary_ip, "10.0.0.1/24");
        assert_eq!(daemon.reconcilers()["eth1"].config().primary_ip, "10.1.0.2/24");
    }

    #[test]
    fn reload_without_config_file_is_ignored() {
        let mut daemon = daemon_with(
            &["eth0"],
            &[("eth0", "primary-ip: 10.0.0.1/24")],
            DaemonOptions::default(),
        )
        .unwrap();
        daemon.handle(ControlCommand::Reload);
        assert_eq!(daemon.reconcilers().len(), 1);
        assert!(!daemon.stop_requested());
    }

    #[tokio::test]
    async fn run_stops_on_latched_shutdown() {
        let mut daemon = daemon_with(
            &["eth0"],
            &[("eth0", "primary-ip: 10.0.0.1/24")],
            DaemonOptions::default(),
        )
        .unwrap();
        daemon.tick().unwrap();

        let mut latch = SignalLatch::new();
        latch.sender().send(ControlCommand::Shutdown).unwrap();

        run(&mut daemon, &mut latch).await.unwrap();
        assert!(daemon.ip().runner().addresses("eth0").is_empty());
    }

    #[tokio::test]
    async fn run_fails_when_nothing_is_left() {
        let mut daemon = daemon_with(&[], &[("eth0", "primary-ip: 10.0.0.1/24")], DaemonOptions::default())
            .unwrap();
        let mut latch = SignalLatch::new();

        assert!(matches!(
            run(&mut daemon, &mut latch).await,
            Err(AppError::NoInterfaces)
        ));
    }
}

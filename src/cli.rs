//! Command line options.

use crate::config::DEFAULT_CONFIG_PATH;
use crate::types::RawInterfaceConfig;
use clap::Parser;
use serde_yaml::Value;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "static-netd",
    version,
    about = "Keeps static interface addresses and routes converged"
)]
pub struct Cli {
    /// Configuration file.
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_PATH, conflicts_with = "no_config")]
    pub config: PathBuf,

    /// Don't read a configuration file.
    #[arg(short = 'X', long)]
    pub no_config: bool,

    /// Manage this interface with the addresses given on the command line.
    #[arg(short = 'i', long, requires = "ip")]
    pub interface: Option<String>,

    /// Primary address of --interface.
    #[arg(short = 'a', long, value_name = "CIDR", requires = "interface")]
    pub ip: Option<String>,

    /// Secondary address of --interface, may be repeated.
    #[arg(short = 'A', long = "secondary-ip", value_name = "CIDR", requires = "interface")]
    pub secondary_ips: Vec<String>,

    /// Default route gateway of --interface.
    #[arg(short = 'r', long = "route", value_name = "GATEWAY", requires = "interface")]
    pub default_route: Option<String>,

    /// Tolerate --interface's link being absent.
    #[arg(long, requires = "interface")]
    pub hotplug: bool,

    /// Log decisions without changing anything.
    #[arg(short = 'n', long = "dry-run", visible_aliases = ["noop", "dryrun"])]
    pub dry_run: bool,

    /// Leave addresses and routes in place on exit.
    #[arg(long)]
    pub keep_on_exit: bool,

    /// Flush all addresses of every managed interface on boot.
    #[arg(short = 'f', long)]
    pub flush: bool,

    /// Additional log file, may be repeated.
    #[arg(short = 'l', long = "log", value_name = "FILE")]
    pub logs: Vec<PathBuf>,
}

impl Cli {
    /// Configuration file to read, `None` with --no-config.
    pub fn config_path(&self) -> Option<PathBuf> {
        (!self.no_config).then(|| self.config.clone())
    }

    /// The interface configured on the command line, in the same shape as a
    /// file entry so it goes through the same validation.
    pub fn interface_override(&self) -> Option<(String, RawInterfaceConfig)> {
        let name = self.interface.clone()?;

        let raw = RawInterfaceConfig {
            primary_ip: self.ip.clone().map(Value::String),
            secondary_ips: (!self.secondary_ips.is_empty()).then(|| {
                Value::Sequence(self.secondary_ips.iter().cloned().map(Value::String).collect())
            }),
            default_route: self.default_route.clone().map(Value::String),
            hotplug: self.hotplug.then_some(Value::Bool(true)),
        };

        Some((name, raw))
    }
}

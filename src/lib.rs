// Declare the modules that form the library's structure
pub mod cli;
pub mod config;
pub mod daemon;
pub mod interface;
#[cfg(any(test, feature = "testing"))]
pub mod mock;
pub mod network;
pub mod objects;
pub mod runner;
pub mod signals;
pub mod types;

// Publicly export key types, functions, and modules needed by the binary or tests
pub use config::{load_config, validate_cidr, validate_interface_config, ConfigSource};
pub use daemon::{run, Daemon, DaemonOptions};
pub use interface::InterfaceReconciler;
pub use network::IpWrapper;
pub use objects::ManagedObject;
pub use runner::{CommandRunner, ShellRunner};
pub use signals::SignalLatch;
pub use types::{AppConfig, AppError, ControlCommand, InterfaceConfig, RawInterfaceConfig, Result};

use crate::types::{AppConfig, AppError, InterfaceConfig, RawInterfaceConfig, Result};
use serde_yaml::Value;
use std::collections::BTreeMap;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/static-netd/config.yml";

/// Where the desired interfaces come from: an optional file plus an
/// optional interface given on the command line, which wins over a file
/// entry of the same name.
#[derive(Debug, Clone, Default)]
pub struct ConfigSource {
    pub path: Option<PathBuf>,
    pub interface_override: Option<(String, RawInterfaceConfig)>,
}

impl ConfigSource {
    pub fn load(&self) -> Result<BTreeMap<String, RawInterfaceConfig>> {
        let mut interfaces = match &self.path {
            Some(path) => load_config(path)?.interfaces,
            None => BTreeMap::new(),
        };
        if let Some((name, raw)) = &self.interface_override {
            interfaces.insert(name.clone(), raw.clone());
        }
        Ok(interfaces)
    }
}

/// Loads the configuration file at `config_path`.
pub fn load_config(config_path: &Path) -> Result<AppConfig> {
    tracing::info!("Attempting to load configuration from: {:?}", config_path);

    let config_str = fs::read_to_string(config_path).map_err(|e| {
        AppError::Config(format!(
            "Config {:?} is not readable, use --no-config or make it readable: {}",
            config_path, e
        ))
    })?;

    if config_str.trim().is_empty() {
        return Ok(AppConfig::default());
    }

    serde_yaml::from_str(&config_str)
        .map_err(|e| AppError::Config(format!("Failed to parse YAML: {}", e)))
}

/// Validates the raw configuration of interface `name`.
///
/// Every violation is logged and collected; the first one does not stop
/// the pass.
pub fn validate_interface_config(name: &str, raw: &RawInterfaceConfig) -> Result<InterfaceConfig> {
    let mut violations = Vec::new();

    let default_route = match &raw.default_route {
        None => None,
        Some(Value::String(route)) => Some(route.clone()),
        Some(_) => {
            violations.push(format!("Default route for '{}' isn't a string", name));
            None
        }
    };

    let primary_ip = match &raw.primary_ip {
        None => {
            violations.push(format!("No primary ip set for '{}'", name));
            None
        }
        Some(Value::String(ip)) if validate_cidr(ip) => Some(ip.clone()),
        Some(Value::String(ip)) => {
            violations.push(format!("Primary ip '{}' for '{}' is invalid", ip, name));
            None
        }
        Some(_) => {
            violations.push(format!("Primary ip for '{}' isn't a string", name));
            None
        }
    };

    let mut secondary_ips = Vec::new();
    match &raw.secondary_ips {
        None => {}
        Some(Value::Sequence(ips)) => {
            for (index, ip) in ips.iter().enumerate() {
                match ip {
                    Value::String(ip) if validate_cidr(ip) => secondary_ips.push(ip.clone()),
                    Value::String(ip) => {
                        violations.push(format!("Secondary ip '{}' for '{}' is invalid", ip, name))
                    }
                    _ => violations.push(format!(
                        "Secondary ip #{} for '{}' isn't a string",
                        index, name
                    )),
                }
            }
        }
        Some(_) => violations.push(format!("Secondary ips for '{}' is not a list", name)),
    }

    let hotplug = match &raw.hotplug {
        None => false,
        Some(Value::Bool(hotplug)) => *hotplug,
        Some(_) => {
            violations.push(format!("Hotplug for '{}' isn't a boolean", name));
            false
        }
    };

    for violation in &violations {
        tracing::error!("{}", violation);
    }

    match primary_ip {
        Some(primary_ip) if violations.is_empty() => Ok(InterfaceConfig {
            primary_ip,
            secondary_ips,
            default_route,
            hotplug,
        }),
        _ => Err(AppError::InvalidConfig {
            interface: name.to_string(),
            violations,
        }),
    }
}

/// `address[/prefix]` with a valid IP literal and an in-range decimal prefix.
pub fn validate_cidr(cidr: &str) -> bool {
    let mut parts = cidr.split('/');
    let (Some(address), mask) = (parts.next(), parts.next()) else {
        return false;
    };
    if parts.next().is_some() {
        return false;
    }

    let Ok(address) = address.parse::<IpAddr>() else {
        return false;
    };

    let Some(mask) = mask else {
        return true;
    };
    if mask.is_empty() || !mask.bytes().all(|b| b.is_ascii_digit()) {
        return false;
    }

    let max_prefix = if address.is_ipv4() { 32 } else { 128 };
    mask.parse::<u32>().is_ok_and(|mask| mask <= max_prefix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn raw(yaml: &str) -> RawInterfaceConfig {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_load_valid_config() {
        let yaml = r#"
interfaces:
  eth0:
    primary-ip: 192.168.1.1/24
    secondary-ips:
      - 192.168.1.2/24
      - "2001:db8::1/64"
    default-route: 192.168.1.254
  wlan0:
    primary-ip: 10.0.0.1/8
    hotplug: true
"#;
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "{}", yaml).unwrap();

        let config = load_config(file.path()).unwrap();

        assert_eq!(config.interfaces.len(), 2);
        let eth0 = validate_interface_config("eth0", &config.interfaces["eth0"]).unwrap();
        assert_eq!(eth0.primary_ip, "192.168.1.1/24");
        assert_eq!(eth0.secondary_ips, vec!["192.168.1.2/24", "2001:db8::1/64"]);
        assert_eq!(eth0.default_route.as_deref(), Some("192.168.1.254"));
        assert!(!eth0.hotplug);

        let wlan0 = validate_interface_config("wlan0", &config.interfaces["wlan0"]).unwrap();
        assert!(wlan0.hotplug);
        assert!(wlan0.secondary_ips.is_empty());
        assert_eq!(wlan0.default_route, None);
    }

    #[test]
    fn test_load_invalid_yaml() {
        let yaml = "interfaces: [ name: eth0 ]";
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "{}", yaml).unwrap();

        let result = load_config(file.path());
        if let Err(AppError::Config(msg)) = result {
            assert!(msg.contains("Failed to parse YAML"));
        } else {
            panic!("Expected Config error");
        }
    }

    #[test]
    fn test_load_missing_file() {
        let result = load_config(Path::new("/nonexistent/static-netd.yml"));
        assert!(matches!(result, Err(AppError::Config(msg)) if msg.contains("not readable")));
    }

    #[test]
    fn test_load_empty_file() {
        let file = NamedTempFile::new().unwrap();
        let config = load_config(file.path()).unwrap();
        assert!(config.interfaces.is_empty());
    }

    #[test]
    fn test_source_override_wins() {
        let yaml = "interfaces:\n  eth0:\n    primary-ip: 10.0.0.1/24\n  eth1:\n    primary-ip: 10.1.0.1/24\n";
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", yaml).unwrap();

        let source = ConfigSource {
            path: Some(file.path().to_path_buf()),
            interface_override: Some(("eth1".to_string(), raw("primary-ip: 10.9.0.1/24"))),
        };
        let interfaces = source.load().unwrap();

        assert_eq!(interfaces.len(), 2);
        let eth1 = validate_interface_config("eth1", &interfaces["eth1"]).unwrap();
        assert_eq!(eth1.primary_ip, "10.9.0.1/24");
    }

    #[test]
    fn test_source_without_file() {
        assert!(ConfigSource::default().load().unwrap().is_empty());
    }

    #[test]
    fn test_validate_reports_every_violation() {
        let config = raw(
            r#"
secondary-ips:
  - 10.0.0.300/24
  - 42
default-route: [1, 2]
hotplug: "yes"
"#,
        );
        match validate_interface_config("eth0", &config) {
            Err(AppError::InvalidConfig {
                interface,
                violations,
            }) => {
                assert_eq!(interface, "eth0");
                assert_eq!(
                    violations,
                    vec![
                        "Default route for 'eth0' isn't a string",
                        "No primary ip set for 'eth0'",
                        "Secondary ip '10.0.0.300/24' for 'eth0' is invalid",
                        "Secondary ip #1 for 'eth0' isn't a string",
                        "Hotplug for 'eth0' isn't a boolean",
                    ]
                );
            }
            other => panic!("Expected InvalidConfig error, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_primary_ip() {
        let not_a_string = raw("primary-ip: [10.0.0.1]");
        assert!(validate_interface_config("eth0", &not_a_string).is_err());

        let invalid = raw("primary-ip: 10.0.0.1/40");
        let err = validate_interface_config("eth0", &invalid).unwrap_err();
        assert!(err.to_string().contains("Primary ip '10.0.0.1/40' for 'eth0' is invalid"));

        let secondaries_not_list = raw("primary-ip: 10.0.0.1/24\nsecondary-ips: 10.0.0.2/24");
        assert!(validate_interface_config("eth0", &secondaries_not_list).is_err());
    }

    #[test]
    fn test_validate_cidr() {
        assert!(validate_cidr("10.0.0.1"));
        assert!(validate_cidr("10.0.0.1/0"));
        assert!(validate_cidr("10.0.0.1/32"));
        assert!(validate_cidr("fe80::1/128"));
        assert!(validate_cidr("2001:db8::1"));
        assert!(!validate_cidr("10.0.0.1/33"));
        assert!(!validate_cidr("fe80::1/129"));
        assert!(!validate_cidr("10.0.0.1/24/8"));
        assert!(!validate_cidr("10.0.0.1/"));
        assert!(!validate_cidr("10.0.0.1/+8"));
        assert!(!validate_cidr("10.0.0/24"));
        assert!(!validate_cidr("eth0"));
        assert!(!validate_cidr(""));
    }
}

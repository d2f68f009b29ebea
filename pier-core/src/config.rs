// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Pier Service Contributors

//! YAML configuration parser with strict schema validation.
//!
//! Every section is optional and falls back to defaults, but any value that
//! is present must be valid: a bad field is a `HardValidationError` and the
//! service refuses to start.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::backoff::BackoffPolicy;
use crate::error::{HardValidationError, PierError, PierResult};
use crate::types::{PierId, PortPair};

// =============================================================================
// Raw configuration (as parsed from YAML, before validation)
// =============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    service: RawServiceSection,
    #[serde(default)]
    ports: RawPortsSection,
    #[serde(default)]
    launcher: RawLauncherSection,
    #[serde(default)]
    readiness: RawReadinessSection,
    #[serde(default)]
    timeouts: RawTimeoutsSection,
    #[serde(default)]
    restart: RawRestartSection,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawServiceSection {
    #[serde(default = "default_data_dir")]
    data_dir: String,
    #[serde(default = "default_output_buffer_lines")]
    output_buffer_lines: usize,
}

impl Default for RawServiceSection {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            output_buffer_lines: default_output_buffer_lines(),
        }
    }
}

fn default_data_dir() -> String {
    match std::env::var_os("HOME") {
        Some(home) => Path::new(&home).join(".pier").to_string_lossy().into_owned(),
        None => ".pier".to_string(),
    }
}

fn default_output_buffer_lines() -> usize {
    500
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPortRange {
    start: u16,
    end: u16,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPortsSection {
    #[serde(default = "default_web_range")]
    web: RawPortRange,
    #[serde(default = "default_loopback_range")]
    loopback: RawPortRange,
    #[serde(default = "default_true")]
    verify_bind: bool,
}

impl Default for RawPortsSection {
    fn default() -> Self {
        Self {
            web: default_web_range(),
            loopback: default_loopback_range(),
            verify_bind: true,
        }
    }
}

fn default_web_range() -> RawPortRange {
    RawPortRange {
        start: 8080,
        end: 8179,
    }
}

fn default_loopback_range() -> RawPortRange {
    RawPortRange {
        start: 12321,
        end: 12420,
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawLauncherSection {
    #[serde(default = "default_program")]
    program: String,
    #[serde(default = "default_boot_args")]
    boot_args: Vec<String>,
    #[serde(default = "default_run_args")]
    run_args: Vec<String>,
    #[serde(default)]
    env: HashMap<String, String>,
}

impl Default for RawLauncherSection {
    fn default() -> Self {
        Self {
            program: default_program(),
            boot_args: default_boot_args(),
            run_args: default_run_args(),
            env: HashMap::new(),
        }
    }
}

fn default_program() -> String {
    "urbit".to_string()
}

fn default_boot_args() -> Vec<String> {
    ["-t", "-c", "{dir}", "--http-port", "{web_port}", "--loopback-port", "{loopback_port}"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_run_args() -> Vec<String> {
    ["-t", "{dir}", "--http-port", "{web_port}", "--loopback-port", "{loopback_port}"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawReadinessSection {
    #[serde(default)]
    mode: ReadinessMode,
    #[serde(default = "default_grace_ms")]
    grace_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    poll_interval_ms: u64,
}

impl Default for RawReadinessSection {
    fn default() -> Self {
        Self {
            mode: ReadinessMode::default(),
            grace_ms: default_grace_ms(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

fn default_grace_ms() -> u64 {
    2_000
}

fn default_poll_interval_ms() -> u64 {
    100
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTimeoutsSection {
    #[serde(default = "default_startup_ms")]
    startup_ms: u64,
    #[serde(default = "default_stop_ms")]
    stop_ms: u64,
    #[serde(default = "default_shutdown_ms")]
    shutdown_ms: u64,
    #[serde(default = "default_cancel_grace_ms")]
    cancel_grace_ms: u64,
}

impl Default for RawTimeoutsSection {
    fn default() -> Self {
        Self {
            startup_ms: default_startup_ms(),
            stop_ms: default_stop_ms(),
            shutdown_ms: default_shutdown_ms(),
            cancel_grace_ms: default_cancel_grace_ms(),
        }
    }
}

fn default_startup_ms() -> u64 {
    120_000 // first boot downloads and initializes, give it room
}

fn default_stop_ms() -> u64 {
    10_000
}

fn default_shutdown_ms() -> u64 {
    30_000
}

fn default_cancel_grace_ms() -> u64 {
    2_000
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRestartSection {
    #[serde(default)]
    enabled: bool,
    #[serde(default = "default_max_attempts")]
    max_attempts: u32,
    #[serde(default = "default_backoff_first_ms")]
    backoff_first_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    backoff_max_ms: u64,
    #[serde(default = "default_backoff_factor")]
    backoff_factor: f64,
}

impl Default for RawRestartSection {
    fn default() -> Self {
        Self {
            enabled: false,
            max_attempts: default_max_attempts(),
            backoff_first_ms: default_backoff_first_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            backoff_factor: default_backoff_factor(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_first_ms() -> u64 {
    1_000
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

fn default_backoff_factor() -> f64 {
    2.0
}

// =============================================================================
// Validated configuration
// =============================================================================

/// Inclusive port range scanned by the allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    /// Create a range, rejecting port 0 and inverted bounds.
    pub fn new(start: u16, end: u16) -> Result<Self, HardValidationError> {
        if start == 0 {
            return Err(HardValidationError::InvalidPortRange {
                start,
                end,
                reason: "Port 0 is reserved".to_string(),
            });
        }
        if start > end {
            return Err(HardValidationError::InvalidPortRange {
                start,
                end,
                reason: "Start must not exceed end".to_string(),
            });
        }
        Ok(Self { start, end })
    }

    /// Iterate over every port in the range.
    pub fn iter(&self) -> impl Iterator<Item = u16> {
        self.start..=self.end
    }
}

/// Port allocation settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortsConfig {
    pub web: PortRange,
    pub loopback: PortRange,
    /// Require both ports to be bindable at allocation time.
    pub verify_bind: bool,
}

/// How a pier process is launched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LauncherConfig {
    pub program: PathBuf,
    /// Arguments for the first run, before the pier has booted.
    pub boot_args: Vec<String>,
    /// Arguments for every later run.
    pub run_args: Vec<String>,
    pub env: HashMap<String, String>,
}

impl LauncherConfig {
    /// Render the argument template for a pier, substituting `{id}`, `{dir}`,
    /// `{web_port}` and `{loopback_port}`.
    pub fn render_args(
        &self,
        first_boot: bool,
        id: &PierId,
        dir: &Path,
        ports: PortPair,
    ) -> Vec<String> {
        let template = if first_boot {
            &self.boot_args
        } else {
            &self.run_args
        };
        let dir = dir.to_string_lossy();
        let web = ports.web.to_string();
        let loopback = ports.loopback.to_string();

        template
            .iter()
            .map(|arg| {
                arg.replace("{id}", id.as_str())
                    .replace("{dir}", &dir)
                    .replace("{web_port}", &web)
                    .replace("{loopback_port}", &loopback)
            })
            .collect()
    }

    /// Locate the launcher program (searching `PATH` for bare names) and
    /// check that it is executable.
    pub fn resolve_program(&self) -> Result<PathBuf, HardValidationError> {
        use std::os::unix::fs::PermissionsExt;

        let candidates: Vec<PathBuf> = if self.program.components().count() > 1 {
            vec![self.program.clone()]
        } else {
            std::env::var_os("PATH")
                .map(|paths| {
                    std::env::split_paths(&paths)
                        .map(|dir| dir.join(&self.program))
                        .collect()
                })
                .unwrap_or_default()
        };

        let Some(found) = candidates.into_iter().find(|p| p.is_file()) else {
            return Err(HardValidationError::LauncherNotFound {
                path: self.program.clone(),
            });
        };

        let mode = std::fs::metadata(&found)
            .map(|m| m.permissions().mode())
            .unwrap_or(0);
        if mode & 0o111 == 0 {
            return Err(HardValidationError::LauncherNotExecutable { path: found });
        }

        Ok(found)
    }
}

/// Signal that a booting process is ready.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadinessMode {
    /// Ready once the web port accepts TCP connections.
    #[default]
    Port,
    /// Ready once the process survived the grace period.
    Grace,
}

/// Readiness detection settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessConfig {
    pub mode: ReadinessMode,
    pub grace: Duration,
    pub poll_interval: Duration,
}

/// Suspension bounds for start, stop and shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutsConfig {
    pub startup: Duration,
    pub stop: Duration,
    pub shutdown: Duration,
    /// How long an in-flight start/stop may continue after shutdown begins.
    pub cancel_grace: Duration,
}

/// Crash restart policy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RestartConfig {
    pub enabled: bool,
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
}

/// Complete validated configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceConfig {
    /// Root for the durable store and default pier directories.
    pub data_dir: PathBuf,
    /// Lines of process output kept per pier.
    pub output_buffer_lines: usize,
    pub ports: PortsConfig,
    pub launcher: LauncherConfig,
    pub readiness: ReadinessConfig,
    pub timeouts: TimeoutsConfig,
    pub restart: RestartConfig,
}

impl ServiceConfig {
    /// Directory holding one durable record per pier.
    pub fn store_dir(&self) -> PathBuf {
        self.data_dir.join("piers.d")
    }

    /// Default directory for a pier created without an explicit path.
    pub fn default_pier_dir(&self, id: &PierId) -> PathBuf {
        self.data_dir.join("piers").join(id.as_str())
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        let web = default_web_range();
        let loopback = default_loopback_range();
        let launcher = RawLauncherSection::default();
        let restart = RawRestartSection::default();

        Self {
            data_dir: PathBuf::from(default_data_dir()),
            output_buffer_lines: default_output_buffer_lines(),
            ports: PortsConfig {
                web: PortRange {
                    start: web.start,
                    end: web.end,
                },
                loopback: PortRange {
                    start: loopback.start,
                    end: loopback.end,
                },
                verify_bind: true,
            },
            launcher: LauncherConfig {
                program: PathBuf::from(launcher.program),
                boot_args: launcher.boot_args,
                run_args: launcher.run_args,
                env: launcher.env,
            },
            readiness: ReadinessConfig {
                mode: ReadinessMode::default(),
                grace: Duration::from_millis(default_grace_ms()),
                poll_interval: Duration::from_millis(default_poll_interval_ms()),
            },
            timeouts: TimeoutsConfig {
                startup: Duration::from_millis(default_startup_ms()),
                stop: Duration::from_millis(default_stop_ms()),
                shutdown: Duration::from_millis(default_shutdown_ms()),
                cancel_grace: Duration::from_millis(default_cancel_grace_ms()),
            },
            restart: RestartConfig {
                enabled: restart.enabled,
                max_attempts: restart.max_attempts,
                backoff: BackoffPolicy {
                    first: Duration::from_millis(restart.backoff_first_ms),
                    max: Duration::from_millis(restart.backoff_max_ms),
                    factor: restart.backoff_factor,
                },
            },
        }
    }
}

/// Configuration loader with strict validation.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load and validate configuration from a YAML file.
    pub fn load_file(path: impl AsRef<Path>) -> PierResult<ServiceConfig> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(PierError::ConfigNotFound {
                path: path.to_path_buf(),
            });
        }

        let content = std::fs::read_to_string(path).map_err(|e| PierError::Io {
            context: "reading config file",
            source: e,
        })?;

        Self::load_string(&content)
    }

    /// Load and validate configuration from a YAML string.
    pub fn load_string(content: &str) -> PierResult<ServiceConfig> {
        // An empty document means "all defaults".
        if content.trim().is_empty() {
            return Self::validate(RawConfig::default());
        }

        let raw: RawConfig =
            serde_yaml::from_str(content).map_err(|e| PierError::ConfigParse {
                message: format!("YAML parse error: {}", e),
            })?;

        Self::validate(raw)
    }

    fn validate(raw: RawConfig) -> PierResult<ServiceConfig> {
        let service = raw.service;

        if service.data_dir.trim().is_empty() {
            return Err(HardValidationError::MissingRequiredField {
                field: "data_dir",
                context: "service".to_string(),
            }
            .into());
        }

        if service.output_buffer_lines == 0 || service.output_buffer_lines > 100_000 {
            return Err(HardValidationError::InvalidFieldValue {
                field: "output_buffer_lines",
                value: service.output_buffer_lines.to_string(),
                reason: "Must be between 1 and 100000".to_string(),
            }
            .into());
        }

        Ok(ServiceConfig {
            data_dir: PathBuf::from(service.data_dir),
            output_buffer_lines: service.output_buffer_lines,
            ports: Self::validate_ports(raw.ports)?,
            launcher: Self::validate_launcher(raw.launcher)?,
            readiness: Self::validate_readiness(raw.readiness)?,
            timeouts: Self::validate_timeouts(raw.timeouts)?,
            restart: Self::validate_restart(raw.restart)?,
        })
    }

    fn validate_ports(raw: RawPortsSection) -> Result<PortsConfig, HardValidationError> {
        let web = PortRange::new(raw.web.start, raw.web.end)?;
        let loopback = PortRange::new(raw.loopback.start, raw.loopback.end)?;

        // A single shared port cannot host both halves of a pair.
        if web == loopback && web.start == web.end {
            return Err(HardValidationError::InvalidPortRange {
                start: web.start,
                end: web.end,
                reason: "Web and loopback ranges leave no distinct pair".to_string(),
            });
        }

        Ok(PortsConfig {
            web,
            loopback,
            verify_bind: raw.verify_bind,
        })
    }

    fn validate_launcher(raw: RawLauncherSection) -> Result<LauncherConfig, HardValidationError> {
        if raw.program.trim().is_empty() {
            return Err(HardValidationError::MissingRequiredField {
                field: "program",
                context: "launcher".to_string(),
            });
        }

        if raw.env.keys().any(|k| k.is_empty() || k.contains('=')) {
            return Err(HardValidationError::InvalidFieldValue {
                field: "env",
                value: "launcher.env".to_string(),
                reason: "Environment variable names must be non-empty and contain no '='"
                    .to_string(),
            });
        }

        Ok(LauncherConfig {
            program: PathBuf::from(raw.program),
            boot_args: raw.boot_args,
            run_args: raw.run_args,
            env: raw.env,
        })
    }

    fn validate_readiness(
        raw: RawReadinessSection,
    ) -> Result<ReadinessConfig, HardValidationError> {
        if raw.poll_interval_ms == 0 {
            return Err(HardValidationError::InvalidFieldValue {
                field: "poll_interval_ms",
                value: "0".to_string(),
                reason: "Poll interval must be greater than 0".to_string(),
            });
        }

        Ok(ReadinessConfig {
            mode: raw.mode,
            grace: Duration::from_millis(raw.grace_ms),
            poll_interval: Duration::from_millis(raw.poll_interval_ms),
        })
    }

    fn validate_timeouts(raw: RawTimeoutsSection) -> Result<TimeoutsConfig, HardValidationError> {
        for (field, value) in [
            ("startup_ms", raw.startup_ms),
            ("stop_ms", raw.stop_ms),
            ("shutdown_ms", raw.shutdown_ms),
        ] {
            if value == 0 {
                return Err(HardValidationError::InvalidFieldValue {
                    field,
                    value: "0".to_string(),
                    reason: "Timeout must be greater than 0".to_string(),
                });
            }
        }

        Ok(TimeoutsConfig {
            startup: Duration::from_millis(raw.startup_ms),
            stop: Duration::from_millis(raw.stop_ms),
            shutdown: Duration::from_millis(raw.shutdown_ms),
            cancel_grace: Duration::from_millis(raw.cancel_grace_ms),
        })
    }

    fn validate_restart(raw: RawRestartSection) -> Result<RestartConfig, HardValidationError> {
        if raw.max_attempts > 100 {
            return Err(HardValidationError::InvalidFieldValue {
                field: "max_attempts",
                value: raw.max_attempts.to_string(),
                reason: "Must not exceed 100".to_string(),
            });
        }

        if !raw.backoff_factor.is_finite() || raw.backoff_factor < 1.0 {
            return Err(HardValidationError::InvalidFieldValue {
                field: "backoff_factor",
                value: raw.backoff_factor.to_string(),
                reason: "Must be a finite number >= 1.0".to_string(),
            });
        }

        if raw.backoff_first_ms > raw.backoff_max_ms {
            return Err(HardValidationError::InvalidFieldValue {
                field: "backoff_first_ms",
                value: raw.backoff_first_ms.to_string(),
                reason: format!("Must not exceed backoff_max_ms ({})", raw.backoff_max_ms),
            });
        }

        Ok(RestartConfig {
            enabled: raw.enabled,
            max_attempts: raw.max_attempts,
            backoff: BackoffPolicy {
                first: Duration::from_millis(raw.backoff_first_ms),
                max: Duration::from_millis(raw.backoff_max_ms),
                factor: raw.backoff_factor,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Port;

    const FULL_CONFIG: &str = r#"
service:
  data_dir: /var/lib/pier
  output_buffer_lines: 200

ports:
  web: { start: 8080, end: 8090 }
  loopback: { start: 12321, end: 12331 }
  verify_bind: false

launcher:
  program: /usr/local/bin/urbit
  boot_args: ["-t", "-w", "{id}", "-c", "{dir}"]
  run_args: ["-t", "{dir}", "--http-port", "{web_port}"]
  env:
    RUST_LOG: info

readiness:
  mode: grace
  grace_ms: 500
  poll_interval_ms: 50

timeouts:
  startup_ms: 60000
  stop_ms: 5000
  shutdown_ms: 20000
  cancel_grace_ms: 1000

restart:
  enabled: true
  max_attempts: 5
  backoff_first_ms: 200
  backoff_max_ms: 10000
  backoff_factor: 2.0
"#;

    #[test]
    fn test_full_config() {
        let config = ConfigLoader::load_string(FULL_CONFIG).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/pier"));
        assert_eq!(config.output_buffer_lines, 200);
        assert_eq!(config.ports.web, PortRange { start: 8080, end: 8090 });
        assert!(!config.ports.verify_bind);
        assert_eq!(config.launcher.program, PathBuf::from("/usr/local/bin/urbit"));
        assert_eq!(config.readiness.mode, ReadinessMode::Grace);
        assert_eq!(config.timeouts.stop, Duration::from_secs(5));
        assert!(config.restart.enabled);
        assert_eq!(config.restart.max_attempts, 5);
        assert_eq!(config.restart.backoff.first, Duration::from_millis(200));
    }

    #[test]
    fn test_defaults_applied() {
        let config = ConfigLoader::load_string("").unwrap();
        assert_eq!(config.ports.web, PortRange { start: 8080, end: 8179 });
        assert_eq!(
            config.ports.loopback,
            PortRange {
                start: 12321,
                end: 12420
            }
        );
        assert!(config.ports.verify_bind);
        assert_eq!(config.readiness.mode, ReadinessMode::Port);
        assert!(!config.restart.enabled);
        assert_eq!(config, ServiceConfig::default());
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let yaml = r#"
timeouts:
  stop_ms: 250
"#;
        let config = ConfigLoader::load_string(yaml).unwrap();
        assert_eq!(config.timeouts.stop, Duration::from_millis(250));
        assert_eq!(config.timeouts.startup, Duration::from_secs(120));
    }

    #[test]
    fn test_inverted_port_range() {
        let yaml = r#"
ports:
  web: { start: 9000, end: 8000 }
"#;
        assert!(ConfigLoader::load_string(yaml).is_err());
    }

    #[test]
    fn test_port_zero_range() {
        let yaml = r#"
ports:
  loopback: { start: 0, end: 10 }
"#;
        assert!(ConfigLoader::load_string(yaml).is_err());
    }

    #[test]
    fn test_single_shared_port_rejected() {
        let yaml = r#"
ports:
  web: { start: 9000, end: 9000 }
  loopback: { start: 9000, end: 9000 }
"#;
        assert!(ConfigLoader::load_string(yaml).is_err());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let yaml = r#"
timeouts:
  startup_ms: 0
"#;
        assert!(ConfigLoader::load_string(yaml).is_err());
    }

    #[test]
    fn test_bad_backoff_factor_rejected() {
        let yaml = r#"
restart:
  backoff_factor: 0.5
"#;
        assert!(ConfigLoader::load_string(yaml).is_err());
    }

    #[test]
    fn test_unknown_field_rejected() {
        let yaml = r#"
ports:
  web_range: { start: 1, end: 2 }
"#;
        assert!(matches!(
            ConfigLoader::load_string(yaml),
            Err(PierError::ConfigParse { .. })
        ));
    }

    #[test]
    fn test_missing_file() {
        let result = ConfigLoader::load_file("/nonexistent/pier.yaml");
        assert!(matches!(result, Err(PierError::ConfigNotFound { .. })));
    }

    #[test]
    fn test_render_args() {
        let config = ConfigLoader::load_string(FULL_CONFIG).unwrap();
        let id = PierId::new("zod").unwrap();
        let ports = PortPair::new(Port::new(8080).unwrap(), Port::new(12321).unwrap()).unwrap();
        let dir = Path::new("/var/lib/pier/piers/zod");

        let boot = config.launcher.render_args(true, &id, dir, ports);
        assert_eq!(boot, vec!["-t", "-w", "zod", "-c", "/var/lib/pier/piers/zod"]);

        let run = config.launcher.render_args(false, &id, dir, ports);
        assert_eq!(
            run,
            vec!["-t", "/var/lib/pier/piers/zod", "--http-port", "8080"]
        );
    }

    #[test]
    fn test_resolve_program() {
        let mut config = ServiceConfig::default();

        config.launcher.program = PathBuf::from("/bin/sh");
        assert_eq!(config.launcher.resolve_program().unwrap(), PathBuf::from("/bin/sh"));

        config.launcher.program = PathBuf::from("sh");
        assert!(config.launcher.resolve_program().is_ok());

        config.launcher.program = PathBuf::from("/nonexistent/urbit");
        assert!(matches!(
            config.launcher.resolve_program(),
            Err(HardValidationError::LauncherNotFound { .. })
        ));
    }

    #[test]
    fn test_resolve_program_not_executable() {
        let dir = tempfile::TempDir::new().unwrap();
        let script = dir.path().join("urbit");
        std::fs::write(&script, "#!/bin/sh\n").unwrap();

        let mut config = ServiceConfig::default();
        config.launcher.program = script;
        assert!(matches!(
            config.launcher.resolve_program(),
            Err(HardValidationError::LauncherNotExecutable { .. })
        ));
    }
}

//! Orchestrator configuration loading and management.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};

/// Main orchestrator configuration, loaded from .tandem/config.yaml
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Config version
    pub version: Option<String>,

    /// External tool runtimes that must be on PATH before anything starts
    pub required_tools: Vec<String>,

    /// Local settings file consumed by the tiers (relative to project root)
    pub settings_file: PathBuf,

    /// Template the settings file is seeded from when absent
    pub settings_template: Option<PathBuf>,

    /// Lifecycle store directory (one pid record per tier)
    pub state_dir: PathBuf,

    /// Event journal
    pub events_file: PathBuf,

    /// Pause after signalling a port owner before re-checking the port
    pub settle_delay_ms: u64,

    /// Pause between the stop and start halves of a restart
    pub restart_settle_ms: u64,

    /// How long a tier may take to exit after SIGTERM before it is killed
    pub stop_grace_ms: u64,

    /// API tier, started first
    #[serde(deserialize_with = "backend_tier")]
    pub backend: ServiceSpec,

    /// Web tier, started once the backend is ready
    #[serde(deserialize_with = "frontend_tier")]
    pub frontend: ServiceSpec,
}

/// Static description of one tier.
///
/// In the config file a tier block is an override: keys it leaves out keep
/// that tier's defaults (see [`ServiceSpec::backend`] and
/// [`ServiceSpec::frontend`]).
#[derive(Debug, Clone, Serialize)]
pub struct ServiceSpec {
    pub name: String,

    pub port: u16,

    /// Shell command that runs the tier in the foreground
    pub command: String,

    pub working_dir: PathBuf,

    /// Append-mode file receiving stdout and stderr; output is discarded when unset
    pub log_file: Option<PathBuf>,

    pub probe: ProbeSpec,

    pub health: HealthConfig,

    pub install: Option<InstallSpec>,
}

/// A tier block as written in the config file.
///
/// `log_file: null` and `install: null` switch the default off; leaving the
/// key out keeps it.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ServiceOverride {
    name: Option<String>,
    port: Option<u16>,
    command: Option<String>,
    working_dir: Option<PathBuf>,
    #[serde(deserialize_with = "explicit")]
    log_file: Option<Option<PathBuf>>,
    probe: Option<ProbeSpec>,
    health: Option<HealthConfig>,
    #[serde(deserialize_with = "explicit")]
    install: Option<Option<InstallSpec>>,
}

impl ServiceOverride {
    fn apply(self, mut spec: ServiceSpec) -> ServiceSpec {
        if let Some(name) = self.name {
            spec.name = name;
        }
        if let Some(port) = self.port {
            spec.port = port;
        }
        if let Some(command) = self.command {
            spec.command = command;
        }
        if let Some(working_dir) = self.working_dir {
            spec.working_dir = working_dir;
        }
        if let Some(log_file) = self.log_file {
            spec.log_file = log_file;
        }
        if let Some(probe) = self.probe {
            spec.probe = probe;
        }
        if let Some(health) = self.health {
            spec.health = health;
        }
        if let Some(install) = self.install {
            spec.install = install;
        }
        spec
    }
}

/// Present-but-null becomes `Some(None)`; an absent key stays `None` via `default`.
fn explicit<'de, T, D>(deserializer: D) -> std::result::Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

fn tier_over<'de, D>(deserializer: D, base: ServiceSpec) -> std::result::Result<ServiceSpec, D::Error>
where
    D: Deserializer<'de>,
{
    let overrides = Option::<ServiceOverride>::deserialize(deserializer)?.unwrap_or_default();
    Ok(overrides.apply(base))
}

fn backend_tier<'de, D>(deserializer: D) -> std::result::Result<ServiceSpec, D::Error>
where
    D: Deserializer<'de>,
{
    tier_over(deserializer, ServiceSpec::backend())
}

fn frontend_tier<'de, D>(deserializer: D) -> std::result::Result<ServiceSpec, D::Error>
where
    D: Deserializer<'de>,
{
    tier_over(deserializer, ServiceSpec::frontend())
}

/// How to ask a tier whether it is ready.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ProbeSpec {
    /// Any HTTP response counts as ready, whatever its status code.
    Http { url: String },
    /// A successful TCP connect counts as ready.
    Tcp { address: String },
}

impl ProbeSpec {
    /// Substitute the `{port}` placeholder with the tier's port.
    pub fn for_port(&self, port: u16) -> Self {
        let port = port.to_string();
        match self {
            Self::Http { url } => Self::Http {
                url: url.replace("{port}", &port),
            },
            Self::Tcp { address } => Self::Tcp {
                address: address.replace("{port}", &port),
            },
        }
    }

    pub fn target(&self) -> &str {
        match self {
            Self::Http { url } => url,
            Self::Tcp { address } => address,
        }
    }
}

/// Bounded readiness window for a tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub attempts: u32,
    pub interval_ms: u64,
    pub probe_timeout_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            attempts: 15,
            interval_ms: 1000,
            probe_timeout_ms: 1000,
        }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// Dependency materialisation step for a tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSpec {
    /// Path whose existence means dependencies are already in place
    pub marker: PathBuf,
    pub command: String,
}

fn default_working_dir() -> PathBuf {
    PathBuf::from(".")
}

impl ServiceSpec {
    /// Default API tier.
    pub fn backend() -> Self {
        Self {
            name: "backend".to_string(),
            port: 8001,
            command: "python3 -m api.main".to_string(),
            working_dir: default_working_dir(),
            log_file: Some(PathBuf::from("api.log")),
            probe: ProbeSpec::Http {
                url: "http://localhost:{port}/health".to_string(),
            },
            health: HealthConfig::default(),
            install: Some(InstallSpec {
                marker: PathBuf::from(".tandem/backend.installed"),
                command: "python3 -m pip install -r api/requirements.txt".to_string(),
            }),
        }
    }

    /// Default web tier.
    pub fn frontend() -> Self {
        Self {
            name: "frontend".to_string(),
            port: 3000,
            command: "npm run dev".to_string(),
            working_dir: default_working_dir(),
            log_file: None,
            probe: ProbeSpec::Http {
                url: "http://localhost:{port}/".to_string(),
            },
            health: HealthConfig::default(),
            install: Some(InstallSpec {
                marker: PathBuf::from("node_modules"),
                command: "npm install".to_string(),
            }),
        }
    }

    /// Probe descriptor with the port placeholder resolved.
    pub fn resolved_probe(&self) -> ProbeSpec {
        self.probe.for_port(self.port)
    }

    fn resolve_paths(&mut self, project_root: &Path) {
        self.working_dir = project_root.join(&self.working_dir);
        if let Some(log) = &self.log_file {
            self.log_file = Some(project_root.join(log));
        }
        if let Some(install) = &mut self.install {
            install.marker = project_root.join(&install.marker);
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            version: None,
            required_tools: vec!["python3".to_string(), "node".to_string(), "npm".to_string()],
            settings_file: PathBuf::from(".env"),
            settings_template: Some(PathBuf::from(".env.example")),
            state_dir: PathBuf::from(".tandem/run"),
            events_file: PathBuf::from(".tandem/events.jsonl"),
            settle_delay_ms: 2000,
            restart_settle_ms: 2000,
            stop_grace_ms: 5000,
            backend: ServiceSpec::backend(),
            frontend: ServiceSpec::frontend(),
        }
    }
}

impl OrchestratorConfig {
    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;
        Ok(config)
    }

    /// Load from project root (looks for .tandem/config.yaml)
    pub fn load_from_project(project_root: &Path) -> Result<Self> {
        let config_path = project_root.join(".tandem/config.yaml");
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Resolve paths relative to project root
    pub fn resolve_paths(&mut self, project_root: &Path) {
        self.settings_file = project_root.join(&self.settings_file);
        self.settings_template = self
            .settings_template
            .as_ref()
            .map(|template| project_root.join(template));
        self.state_dir = project_root.join(&self.state_dir);
        self.events_file = project_root.join(&self.events_file);
        self.backend.resolve_paths(project_root);
        self.frontend.resolve_paths(project_root);
    }

    /// Tiers in dependency (start) order.
    pub fn tiers(&self) -> [&ServiceSpec; 2] {
        [&self.backend, &self.frontend]
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn restart_settle(&self) -> Duration {
        Duration::from_millis(self.restart_settle_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

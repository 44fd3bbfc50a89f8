//! Bridge configuration
//!
//! Connection settings come from command-line flags (each with an env
//! fallback); tunables come from `PBS_BRIDGE_*` environment variables.

use anyhow::{bail, Context, Result};
use bridge_lib::{DEFAULT_NAMESPACE, FitConfig, OrchestratorConfig, PbsConfig, ReconcilerConfig};
use clap::Parser;
use serde::Deserialize;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Schedule pods through a PBS batch scheduler
#[derive(Debug, Parser)]
#[command(name = "pbs-bridge")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Cluster API server URL
    #[arg(long, env = "PBS_BRIDGE_APISERVER", default_value = "https://10.0.0.1:443")]
    pub apiserver: String,

    /// Client certificate for mutual TLS
    #[arg(long, env = "PBS_BRIDGE_CERT")]
    pub cert: Option<PathBuf>,

    /// Client private key for mutual TLS
    #[arg(long, env = "PBS_BRIDGE_KEY")]
    pub key: Option<PathBuf>,

    /// CA bundle used to verify the API server
    #[arg(long, env = "PBS_BRIDGE_CACERT")]
    pub cacert: Option<PathBuf>,

    /// Resolve batch host names to addresses before binding
    #[arg(long, env = "PBS_BRIDGE_HOSTNAME_TO_IP")]
    pub hostname_to_ip: bool,

    /// Seconds between full sweeps (overrides PBS_BRIDGE_SWEEP_INTERVAL_SECS)
    #[arg(long)]
    pub sweep_interval_secs: Option<u64>,
}

/// Tunables read from the environment
#[derive(Debug, Clone, Deserialize)]
pub struct Tunables {
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    #[serde(default = "default_watch_retry_delay")]
    pub watch_retry_delay_secs: u64,

    /// Pause before fitting a pod delivered by the watch
    #[serde(default = "default_watch_settle")]
    pub watch_settle_millis: u64,

    /// Pause between submitting a job and first polling it
    #[serde(default = "default_submit_settle")]
    pub submit_settle_millis: u64,

    #[serde(default = "default_watch_buffer")]
    pub watch_buffer: usize,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Port for health and metrics endpoints
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Consecutive failures before a component reports unhealthy
    #[serde(default = "default_unhealthy_after_failures")]
    pub unhealthy_after_failures: u32,

    /// Namespace for pods that carry none
    #[serde(default = "default_namespace")]
    pub namespace: String,

    #[serde(default = "default_qsub_path")]
    pub qsub_path: PathBuf,

    #[serde(default = "default_qstat_path")]
    pub qstat_path: PathBuf,

    /// Job script passed to qsub
    #[serde(default = "default_job_script")]
    pub job_script: PathBuf,

    /// Reporting component on published events
    #[serde(default = "default_event_component")]
    pub event_component: String,
}

fn default_sweep_interval() -> u64 {
    20
}

fn default_watch_retry_delay() -> u64 {
    5
}

fn default_watch_settle() -> u64 {
    2000
}

fn default_submit_settle() -> u64 {
    5000
}

fn default_watch_buffer() -> usize {
    16
}

fn default_request_timeout() -> u64 {
    30
}

fn default_api_port() -> u16 {
    8080
}

fn default_unhealthy_after_failures() -> u32 {
    bridge_lib::health::DEFAULT_FAILURE_THRESHOLD
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn default_qsub_path() -> PathBuf {
    PathBuf::from("qsub")
}

fn default_qstat_path() -> PathBuf {
    PathBuf::from("qstat")
}

fn default_job_script() -> PathBuf {
    PathBuf::from("kubernetes_job.sh")
}

fn default_event_component() -> String {
    bridge_lib::notifier::DEFAULT_COMPONENT.to_string()
}

impl Tunables {
    /// Load tunables from `PBS_BRIDGE_*` environment variables
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("PBS_BRIDGE"))
            .build()
            .context("Failed to read environment configuration")?;

        config
            .try_deserialize()
            .context("Invalid PBS_BRIDGE_* configuration")
    }
}

/// Validated bridge configuration
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub api_server: Url,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub cacert: Option<PathBuf>,
    pub hostname_to_ip: bool,
    pub tunables: Tunables,
}

/// Opening the file catches missing paths and permission problems at startup
fn check_readable_file(flag: &str, path: &Path) -> Result<()> {
    let file = File::open(path)
        .with_context(|| format!("{} file {} is not readable", flag, path.display()))?;
    let metadata = file
        .metadata()
        .with_context(|| format!("{} file {} is not readable", flag, path.display()))?;
    if !metadata.is_file() {
        bail!("{} path {} is not a regular file", flag, path.display());
    }
    Ok(())
}

impl BridgeConfig {
    pub fn load() -> Result<Self> {
        let cli = Cli::parse();
        let tunables = Tunables::load()?;
        Self::from_parts(cli, tunables)
    }

    pub fn from_parts(cli: Cli, mut tunables: Tunables) -> Result<Self> {
        let api_server = Url::parse(&cli.apiserver)
            .with_context(|| format!("Invalid API server URL: {}", cli.apiserver))?;

        match api_server.scheme() {
            "http" => {}
            "https" => {
                for (flag, path) in [("--cacert", &cli.cacert), ("--cert", &cli.cert), ("--key", &cli.key)] {
                    match path {
                        Some(path) => check_readable_file(flag, path)?,
                        None => bail!("{} is required for an https API server", flag),
                    }
                }
            }
            other => bail!("Unsupported API server scheme: {}", other),
        }

        if let Some(secs) = cli.sweep_interval_secs {
            tunables.sweep_interval_secs = secs;
        }
        if tunables.sweep_interval_secs == 0 {
            bail!("Sweep interval must be at least one second");
        }

        Ok(Self {
            api_server,
            cert: cli.cert,
            key: cli.key,
            cacert: cli.cacert,
            hostname_to_ip: cli.hostname_to_ip,
            tunables,
        })
    }

    pub fn orchestrator(&self) -> OrchestratorConfig {
        let mut config = OrchestratorConfig::new(self.api_server.clone());
        config.ca_cert_path = self.cacert.clone();
        config.client_cert_path = self.cert.clone();
        config.client_key_path = self.key.clone();
        config.namespace = self.tunables.namespace.clone();
        config.request_timeout = Duration::from_secs(self.tunables.request_timeout_secs);
        config.watch_buffer = self.tunables.watch_buffer;
        config
    }

    pub fn pbs(&self) -> PbsConfig {
        PbsConfig {
            qsub_path: self.tunables.qsub_path.clone(),
            qstat_path: self.tunables.qstat_path.clone(),
            job_script: self.tunables.job_script.clone(),
        }
    }

    pub fn fit(&self) -> FitConfig {
        FitConfig {
            submit_settle_delay: Duration::from_millis(self.tunables.submit_settle_millis),
        }
    }

    pub fn reconciler(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            sweep_interval: Duration::from_secs(self.tunables.sweep_interval_secs),
            watch_retry_delay: Duration::from_secs(self.tunables.watch_retry_delay_secs),
            watch_settle_delay: Duration::from_millis(self.tunables.watch_settle_millis),
            watch_buffer: self.tunables.watch_buffer,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn defaults() -> Tunables {
        serde_json::from_str("{}").unwrap()
    }

    fn cli(args: &[&str]) -> Cli {
        let mut argv = vec!["pbs-bridge"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_tunable_defaults() {
        let tunables = defaults();
        assert_eq!(tunables.sweep_interval_secs, 20);
        assert_eq!(tunables.watch_retry_delay_secs, 5);
        assert_eq!(tunables.watch_settle_millis, 2000);
        assert_eq!(tunables.submit_settle_millis, 5000);
        assert_eq!(tunables.api_port, 8080);
        assert_eq!(tunables.unhealthy_after_failures, 5);
        assert_eq!(tunables.namespace, "default");
        assert_eq!(tunables.job_script, PathBuf::from("kubernetes_job.sh"));
        assert_eq!(tunables.event_component, "PBS-scheduler");
    }

    #[test]
    fn test_http_server_needs_no_tls_files() {
        let config =
            BridgeConfig::from_parts(cli(&["--apiserver", "http://127.0.0.1:8001"]), defaults())
                .unwrap();

        assert_eq!(config.api_server.as_str(), "http://127.0.0.1:8001/");
        assert!(!config.hostname_to_ip);
        assert_eq!(config.reconciler().sweep_interval, Duration::from_secs(20));
    }

    #[test]
    fn test_https_requires_tls_files() {
        let err = BridgeConfig::from_parts(cli(&[]), defaults()).unwrap_err();
        assert!(err.to_string().contains("--cacert"));
    }

    #[test]
    fn test_https_with_tls_files() {
        let ca = NamedTempFile::new().unwrap();
        let cert = NamedTempFile::new().unwrap();
        let key = NamedTempFile::new().unwrap();
        let ca_path = ca.path().to_str().unwrap();
        let cert_path = cert.path().to_str().unwrap();
        let key_path = key.path().to_str().unwrap();

        let config = BridgeConfig::from_parts(
            cli(&[
                "--cacert",
                ca_path,
                "--cert",
                cert_path,
                "--key",
                key_path,
                "--hostname-to-ip",
            ]),
            defaults(),
        )
        .unwrap();

        assert!(config.hostname_to_ip);
        let orchestrator = config.orchestrator();
        assert_eq!(orchestrator.ca_cert_path.as_deref(), Some(ca.path()));
        assert_eq!(orchestrator.namespace, "default");
    }

    #[test]
    fn test_missing_tls_file_is_rejected() {
        let err = BridgeConfig::from_parts(
            cli(&[
                "--cacert",
                "/nonexistent/ca.crt",
                "--cert",
                "/nonexistent/client.crt",
                "--key",
                "/nonexistent/client.key",
            ]),
            defaults(),
        )
        .unwrap_err();

        assert!(err.to_string().contains("--cacert file /nonexistent/ca.crt is not readable"));
    }

    #[test]
    fn test_directory_as_tls_file_is_rejected() {
        let ca = NamedTempFile::new().unwrap();
        let cert = NamedTempFile::new().unwrap();
        let key_dir = tempfile::TempDir::new().unwrap();

        let err = BridgeConfig::from_parts(
            cli(&[
                "--cacert",
                ca.path().to_str().unwrap(),
                "--cert",
                cert.path().to_str().unwrap(),
                "--key",
                key_dir.path().to_str().unwrap(),
            ]),
            defaults(),
        )
        .unwrap_err();

        assert!(err.to_string().contains("--key path"));
        assert!(err.to_string().contains("is not a regular file"));
    }

    #[test]
    fn test_unsupported_scheme_is_rejected() {
        let err =
            BridgeConfig::from_parts(cli(&["--apiserver", "ftp://10.0.0.1"]), defaults()).unwrap_err();
        assert!(err.to_string().contains("Unsupported"));
    }

    #[test]
    fn test_sweep_interval_flag_overrides_environment() {
        let config = BridgeConfig::from_parts(
            cli(&["--apiserver", "http://127.0.0.1:8001", "--sweep-interval-secs", "45"]),
            defaults(),
        )
        .unwrap();

        assert_eq!(config.reconciler().sweep_interval, Duration::from_secs(45));
    }
}

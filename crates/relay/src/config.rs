//! Relay configuration
//!
//! Every option is a command-line flag with a `RELAY_` environment alias.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use relay_lib::forwarder::{InfluxConfig, DEFAULT_INFLUXDB_PORT};
use relay_lib::{FailurePolicy, LabelSelector, RelayConfig, ScrapePort, SinkTarget};
use std::path::PathBuf;
use std::time::Duration;

/// Minimum severity of emitted log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Fatal,
    Panic,
}

impl LogLevel {
    /// Filter directive understood by `EnvFilter`
    pub fn directive(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            LogLevel::Error | LogLevel::Fatal | LogLevel::Panic => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Json,
    Text,
}

/// Which port of a service to scrape
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum ScrapePortArg {
    #[default]
    Service,
    Node,
}

impl From<ScrapePortArg> for ScrapePort {
    fn from(arg: ScrapePortArg) -> Self {
        match arg {
            ScrapePortArg::Service => ScrapePort::Service,
            ScrapePortArg::Node => ScrapePort::Node,
        }
    }
}

/// What to do when relaying one service fails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OnError {
    /// Stop the relay and exit with an error
    #[default]
    Abort,
    /// Log the failure and continue with the next event
    Continue,
}

impl From<OnError> for FailurePolicy {
    fn from(arg: OnError) -> Self {
        match arg {
            OnError::Abort => FailurePolicy::Abort,
            OnError::Continue => FailurePolicy::Continue,
        }
    }
}

/// Relays Prometheus metrics from cluster services to InfluxDB
#[derive(Debug, Parser)]
#[command(name = "metrics-relay")]
#[command(author, version, about, long_about = None)]
pub struct RelayArgs {
    #[arg(long, env = "RELAY_LOG_LEVEL", value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,

    #[arg(long, env = "RELAY_LOG_FORMAT", value_enum, default_value_t = LogFormat::Json)]
    pub log_format: LogFormat,

    /// Path to kubeconfig, used when not running inside a cluster [default: $HOME/.kube/config]
    #[arg(long, env = "RELAY_KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// Namespace of the services to scrape
    #[arg(long, env = "RELAY_METRICS_SERVICES_NAMESPACE", default_value = "default")]
    pub metrics_services_namespace: String,

    /// Services to scrape, as key:value pairs separated by commas; repeatable
    #[arg(long, env = "RELAY_METRICS_SERVICES_LABEL_SELECTOR")]
    pub metrics_services_label_selector: Vec<LabelSelector>,

    /// Nodes considered when resolving the scrape address; repeatable
    #[arg(long, env = "RELAY_NODE_LABEL_SELECTOR")]
    pub node_label_selector: Vec<LabelSelector>,

    /// Scrape this address instead of resolving one from the node list
    #[arg(long, env = "RELAY_NODE_ADDRESS")]
    pub node_address: Option<String>,

    #[arg(long, env = "RELAY_SCRAPE_PORT", value_enum, default_value_t = ScrapePortArg::Service)]
    pub scrape_port: ScrapePortArg,

    /// Timeout of a single scrape, in seconds
    #[arg(long, env = "RELAY_SCRAPE_TIMEOUT_SECS")]
    pub scrape_timeout_secs: Option<u64>,

    #[arg(long, env = "RELAY_INFLUXDB_SERVICE_NAMESPACE", default_value = "default")]
    pub influxdb_service_namespace: String,

    #[arg(long, env = "RELAY_INFLUXDB_SERVICE_NAME", default_value = "influxdb")]
    pub influxdb_service_name: String,

    #[arg(long, env = "RELAY_INFLUXDB_PORT", default_value_t = DEFAULT_INFLUXDB_PORT)]
    pub influxdb_port: u16,

    /// InfluxDB base URL; overrides the service name, namespace and port
    #[arg(long, env = "RELAY_INFLUXDB_URL")]
    pub influxdb_url: Option<String>,

    #[arg(long, env = "RELAY_INFLUXDB_DATABASE_NAME", default_value = "k8s")]
    pub influxdb_database_name: String,

    #[arg(long, env = "RELAY_INFLUXDB_RETENTION_POLICY")]
    pub influxdb_retention_policy: Option<String>,

    #[arg(long, env = "RELAY_INFLUXDB_USERNAME")]
    pub influxdb_username: Option<String>,

    #[arg(long, env = "RELAY_INFLUXDB_PASSWORD", hide_env_values = true)]
    pub influxdb_password: Option<String>,

    #[arg(long, env = "RELAY_ON_ERROR", value_enum, default_value_t = OnError::Abort)]
    pub on_error: OnError,

    /// Watch again when the control plane closes the service watch
    #[arg(long, env = "RELAY_RESUBSCRIBE")]
    pub resubscribe: bool,

    /// Port of the health and metrics server
    #[arg(long, env = "RELAY_API_PORT", default_value_t = 8080)]
    pub api_port: u16,
}

impl RelayArgs {
    /// Kubeconfig path, falling back to `$HOME/.kube/config`
    pub fn kubeconfig_path(&self) -> Option<PathBuf> {
        self.kubeconfig
            .clone()
            .or_else(|| dirs_next::home_dir().map(|home| home.join(".kube").join("config")))
    }

    pub fn service_selector(&self) -> Result<LabelSelector> {
        merge_selectors(&self.metrics_services_label_selector)
            .context("Invalid metrics services label selector")
    }

    pub fn node_selector(&self) -> Result<LabelSelector> {
        merge_selectors(&self.node_label_selector).context("Invalid node label selector")
    }

    pub fn scrape_timeout(&self) -> Option<Duration> {
        self.scrape_timeout_secs.map(Duration::from_secs)
    }

    pub fn sink_target(&self) -> SinkTarget {
        SinkTarget::new(
            self.influxdb_database_name.clone(),
            self.influxdb_retention_policy.clone(),
        )
    }

    pub fn influx_config(&self) -> InfluxConfig {
        let url = self.influxdb_url.clone().unwrap_or_else(|| {
            InfluxConfig::service_url(
                &self.influxdb_service_name,
                &self.influxdb_service_namespace,
                self.influxdb_port,
            )
        });

        InfluxConfig {
            url,
            username: self.influxdb_username.clone(),
            password: self.influxdb_password.clone(),
            timeout: None,
        }
    }

    pub fn relay_config(&self, node_address: String) -> RelayConfig {
        RelayConfig {
            node_address,
            scrape_port: self.scrape_port.into(),
            failure_policy: self.on_error.into(),
            resubscribe: self.resubscribe,
        }
    }
}

/// Combine repeated selector flags into one conjunction
fn merge_selectors(selectors: &[LabelSelector]) -> Result<LabelSelector> {
    let mut merged = LabelSelector::new();
    for selector in selectors {
        merged.merge(selector.clone())?;
    }
    Ok(merged)
}

//! Layered configuration for the service binary: built-in defaults,
//! overridden by an optional TOML file, overridden by `DIGS_`-prefixed
//! environment variables. Mirrors the gateway's `GatewayConfig`, but built
//! on the `config` crate since this surface spans six subsystems instead
//! of a handful of proxy settings.

use digs_core::config::{RequestConfig, ResourceConfig, SchedulerConfig};
use digs_rolemgr::cost_model::LlamaSimulatorParams;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_model_family() -> String {
    "llama".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostModelConfig {
    #[serde(default = "default_model_family")]
    pub model_family: String,
    #[serde(flatten)]
    pub params: LlamaSimulatorParams,
}

impl Default for CostModelConfig {
    fn default() -> Self {
        Self {
            model_family: default_model_family(),
            params: LlamaSimulatorParams::default(),
        }
    }
}

fn default_time_period_s() -> u64 {
    30
}

/// Maps `spec.md`'s `{is_heterogeneous, is_skip_decision_for_cross_node_mode,
/// has_flex}` tri-state onto `RoleManagerMode`, plus the pinned-rate and
/// hardware-role-map inputs each mode variant needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleConfig {
    #[serde(default = "default_time_period_s")]
    pub time_period_s: u64,
    #[serde(default)]
    pub is_skip_decision_for_cross_node_mode: bool,
    #[serde(default)]
    pub is_heterogeneous: bool,
    #[serde(default)]
    pub hardware_role_map: HashMap<String, digs_core::instance::InstanceRole>,
    #[serde(default)]
    pub has_flex: bool,
    /// `(pRate, dRate)`; `None` means the proportion calculator always
    /// computes its own ratio instead of taking an operator override on
    /// the first period it sees a group.
    #[serde(default)]
    pub pinned_rate: Option<(u64, u64)>,
}

impl Default for RoleConfig {
    fn default() -> Self {
        Self {
            time_period_s: default_time_period_s(),
            is_skip_decision_for_cross_node_mode: false,
            is_heterogeneous: false,
            hardware_role_map: HashMap::new(),
            has_flex: false,
            pinned_rate: None,
        }
    }
}

fn default_lease_ttl_s() -> i64 {
    10
}

fn default_rpc_timeout_s() -> u64 {
    5
}

fn default_lock_key() -> String {
    "digs/leader".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderConfig {
    /// Single-node deployments can run without etcd at all.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub etcd_endpoints: Vec<String>,
    #[serde(default = "default_lock_key")]
    pub lock_key: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default = "default_lease_ttl_s")]
    pub lease_ttl_s: i64,
    #[serde(default = "default_rpc_timeout_s")]
    pub rpc_timeout_s: u64,
}

impl Default for LeaderConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            etcd_endpoints: Vec::new(),
            lock_key: default_lock_key(),
            client_id: String::new(),
            lease_ttl_s: default_lease_ttl_s(),
            rpc_timeout_s: default_rpc_timeout_s(),
        }
    }
}

fn default_notify_timeout_ms() -> u64 {
    2_000
}

/// Outbound callback sinks for `NotifyAllocation`/`NotifyRoleDecision`.
/// Either URL left unset means that callback is a no-op success (allocation)
/// or silently skipped (role decisions) -- useful for single-collector-less
/// deployments and for tests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    #[serde(default)]
    pub allocation_url: Option<String>,
    #[serde(default)]
    pub role_decision_url: Option<String>,
    #[serde(default = "default_notify_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            allocation_url: None,
            role_decision_url: None,
            timeout_ms: default_notify_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub resource: ResourceConfig,
    #[serde(default)]
    pub request: RequestConfig,
    #[serde(default)]
    pub role: RoleConfig,
    #[serde(default)]
    pub cost_model: CostModelConfig,
    #[serde(default)]
    pub leader: LeaderConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            scheduler: SchedulerConfig::default(),
            resource: ResourceConfig::default(),
            request: RequestConfig::default(),
            role: RoleConfig::default(),
            cost_model: CostModelConfig::default(),
            leader: LeaderConfig::default(),
            notify: NotifyConfig::default(),
        }
    }
}

impl ServiceConfig {
    /// Layers an optional TOML file (path from `DIGS_CONFIG_FILE`, default
    /// `digs.toml`, missing file is not an error) under `DIGS_`-prefixed,
    /// double-underscore-nested environment overrides (e.g.
    /// `DIGS_LEADER__ENABLED=true`).
    pub fn load() -> Result<Self, config::ConfigError> {
        let config_path = std::env::var("DIGS_CONFIG_FILE").unwrap_or_else(|_| "digs.toml".to_string());
        let builder = config::Config::builder()
            .add_source(config::File::with_name(&config_path).required(false))
            .add_source(config::Environment::with_prefix("DIGS").separator("__"));
        builder.build()?.try_deserialize()
    }
}

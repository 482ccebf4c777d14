//! Strongly-typed configuration structs for the scheduler core. Loaded by
//! `digs-service` via the `config`/`toml` crates; defined here so the
//! types live next to the code they configure.

use crate::policy::{PoolPolicyKind, ReorderPolicyKind, SelectPolicyKind};
use serde::{Deserialize, Serialize};

fn default_tick_interval_ms() -> u64 {
    100
}

fn default_max_req_per_tick() -> usize {
    256
}

fn default_block_size() -> u64 {
    16
}

fn default_view_update_timeout_ms() -> u64 {
    50
}

fn default_max_res_rate() -> f64 {
    1.0
}

fn default_max_summary_count() -> usize {
    1024 * 1024
}

fn default_attr_names() -> Vec<String> {
    vec!["slots".into(), "blocks".into()]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_max_req_per_tick")]
    pub max_req_num_per_tick: usize,
    #[serde(default)]
    pub reorder_policy: ReorderPolicyKind,
    #[serde(default)]
    pub pool_policy: PoolPolicyKind,
    #[serde(default)]
    pub select_policy: SelectPolicyKind,
    #[serde(default = "default_block_size")]
    pub block_size: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            max_req_num_per_tick: default_max_req_per_tick(),
            reorder_policy: ReorderPolicyKind::Fcfs,
            pool_policy: PoolPolicyKind::Static,
            select_policy: SelectPolicyKind::LoadBalance,
            block_size: default_block_size(),
        }
    }
}

impl Default for ReorderPolicyKind {
    fn default() -> Self {
        ReorderPolicyKind::Fcfs
    }
}

impl Default for PoolPolicyKind {
    fn default() -> Self {
        PoolPolicyKind::Static
    }
}

impl Default for SelectPolicyKind {
    fn default() -> Self {
        SelectPolicyKind::LoadBalance
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    #[serde(default = "default_view_update_timeout_ms")]
    pub view_update_timeout_ms: u64,
    #[serde(default = "default_max_res_rate")]
    pub max_res_rate: f64,
    #[serde(default = "default_attr_names")]
    pub attr_names: Vec<String>,
    #[serde(default)]
    pub res_weights: Option<Vec<f64>>,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            view_update_timeout_ms: default_view_update_timeout_ms(),
            max_res_rate: default_max_res_rate(),
            attr_names: default_attr_names(),
            res_weights: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestConfig {
    #[serde(default = "default_max_summary_count")]
    pub max_summary_count: usize,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            max_summary_count: default_max_summary_count(),
        }
    }
}

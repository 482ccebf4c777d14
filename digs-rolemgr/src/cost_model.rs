//! Throughput simulation feeding the proportion calculator, grounded on
//! `LlamaSimulator.h`/`.cpp` and `SimulationCalculator.h`/`.cpp`. Model
//! *execution* is out of scope; this is a closed-form roofline estimate of
//! how many tokens/sec a node can sustain in each role, used only to pick
//! a P/D instance ratio.

use crate::error::RoleManagerResult;
use digs_core::registry::RequestProfiler;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default)]
pub struct SimulatedAbility {
    /// Tokens/sec a node can sustain serving prefill only.
    pub p_ability: f64,
    /// Tokens/sec a node can sustain serving decode only.
    pub d_ability: f64,
    /// Tokens/sec a node can sustain serving a Flex (mixed) workload.
    pub t_ability: f64,
}

pub trait ModelSimulator: Send + Sync {
    fn simulate(&self, avg_input_length: u64, avg_output_length: u64) -> SimulatedAbility;
}

/// Roofline cost model for a dense Llama-family transformer: prefill is
/// compute-bound (FLOPs/token over peak TFLOPS), decode is
/// memory-bandwidth-bound (bytes/token of weights over peak GB/s).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlamaSimulatorParams {
    pub params_billion: f64,
    pub hidden_size: u64,
    pub num_layers: u64,
    pub bytes_per_param: f64,
    pub tflops: f64,
    pub mem_bw_gbps: f64,
}

impl Default for LlamaSimulatorParams {
    fn default() -> Self {
        Self {
            params_billion: 7.0,
            hidden_size: 4096,
            num_layers: 32,
            bytes_per_param: 2.0,
            tflops: 312.0,
            mem_bw_gbps: 2039.0,
        }
    }
}

pub struct LlamaSimulator {
    params: LlamaSimulatorParams,
}

impl LlamaSimulator {
    pub fn new(params: LlamaSimulatorParams) -> Self {
        Self { params }
    }
}

impl ModelSimulator for LlamaSimulator {
    fn simulate(&self, avg_input_length: u64, _avg_output_length: u64) -> SimulatedAbility {
        let p = &self.params;
        let total_params = p.params_billion * 1e9;

        // 2 FLOPs per parameter per token (multiply-add), scaled by how
        // many input tokens a prefill pass processes per forward call.
        let flops_per_token = 2.0 * total_params;
        let seq_len = avg_input_length.max(1) as f64;
        let prefill_time_per_token_s = flops_per_token / (p.tflops * 1e12);
        // Prefill amortizes weight-load cost across the whole sequence.
        let p_ability = seq_len / (prefill_time_per_token_s * seq_len).max(f64::MIN_POSITIVE);

        let bytes_per_token = total_params * p.bytes_per_param;
        let decode_time_per_token_s = bytes_per_token / (p.mem_bw_gbps * 1e9);
        let d_ability = 1.0 / decode_time_per_token_s.max(f64::MIN_POSITIVE);

        // Flex instances interleave prefill and decode work on the same
        // node; approximate combined throughput as the harmonic mean of
        // the two specialized abilities.
        let t_ability = if p_ability > 0.0 && d_ability > 0.0 {
            2.0 / (1.0 / p_ability + 1.0 / d_ability)
        } else {
            0.0
        };

        SimulatedAbility {
            p_ability,
            d_ability,
            t_ability,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelFamily {
    Llama,
}

/// Factory mirroring `SimulationCalculator::Create`/`CreateLlamaSimulator`:
/// falls back to a sane default and logs rather than failing startup on an
/// unrecognized model family.
pub fn create_simulator(family: &str, params: LlamaSimulatorParams) -> RoleManagerResult<Box<dyn ModelSimulator>> {
    match family.to_ascii_lowercase().as_str() {
        "llama" | "" => Ok(Box::new(LlamaSimulator::new(params))),
        other => {
            tracing::warn!(family = other, "unrecognized model family, falling back to llama cost model");
            Ok(Box::new(LlamaSimulator::new(params)))
        }
    }
}

pub async fn simulate_from_profiler(
    simulator: &dyn ModelSimulator,
    profiler: &RequestProfiler,
) -> SimulatedAbility {
    simulator.simulate(profiler.avg_input_length(), profiler.avg_output_length())
}

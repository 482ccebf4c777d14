//! Fixed-length resource vector and the load-scoring formulas built on top
//! of it. The weight layout and the three `get_token_sum` regimes mirror
//! the original scheduler's `meta_resource.cpp` bit for bit; see
//! SPEC_FULL.md §2 for the derivation.

use crate::error::{DigsError, DigsResult};
use serde::{Deserialize, Serialize};

pub const ATTR_SLOTS: usize = 0;
pub const ATTR_BLOCKS: usize = 1;

const DOUBLE_EPS: f64 = 1e-6;

fn double_is_zero(v: f64) -> bool {
    v.abs() < DOUBLE_EPS
}

/// A resource vector over a configurable, ordered set of attribute names.
/// Two attributes (`slots`, `blocks`) are always present; additional
/// hardware attributes (e.g. `cpuMem`) may be appended at config time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaResource {
    attrs: Vec<u64>,
    /// Per-sequence input-token counts contributing to the token-sum score.
    /// Populated via `update_tokens` on demand vectors, and maintained as
    /// a running multiset on accumulated pool resources via inc/dec.
    compute_attributes: Vec<u64>,
}

impl Default for MetaResource {
    fn default() -> Self {
        Self {
            attrs: vec![1, 0],
            compute_attributes: Vec::new(),
        }
    }
}

impl MetaResource {
    pub fn with_attr_count(n: usize) -> Self {
        let mut attrs = vec![0u64; n];
        if n > ATTR_SLOTS {
            attrs[ATTR_SLOTS] = 1;
        }
        Self {
            attrs,
            compute_attributes: Vec::new(),
        }
    }

    pub fn from_attrs(attrs: Vec<u64>) -> Self {
        Self {
            attrs,
            compute_attributes: Vec::new(),
        }
    }

    pub fn slots(&self) -> u64 {
        self.attrs.get(ATTR_SLOTS).copied().unwrap_or(0)
    }

    pub fn blocks(&self) -> u64 {
        self.attrs.get(ATTR_BLOCKS).copied().unwrap_or(0)
    }

    pub fn at(&self, i: usize) -> u64 {
        self.attrs.get(i).copied().unwrap_or(0)
    }

    pub fn set_at(&mut self, i: usize, v: u64) {
        if i < self.attrs.len() {
            self.attrs[i] = v;
        }
    }

    pub fn len(&self) -> usize {
        self.attrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attrs.is_empty()
    }

    pub fn compute_attributes(&self) -> &[u64] {
        &self.compute_attributes
    }

    /// Stamps this resource as a request demand carrying a single
    /// per-sequence input-token count (used by `get_token_sum`).
    pub fn update_tokens(&mut self, tokens: u64) {
        self.compute_attributes = vec![tokens];
    }

    pub fn ge(&self, other: &MetaResource) -> bool {
        self.attrs
            .iter()
            .zip(other.attrs.iter())
            .all(|(a, b)| a >= b)
    }

    pub fn inc_resource(&mut self, delta: &MetaResource) {
        for (a, b) in self.attrs.iter_mut().zip(delta.attrs.iter()) {
            *a = a.saturating_add(*b);
        }
        self.compute_attributes.extend(delta.compute_attributes.iter().copied());
    }

    pub fn dec_resource(&mut self, delta: &MetaResource) -> DigsResult<()> {
        if !self.ge(delta) {
            return Err(DigsError::IllegalParameter(
                "dec_resource would underflow meta resource".into(),
            ));
        }
        for (a, b) in self.attrs.iter_mut().zip(delta.attrs.iter()) {
            *a -= b;
        }
        for t in &delta.compute_attributes {
            if let Some(pos) = self.compute_attributes.iter().position(|x| x == t) {
                self.compute_attributes.swap_remove(pos);
            }
        }
        Ok(())
    }

    pub fn res_mul(&self, mul: f64) -> DigsResult<MetaResource> {
        if !mul.is_finite() || mul < 0.0 {
            return Ok(MetaResource::from_attrs(vec![0; self.attrs.len()]));
        }
        let mut out = Vec::with_capacity(self.attrs.len());
        for &a in &self.attrs {
            let scaled = a as f64 * mul;
            if !scaled.is_finite() || scaled < 0.0 || scaled >= u64::MAX as f64 {
                return Err(DigsError::IllegalParameter(
                    "res_mul produced a non-finite or overflowing component".into(),
                ));
            }
            out.push(scaled as u64);
        }
        Ok(MetaResource::from_attrs(out))
    }

    pub fn total_load(&self) -> u64 {
        self.attrs.iter().copied().fold(0u64, |a, b| a.saturating_add(b))
    }
}

/// The weight vector driving `get_token_sum`/`compute_aware_load`. Default
/// layout: `[a, _, o, n, k, m, r, w_slots, w_blocks, ..]`, matching the
/// original's `res_weight_` array and its `ATTR_*` index constants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResWeights {
    raw: Vec<f64>,
}

const W_A: usize = 0;
const W_O: usize = 2;
const W_N: usize = 3;
const W_K: usize = 4;
const W_M: usize = 5;
const W_R: usize = 6;
const SPEC_WEIGHTS: usize = 7;

impl ResWeights {
    pub fn default_for(num_attrs: usize) -> Self {
        let mut raw = vec![0.0, 0.22, 1024.0, 24.0, 6.0, 0.0, 1.0];
        // Default per-attribute weights: slots=0, blocks=1, any extra attrs=0.
        let mut per_attr = vec![0.0; num_attrs.max(2)];
        per_attr[ATTR_SLOTS] = 0.0;
        per_attr[ATTR_BLOCKS] = 1.0;
        raw.extend(per_attr);
        Self { raw }
    }

    pub fn from_raw(raw: Vec<f64>) -> Self {
        Self { raw }
    }

    fn a(&self) -> f64 {
        self.raw.get(W_A).copied().unwrap_or(0.0)
    }
    fn o(&self) -> f64 {
        self.raw.get(W_O).copied().unwrap_or(0.0)
    }
    fn n(&self) -> f64 {
        self.raw.get(W_N).copied().unwrap_or(0.0)
    }
    fn k(&self) -> f64 {
        self.raw.get(W_K).copied().unwrap_or(0.0)
    }
    fn m(&self) -> f64 {
        self.raw.get(W_M).copied().unwrap_or(0.0)
    }
    fn r(&self) -> f64 {
        self.raw.get(W_R).copied().unwrap_or(0.0)
    }
    fn attr_weight(&self, i: usize) -> f64 {
        self.raw.get(SPEC_WEIGHTS + i).copied().unwrap_or(0.0)
    }
}

/// Regime-switching token-count estimate feeding `compute_aware_load`.
/// See SPEC_FULL.md §2 for the three regimes (degenerate, small-batch,
/// grouped-with-tail).
pub fn get_token_sum(res: &MetaResource, max_slots: u64, demand: &MetaResource, weights: &ResWeights) -> u64 {
    if double_is_zero(weights.a()) {
        return 1;
    }

    let o = weights.o().max(0.0) as i64;
    let n = if weights.n() <= 0.0 { 1 } else { weights.n() as i64 };
    let k = weights.k().max(0.0) as usize;

    let demand_seq_input: Option<i64> = match demand.compute_attributes() {
        [single] => Some(*single as i64),
        _ => None,
    };

    if (max_slots as i64) < n / 2 {
        let mut sum: i64 = res.compute_attributes().iter().map(|&t| t as i64 + o).sum();
        if let Some(d) = demand_seq_input {
            sum += d;
        }
        return sum.max(0) as u64;
    }

    let mut tmp: Vec<i64> = res.compute_attributes().iter().map(|&t| t as i64 + o).collect();
    if let Some(d) = demand_seq_input {
        tmp.push(d);
    }
    tmp.sort_unstable();

    let seq_num = tmp.len();
    if seq_num == 0 {
        return 0;
    }
    let n_usize = n.max(1) as usize;
    let group_num = seq_num / n_usize;
    let tail_seq_num = seq_num % n_usize;

    let mut token_sum: i64 = 0;
    for g in 0..group_num {
        let last_idx = (g + 1) * n_usize - 1;
        token_sum += tmp[last_idx] * n;
    }
    if tail_seq_num > 0 {
        let tail_last = tmp[seq_num - 1];
        token_sum += if tail_seq_num <= k {
            (tail_last / 2) * tail_seq_num as i64
        } else {
            tail_last * tail_seq_num as i64
        };
    }
    token_sum.max(0) as u64
}

/// Combined load score used to rank candidate instances during selection.
pub fn compute_aware_load(
    res: &MetaResource,
    max_slots: u64,
    reported_blocks: u64,
    demand: &MetaResource,
    weights: &ResWeights,
) -> f64 {
    let token_sum = get_token_sum(res, max_slots, demand, weights);
    let tokens_score = token_sum as f64 * weights.a();

    let eff_max_slots = if res.slots() == max_slots { max_slots + 1 } else { max_slots };
    let max_slots_score = eff_max_slots as f64 * weights.m();

    let blocks_score = reported_blocks as f64 * weights.r();

    let mut attr_score = 0.0;
    for i in 0..res.len() {
        attr_score += (res.at(i) as f64 + demand.at(i) as f64) * weights.attr_weight(i);
    }

    tokens_score + max_slots_score + blocks_score + attr_score
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_weights_are_degenerate() {
        let w = ResWeights::default_for(2);
        let res = MetaResource::default();
        let demand = MetaResource::default();
        assert_eq!(get_token_sum(&res, 1, &demand, &w), 1);
    }

    #[test]
    fn res_mul_rejects_negative_multiplier() {
        let res = MetaResource::from_attrs(vec![10, 20]);
        let out = res.res_mul(-1.0).expect("res_mul should not error on negative, just zero");
        assert_eq!(out.at(0), 0);
        assert_eq!(out.at(1), 0);
    }

    #[test]
    fn dec_resource_rejects_underflow() {
        let mut res = MetaResource::from_attrs(vec![1, 0]);
        let delta = MetaResource::from_attrs(vec![2, 0]);
        assert!(res.dec_resource(&delta).is_err());
    }

    #[test]
    fn inc_then_dec_round_trips_compute_attributes() {
        let mut res = MetaResource::from_attrs(vec![0, 0]);
        let mut demand = MetaResource::from_attrs(vec![1, 0]);
        demand.update_tokens(128);
        res.inc_resource(&demand);
        assert_eq!(res.compute_attributes(), &[128]);
        res.dec_resource(&demand).expect("dec should succeed");
        assert!(res.compute_attributes().is_empty());
    }

    #[test]
    fn grouped_regime_scores_last_of_each_group() {
        let w = ResWeights::from_raw(vec![1.0, 0.0, 0.0, 2.0, 10.0, 0.0, 0.0, 0.0, 0.0]);
        let mut res = MetaResource::from_attrs(vec![0, 0]);
        res.compute_attributes = vec![10, 20, 30, 40];
        let demand = MetaResource::from_attrs(vec![0, 0]);
        // n=2, o=0: groups (10,20)->20*2=40, (30,40)->40*2=80, tail=0 => 120
        assert_eq!(get_token_sum(&res, 100, &demand, &w), 120);
    }

    #[test]
    fn grouped_regime_does_not_add_offset_to_demand_seq_input() {
        let w = ResWeights::from_raw(vec![1.0, 5.0, 0.0, 2.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
        let mut res = MetaResource::from_attrs(vec![0, 0]);
        res.compute_attributes = vec![10, 20];
        let mut demand = MetaResource::from_attrs(vec![0, 0]);
        demand.compute_attributes = vec![50];
        // o=5, n=2, k=0: tmp = [10+5, 20+5, 50] = [15, 25, 50] (demand's own
        // seq length is never offset by `o`). group (15,25)->25*2=50, tail
        // (50)->50*1=50 since tail_seq_num(1) > k(0). Total 100.
        assert_eq!(get_token_sum(&res, 100, &demand, &w), 100);
    }
}

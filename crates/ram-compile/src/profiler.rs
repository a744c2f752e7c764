//! Join profiling support
//!
//! The optimizer runs the program against a Bernoulli sample of the input
//! facts, instrumented with `EstimateJoinSize` probes. Each probe records,
//! once per fixpoint round, the size of a relation and the number of
//! duplicate tuples under a projection to a bound-attribute set. From these
//! counts the profile answers "how many tuples match, on average, once
//! these attributes are fixed".

use datalog_ast::RamSym;
use rand::rngs::StdRng;
use rand::Rng;
use std::collections::HashMap;

/// Bernoulli-sample `rows` with probability `p`, keeping at least
/// `min_sample` rows (all of them when fewer exist). The caller seeds the
/// generator, so profiling is reproducible.
pub fn bernoulli_sample<T: Clone>(
    rows: &[T],
    p: f64,
    min_sample: usize,
    rng: &mut StdRng,
) -> Vec<T> {
    if rows.len() <= min_sample {
        return rows.to_vec();
    }
    let mut picked = vec![false; rows.len()];
    let mut out: Vec<T> = Vec::new();
    for (i, row) in rows.iter().enumerate() {
        if rng.gen_bool(p) {
            picked[i] = true;
            out.push(row.clone());
        }
    }
    // Enforce the minimum sample by topping up from the front.
    if out.len() < min_sample {
        for (i, row) in rows.iter().enumerate() {
            if out.len() >= min_sample {
                break;
            }
            if !picked[i] {
                out.push(row.clone());
            }
        }
    }
    out
}

/// Collected join-size estimates, keyed by relation variant and sorted
/// bound-attribute set.
#[derive(Debug, Clone, Default)]
pub struct JoinProfile {
    data: HashMap<(RamSym, Vec<usize>), Vec<(u64, u64)>>,
}

impl JoinProfile {
    /// Assemble the profile from the probe table and the per-buffer samples
    /// the instrumented run produced.
    pub fn from_samples(
        probes: &[(RamSym, Vec<usize>)],
        samples: Vec<Vec<(u64, u64)>>,
    ) -> Self {
        let mut data = HashMap::new();
        for ((sym, attrs), rounds) in probes.iter().cloned().zip(samples) {
            data.insert((sym, attrs), rounds);
        }
        JoinProfile { data }
    }

    /// Expected number of matching tuples per fixpoint round once `attrs`
    /// are bound: `size / distinct(attrs)`. `None` when the probe never
    /// fired.
    pub fn expectation(&self, sym: &RamSym, attrs: &[usize]) -> Option<Vec<f64>> {
        let rounds = self.data.get(&(sym.clone(), attrs.to_vec()))?;
        if rounds.is_empty() {
            return None;
        }
        Some(
            rounds
                .iter()
                .map(|&(size, dups)| {
                    let distinct = size.saturating_sub(dups).max(1);
                    size as f64 / distinct as f64
                })
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use datalog_ast::{Denotation, PredSym, RelSym};
    use rand::SeedableRng;

    fn sym(name: &str) -> RamSym {
        RamSym::full(RelSym::new(PredSym::new(name, 0), 2, Denotation::Relational))
    }

    #[test]
    fn test_sampling_is_reproducible_and_bounded() {
        let rows: Vec<i64> = (0..1000).collect();
        let mut rng1 = StdRng::seed_from_u64(0);
        let mut rng2 = StdRng::seed_from_u64(0);
        let s1 = bernoulli_sample(&rows, 0.2, 10, &mut rng1);
        let s2 = bernoulli_sample(&rows, 0.2, 10, &mut rng2);
        assert_eq!(s1, s2);
        assert!(s1.len() >= 10);
        assert!(s1.len() < 1000);
    }

    #[test]
    fn test_minimum_sample_is_enforced() {
        let rows: Vec<i64> = (0..200).collect();
        let mut rng = StdRng::seed_from_u64(7);
        let s = bernoulli_sample(&rows, 0.0, 100, &mut rng);
        assert_eq!(s.len(), 100);
    }

    #[test]
    fn test_small_inputs_are_taken_whole() {
        let rows: Vec<i64> = (0..5).collect();
        let mut rng = StdRng::seed_from_u64(0);
        let s = bernoulli_sample(&rows, 0.01, 100, &mut rng);
        assert_eq!(s.len(), 5);
    }

    #[test]
    fn test_expectation_divides_by_distinct() {
        let probes = vec![(sym("Edge"), vec![0usize])];
        // 6 tuples, 2 duplicates under attr 0 -> 4 distinct groups.
        let profile = JoinProfile::from_samples(&probes, vec![vec![(6, 2)]]);
        let e = profile.expectation(&sym("Edge"), &[0]).unwrap();
        assert_eq!(e, vec![1.5]);
        assert!(profile.expectation(&sym("Edge"), &[1]).is_none());
    }
}

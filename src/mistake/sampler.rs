//! Mistake-biased epoch sampling.
//!
//! With failures on record, `round(n * focus_ratio)` problems come from the
//! failure pool by descending score (with replacement when the pool is too
//! small), the rest from the other problems without replacement, and any
//! shortfall is backfilled from the failure pool. Without failures the epoch
//! is a plain uniform draw.

use std::cmp::Reverse;
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use ordered_float::OrderedFloat;
use rand::seq::SliceRandom;
use rand::Rng;
use tracing::debug;

use super::bank::{score_for_sampling, MistakeBank, MistakeStatus};
use crate::data::{Problem, ProblemKey};

/// Draw `n` problems from `pool`.
pub fn sample_epoch<R: Rng + ?Sized>(
    pool: &[Problem],
    bank: Option<&MistakeBank>,
    n: usize,
    focus_ratio: f64,
    rng: &mut R,
    now: DateTime<Utc>,
) -> Vec<Problem> {
    if pool.is_empty() || n == 0 {
        return Vec::new();
    }

    let scores: HashMap<ProblemKey, f64> = bank
        .map(|b| {
            b.records()
                .filter(|r| r.status == MistakeStatus::Failed)
                .map(|r| (r.key(), score_for_sampling(r, now)))
                .collect()
        })
        .unwrap_or_default();

    let (mut failures, mut others): (Vec<&Problem>, Vec<&Problem>) =
        pool.iter().partition(|p| scores.contains_key(&p.key()));

    if failures.is_empty() {
        return uniform(pool, n, rng);
    }

    failures.sort_by_key(|p| Reverse(OrderedFloat(scores[&p.key()])));
    others.shuffle(rng);

    let focused = ((n as f64) * focus_ratio.clamp(0.0, 1.0)).round() as usize;
    let focused = focused.min(n);
    let mut picked: Vec<Problem> = failures
        .iter()
        .cycle()
        .take(focused)
        .map(|p| (*p).clone())
        .collect();

    let remaining = n - picked.len();
    picked.extend(others.iter().take(remaining).map(|p| (*p).clone()));

    let mut backfilled = 0;
    while picked.len() < n {
        if let Some(p) = failures.choose(rng) {
            picked.push((*p).clone());
            backfilled += 1;
        }
    }

    debug!(
        requested = n,
        failure_pool = failures.len(),
        other_pool = others.len(),
        focused,
        backfilled,
        "Sampled epoch with mistake focus"
    );
    picked
}

/// Uniform draw: shuffle, repeating the pool when `n` exceeds it.
fn uniform<R: Rng + ?Sized>(pool: &[Problem], n: usize, rng: &mut R) -> Vec<Problem> {
    let mut picked = Vec::with_capacity(n);
    while picked.len() < n {
        let mut round: Vec<&Problem> = pool.iter().collect();
        round.shuffle(rng);
        picked.extend(round.into_iter().take(n - picked.len()).cloned());
    }
    picked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MistakeBankConfig;
    use crate::test_support::{judged_group, problems};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn bank_with_failures(dir: &std::path::Path, failing: &[usize]) -> MistakeBank {
        let mut bank =
            MistakeBank::open("exp", dir.join("bank.json"), MistakeBankConfig::default(), 0.5).unwrap();
        for &i in failing {
            bank.update_from_judged(&judged_group(i, &[0.0]), Utc::now()).unwrap();
        }
        bank
    }

    #[test]
    fn test_uniform_without_bank_is_seeded() {
        let pool = problems(10);
        let a = sample_epoch(&pool, None, 6, 0.3, &mut StdRng::seed_from_u64(7), Utc::now());
        let b = sample_epoch(&pool, None, 6, 0.3, &mut StdRng::seed_from_u64(7), Utc::now());
        assert_eq!(a, b);
        assert_eq!(a.len(), 6);
        let mut keys: Vec<_> = a.iter().map(|p| p.index).collect();
        keys.sort_unstable();
        keys.dedup();
        assert_eq!(keys.len(), 6);
    }

    #[test]
    fn test_focus_portion_comes_from_failures() {
        let dir = tempfile::tempdir().unwrap();
        let bank = bank_with_failures(dir.path(), &[2, 5]);
        let pool = problems(10);
        let picked = sample_epoch(&pool, Some(&bank), 10, 0.3, &mut StdRng::seed_from_u64(1), Utc::now());
        assert_eq!(picked.len(), 10);
        // round(10 * 0.3) = 3 focused draws cycle over the two failures.
        let focused: Vec<_> = picked[..3].iter().map(|p| p.index).collect();
        assert!(focused.iter().all(|i| *i == 2 || *i == 5));
        // Remaining 7 come from the 8 non-failures without replacement.
        let mut rest: Vec<_> = picked[3..].iter().map(|p| p.index).collect();
        assert!(rest.iter().all(|i| *i != 2 && *i != 5));
        rest.sort_unstable();
        rest.dedup();
        assert_eq!(rest.len(), 7);
    }

    #[test]
    fn test_backfill_from_failures_when_short() {
        let dir = tempfile::tempdir().unwrap();
        let bank = bank_with_failures(dir.path(), &[0, 1]);
        let pool = problems(3);
        let picked = sample_epoch(&pool, Some(&bank), 6, 0.5, &mut StdRng::seed_from_u64(3), Utc::now());
        assert_eq!(picked.len(), 6);
        assert_eq!(picked.iter().filter(|p| p.index == 2).count(), 1);
    }

    #[test]
    fn test_failures_ordered_by_score() {
        let dir = tempfile::tempdir().unwrap();
        let mut bank = bank_with_failures(dir.path(), &[4]);
        // Problem 7 fails more often, so it scores higher.
        bank.update_from_judged(&judged_group(7, &[0.0, 0.0, 0.0]), Utc::now()).unwrap();
        let pool = problems(10);
        let picked = sample_epoch(&pool, Some(&bank), 10, 0.1, &mut StdRng::seed_from_u64(9), Utc::now());
        assert_eq!(picked[0].index, 7);
    }
}

use crate::config::config::PredictionCfg;
use crate::core::error::EngineError;
use crate::core::types::{MemberId, StatementId};
use crate::engine::matrix::{Matrix, population_covariance};
use crate::engine::types::{PredictionOutcome, PredictionSnapshot, StatementRecord};
use rand::Rng;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Ground truth for one statement: the sign of the community's +1/-1 votes.
/// Zero sum or no votes leaves the outcome unresolved. Always safe to re-run.
pub fn resolve_outcome(votes: &[bool]) -> Option<bool> {
    let sum: i64 = votes.iter().map(|v| if *v { 1 } else { -1 }).sum();
    match sum {
        s if s > 0 => Some(true),
        s if s < 0 => Some(false),
        _ => None,
    }
}

/// Interval Mean Absolute Correctness for a tag, over statements carrying both
/// a combined bet and a resolved outcome: `1 - |sum(combined) - sum(outcome)| / n`.
/// None when no statement qualifies.
pub fn tag_imac(statements: &[(Option<f64>, Option<bool>)]) -> Option<f64> {
    let resolved: Vec<(f64, f64)> = statements
        .iter()
        .filter_map(|(combined, outcome)| match (combined, outcome) {
            (Some(c), Some(o)) => Some((*c, if *o { 1.0 } else { 0.0 })),
            _ => None,
        })
        .collect();
    if resolved.is_empty() {
        return None;
    }
    let n = resolved.len() as f64;
    let sum_combined: f64 = resolved.iter().map(|(c, _)| c).sum();
    let sum_outcome: f64 = resolved.iter().map(|(_, o)| o).sum();
    Some(1.0 - (sum_combined - sum_outcome).abs() / n)
}

/// Combined-bet settlement for every statement of a poll.
///
/// Per statement the estimator weights each bettor by the inverse covariance
/// of their historical forecast errors across the comparison set (generalized
/// least squares, weights summing to 1) and de-biases each current bet by the
/// bettor's mean historical error. Statements whose covariance matrix cannot
/// be regularized settle on the unweighted mean and are reported in
/// `degenerate`.
pub fn settle_predictions<R: Rng>(
    snap: &PredictionSnapshot,
    cfg: &PredictionCfg,
    rng: &mut R,
) -> Result<PredictionOutcome, EngineError> {
    let records: BTreeMap<StatementId, &StatementRecord> =
        snap.statements.iter().map(|s| (s.id, s)).collect();

    for record in &snap.statements {
        for score in record.bets.values() {
            if *score > 5 {
                return Err(EngineError::DataIntegrity(format!(
                    "statement {}: bet score {} out of 0..=5",
                    record.id, score
                )));
            }
        }
    }

    let mut outcome = PredictionOutcome::default();

    for id in &snap.current {
        let target = *records.get(id).ok_or_else(|| {
            EngineError::DataIntegrity(format!(
                "statement {} missing from the comparison set of poll {}",
                id, snap.poll.id
            ))
        })?;
        if target.poll_id != snap.poll.id {
            return Err(EngineError::DataIntegrity(format!(
                "statement {} belongs to poll {}, not poll {}",
                id, target.poll_id, snap.poll.id
            )));
        }
        if target.bets.is_empty() {
            debug!(statement = *id, "no bets placed, combined bet stays null");
            continue;
        }

        let history: Vec<&StatementRecord> = snap
            .statements
            .iter()
            .filter(|s| s.id != target.id && s.outcome.is_some())
            .collect();

        match combine(target, &history, cfg, rng) {
            Combined::Weighted(value) => {
                outcome.combined.insert(*id, value);
            }
            Combined::Fallback(value) => {
                outcome.combined.insert(*id, value);
                outcome.degenerate.push(*id);
            }
        }
    }

    Ok(outcome)
}

enum Combined {
    Weighted(f64),
    /// Unweighted mean after numeric degeneracy.
    Fallback(f64),
}

struct Predictor {
    current: f64,
    bias: f64,
    errors: BTreeMap<StatementId, f64>,
}

fn combine<R: Rng>(
    target: &StatementRecord,
    history: &[&StatementRecord],
    cfg: &PredictionCfg,
    rng: &mut R,
) -> Combined {
    // Every member with a bet on the target is a candidate predictor.
    let mut predictors: Vec<Predictor> = Vec::new();
    let mut without_history = 0usize;
    for (member, score) in &target.bets {
        let p = build_predictor(*member, f64::from(*score) / 5.0, history);
        if p.errors.is_empty() {
            without_history += 1;
        }
        predictors.push(p);
    }

    let mean_current =
        predictors.iter().map(|p| p.current).sum::<f64>() / predictors.len() as f64;

    // Nobody has usable history: unweighted mean of the current bets. This is
    // the documented estimator fallback, not a degeneracy.
    if without_history == predictors.len() {
        return Combined::Weighted(clamp01(mean_current));
    }
    // Mixed: drop the history-less predictors, keep the rest.
    predictors.retain(|p| !p.errors.is_empty());

    let n = predictors.len();
    let weights = if n == 1 {
        vec![1.0]
    } else {
        match gls_weights(&predictors, cfg, rng) {
            Ok(w) => w,
            Err(err) => {
                warn!(
                    statement = target.id,
                    %err,
                    "covariance degenerate, falling back to unweighted mean"
                );
                return Combined::Fallback(clamp01(mean_current));
            }
        }
    };

    let combined: f64 = predictors
        .iter()
        .zip(&weights)
        .map(|(p, w)| w * clamp01(p.current + p.bias))
        .sum();
    Combined::Weighted(clamp01(combined))
}

fn build_predictor(member: MemberId, current: f64, history: &[&StatementRecord]) -> Predictor {
    let mut outcomes = Vec::new();
    let mut bets = Vec::new();
    let mut errors = BTreeMap::new();

    for record in history {
        let outcome = match record.outcome {
            Some(true) => 1.0,
            Some(false) => 0.0,
            None => continue,
        };
        if let Some(score) = record.bets.get(&member) {
            let bet = f64::from(*score) / 5.0;
            outcomes.push(outcome);
            bets.push(bet);
            errors.insert(record.id, outcome - bet);
        }
    }

    // Bias: how far the realized outcomes sat from this member's own bets,
    // on average. Added to the current bet to de-bias it.
    let bias = if outcomes.is_empty() {
        0.0
    } else {
        let n = outcomes.len() as f64;
        outcomes.iter().sum::<f64>() / n - bets.iter().sum::<f64>() / n
    };

    Predictor {
        current,
        bias,
        errors,
    }
}

/// Inverse-covariance aggregation weights `w = inv(C)*1 / (1' * inv(C) * 1)`,
/// minimizing the variance of the combined estimate. Pairs with no common
/// history contribute zero covariance. A singular matrix is perturbed at
/// random off-diagonal entries by +/- epsilon until it inverts or the attempt
/// budget runs out.
fn gls_weights<R: Rng>(
    predictors: &[Predictor],
    cfg: &PredictionCfg,
    rng: &mut R,
) -> Result<Vec<f64>, EngineError> {
    let n = predictors.len();
    let mut cov = Matrix::zeros(n);
    for i in 0..n {
        for j in i..n {
            let pairs: Vec<(f64, f64)> = predictors[i]
                .errors
                .iter()
                .filter_map(|(stmt, ei)| predictors[j].errors.get(stmt).map(|ej| (*ei, *ej)))
                .collect();
            let c = population_covariance(&pairs).unwrap_or(0.0);
            cov.set(i, j, c);
            cov.set(j, i, c);
        }
    }

    let mut attempts = 0u32;
    while cov.determinant() == 0.0 {
        if attempts >= cfg.regularization_attempts {
            return Err(EngineError::NumericDegeneracy { attempts });
        }
        let i = rng.gen_range(0..n);
        let mut j = rng.gen_range(0..n - 1);
        if j >= i {
            j += 1;
        }
        let delta = if rng.r#gen::<bool>() {
            cfg.regularization_epsilon
        } else {
            -cfg.regularization_epsilon
        };
        // Perturb symmetrically so the matrix stays a covariance candidate.
        cov.add(i, j, delta);
        cov.add(j, i, delta);
        attempts += 1;
    }

    let inv = cov
        .inverse()
        .ok_or(EngineError::NumericDegeneracy { attempts })?;
    let row_sums = inv.row_sums();
    let denom: f64 = row_sums.iter().sum();
    if denom == 0.0 || !denom.is_finite() {
        return Err(EngineError::NumericDegeneracy { attempts });
    }
    Ok(row_sums.iter().map(|r| r / denom).collect())
}

fn clamp01(v: f64) -> f64 {
    v.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::tests::{poll_with_hours, ts};
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn cfg() -> PredictionCfg {
        PredictionCfg::default()
    }

    fn rng() -> StdRng {
        StdRng::seed_from_u64(42)
    }

    fn record(
        id: StatementId,
        poll_id: i64,
        outcome: Option<bool>,
        bets: &[(MemberId, u8)],
    ) -> StatementRecord {
        StatementRecord {
            id,
            poll_id,
            end: ts(3),
            outcome,
            bets: bets.iter().copied().collect(),
        }
    }

    fn snapshot(current: Vec<StatementId>, statements: Vec<StatementRecord>) -> PredictionSnapshot {
        PredictionSnapshot {
            poll: poll_with_hours([1, 2, 3, 4, 5, 6, 7]),
            current,
            statements,
        }
    }

    #[test]
    fn outcome_follows_vote_majority() {
        assert_eq!(resolve_outcome(&[true, true, false]), Some(true));
        assert_eq!(resolve_outcome(&[false, false, true]), Some(false));
        assert_eq!(resolve_outcome(&[true, false]), None);
        assert_eq!(resolve_outcome(&[]), None);
    }

    #[test]
    fn imac_none_without_resolved_statements() {
        assert_eq!(tag_imac(&[]), None);
        assert_eq!(tag_imac(&[(Some(0.4), None), (None, Some(true))]), None);
    }

    #[test]
    fn imac_skips_resolved_statements_without_a_combined_bet() {
        // The statement with outcome true but no combined bet (no bets were
        // ever placed) contributes neither to the sums nor to n.
        let score = tag_imac(&[(None, Some(true)), (Some(0.8), Some(true))]).unwrap();
        assert!((score - 0.8).abs() < 1e-9);
        // Only betless statements resolved: nothing qualifies.
        assert_eq!(tag_imac(&[(None, Some(true)), (None, Some(false))]), None);
    }

    #[test]
    fn imac_formula() {
        // combined sums to 1.1, outcomes sum to 1.0, two statements.
        let score = tag_imac(&[(Some(0.8), Some(true)), (Some(0.3), Some(false))]).unwrap();
        assert!((score - 0.95).abs() < 1e-9);
        // Perfect forecasts score 1.
        let score = tag_imac(&[(Some(1.0), Some(true)), (Some(0.0), Some(false))]).unwrap();
        assert!((score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn no_history_falls_back_to_mean() {
        // Two bettors at 4/5 and 2/5, nothing to learn from: mean 0.6.
        let snap = snapshot(vec![100], vec![record(100, 1, None, &[(1, 4), (2, 2)])]);
        let out = settle_predictions(&snap, &cfg(), &mut rng()).unwrap();
        assert!((out.combined[&100] - 0.6).abs() < 1e-9);
        assert!(out.degenerate.is_empty());
    }

    #[test]
    fn statement_without_bets_stays_null() {
        let snap = snapshot(vec![100], vec![record(100, 1, None, &[])]);
        let out = settle_predictions(&snap, &cfg(), &mut rng()).unwrap();
        assert!(out.combined.is_empty());
    }

    #[test]
    fn single_predictor_is_debiased_and_clamped() {
        // Member 1 always bet 0 on statements that resolved true: bias = 1.0.
        let snap = snapshot(
            vec![100],
            vec![
                record(10, 2, Some(true), &[(1, 0)]),
                record(11, 2, Some(true), &[(1, 0)]),
                record(100, 1, None, &[(1, 5)]),
            ],
        );
        let out = settle_predictions(&snap, &cfg(), &mut rng()).unwrap();
        // 1.0 (current) + 1.0 (bias) clamps to 1.0.
        assert!((out.combined[&100] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn gls_weights_favor_the_accurate_predictor() {
        // Outcomes 1,0,1,0. Member 1 errors +-0.2 (var 0.04); member 2 errors
        // +-0.6/1.0 (var 0.68); cross covariance 0.16. Hand-computed weights
        // (1.3, -0.3); current bets 0.8 and 0.6 give 1.3*0.8 - 0.3*0.6 = 0.86.
        let snap = snapshot(
            vec![100],
            vec![
                record(10, 2, Some(true), &[(1, 4), (2, 2)]),
                record(11, 2, Some(false), &[(1, 1), (2, 3)]),
                record(12, 2, Some(true), &[(1, 4), (2, 0)]),
                record(13, 2, Some(false), &[(1, 1), (2, 5)]),
                record(100, 1, None, &[(1, 4), (2, 3)]),
            ],
        );
        let out = settle_predictions(&snap, &cfg(), &mut rng()).unwrap();
        assert!(
            (out.combined[&100] - 0.86).abs() < 1e-9,
            "combined = {}",
            out.combined[&100]
        );
        assert!(out.degenerate.is_empty());
    }

    #[test]
    fn predictor_without_history_is_dropped() {
        // Same as above plus member 3 who only bet on the target; the result
        // must not move.
        let snap = snapshot(
            vec![100],
            vec![
                record(10, 2, Some(true), &[(1, 4), (2, 2)]),
                record(11, 2, Some(false), &[(1, 1), (2, 3)]),
                record(12, 2, Some(true), &[(1, 4), (2, 0)]),
                record(13, 2, Some(false), &[(1, 1), (2, 5)]),
                record(100, 1, None, &[(1, 4), (2, 3), (3, 0)]),
            ],
        );
        let out = settle_predictions(&snap, &cfg(), &mut rng()).unwrap();
        assert!((out.combined[&100] - 0.86).abs() < 1e-9);
    }

    #[test]
    fn zero_variance_histories_regularize_to_equal_weights() {
        // One common history statement per pair: every covariance entry is 0,
        // the matrix is singular, and one symmetric perturbation makes it
        // invertible with equal row sums, i.e. weights (0.5, 0.5).
        let snap = snapshot(
            vec![100],
            vec![
                record(10, 2, Some(true), &[(1, 4), (2, 2)]),
                record(100, 1, None, &[(1, 5), (2, 0)]),
            ],
        );
        let out = settle_predictions(&snap, &cfg(), &mut rng()).unwrap();
        // bias1 = 1 - 0.8 = 0.2, bias2 = 1 - 0.4 = 0.6;
        // 0.5*clamp(1.0+0.2) + 0.5*clamp(0.0+0.6) = 0.5 + 0.3 = 0.8.
        assert!((out.combined[&100] - 0.8).abs() < 1e-9);
        assert!(out.degenerate.is_empty());
    }

    #[test]
    fn exhausted_regularization_falls_back_to_mean() {
        // Three predictors, all-zero covariance; a single permitted
        // perturbation leaves one all-zero row, so the matrix stays singular
        // and the statement settles on the unweighted mean of current bets.
        let mut config = cfg();
        config.regularization_attempts = 1;
        let snap = snapshot(
            vec![100],
            vec![
                record(10, 2, Some(true), &[(1, 4), (2, 2), (3, 1)]),
                record(100, 1, None, &[(1, 5), (2, 0), (3, 1)]),
            ],
        );
        let out = settle_predictions(&snap, &config, &mut rng()).unwrap();
        // Mean of 1.0, 0.0, 0.2.
        assert!((out.combined[&100] - 0.4).abs() < 1e-9);
        assert_eq!(out.degenerate, vec![100]);
    }

    #[test]
    fn combined_bet_is_always_clamped() {
        // Degenerate-ish inputs in several shapes never leave [0,1].
        let shapes = vec![
            snapshot(vec![100], vec![record(100, 1, None, &[(1, 5), (2, 5)])]),
            snapshot(
                vec![100],
                vec![
                    record(10, 2, Some(true), &[(1, 0)]),
                    record(100, 1, None, &[(1, 5)]),
                ],
            ),
            snapshot(
                vec![100],
                vec![
                    record(10, 2, Some(false), &[(1, 5)]),
                    record(100, 1, None, &[(1, 0)]),
                ],
            ),
        ];
        for snap in shapes {
            let out = settle_predictions(&snap, &cfg(), &mut rng()).unwrap();
            let combined = out.combined[&100];
            assert!((0.0..=1.0).contains(&combined), "combined = {combined}");
        }
    }

    #[test]
    fn foreign_current_statement_is_fatal() {
        let snap = snapshot(vec![100], vec![record(100, 99, None, &[(1, 3)])]);
        let err = settle_predictions(&snap, &cfg(), &mut rng()).unwrap_err();
        assert!(matches!(err, EngineError::DataIntegrity(_)));
    }

    #[test]
    fn oversized_bet_score_is_fatal() {
        let snap = snapshot(vec![100], vec![record(100, 1, None, &[(1, 6)])]);
        let err = settle_predictions(&snap, &cfg(), &mut rng()).unwrap_err();
        assert!(matches!(err, EngineError::DataIntegrity(_)));
    }
}

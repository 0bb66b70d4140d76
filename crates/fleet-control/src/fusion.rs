//! Result fusion for fan-out jobs and vote combination for consensus jobs.
//!
//! Everything here is pure: partial outputs in, fused output or a failure
//! kind out. The executor handles I/O and feeds this module decoded values.

use std::collections::BTreeMap;

use rand::Rng;

use fleet_types::job::{AggregationKind, ConsensusKind};
use fleet_types::FailureKind;

// ── Numeric fusion (fan-out) ─────────────────────────────────────────────────

/// A successfully decoded numeric partial, with the reputation of the node
/// that produced it.
#[derive(Debug, Clone)]
pub struct NumericPartial {
    pub node_id: String,
    pub values: Vec<f64>,
    pub reputation: f64,
}

/// Fuse numeric partials according to the spec's aggregation kind.
///
/// All vectors must have the same length; a mismatch means a node produced
/// an incompatible output and the fusion cannot be trusted.
pub fn fuse(partials: &[NumericPartial], kind: AggregationKind) -> Result<Vec<f64>, FailureKind> {
    if partials.is_empty() {
        return Err(FailureKind::QuorumLost);
    }
    let len = partials[0].values.len();
    if let Some(bad) = partials.iter().find(|p| p.values.len() != len) {
        return Err(FailureKind::Internal(format!(
            "node {} returned {} elements, expected {len}",
            bad.node_id,
            bad.values.len()
        )));
    }

    let fused = match kind {
        AggregationKind::Mean => mean(partials, len),
        AggregationKind::WeightedMean => weighted_mean(partials, len),
        AggregationKind::Median => median(partials, len),
    };
    Ok(fused)
}

fn mean(partials: &[NumericPartial], len: usize) -> Vec<f64> {
    let n = partials.len() as f64;
    (0..len)
        .map(|i| partials.iter().map(|p| p.values[i]).sum::<f64>() / n)
        .collect()
}

/// Weights are node reputations, normalized over the present partials.
/// If every reputation is zero the fusion degrades to a plain mean.
fn weighted_mean(partials: &[NumericPartial], len: usize) -> Vec<f64> {
    let total: f64 = partials.iter().map(|p| p.reputation).sum();
    if total <= 0.0 {
        return mean(partials, len);
    }
    (0..len)
        .map(|i| {
            partials
                .iter()
                .map(|p| p.values[i] * (p.reputation / total))
                .sum()
        })
        .collect()
}

/// Element-wise median. For an even count the lower-index middle element is
/// taken after a stable sort, so the result is deterministic.
fn median(partials: &[NumericPartial], len: usize) -> Vec<f64> {
    (0..len)
        .map(|i| {
            let mut column: Vec<f64> = partials.iter().map(|p| p.values[i]).collect();
            column.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            column[(column.len() - 1) / 2]
        })
        .collect()
}

/// Add zero-mean Laplace noise with scale `sensitivity / epsilon` to each
/// element. Applied post-fusion, to numeric outputs only.
pub fn apply_laplace_noise<R: Rng>(
    values: &mut [f64],
    epsilon: f64,
    sensitivity: f64,
    rng: &mut R,
) {
    let scale = sensitivity / epsilon;
    for v in values.iter_mut() {
        // Inverse-CDF sampling: u uniform on (-1/2, 1/2],
        // x = -b · sgn(u) · ln(1 − 2|u|).
        let u: f64 = rng.gen::<f64>() - 0.5;
        let noise = -scale * u.signum() * (1.0 - 2.0 * u.abs()).ln();
        *v += noise;
    }
}

// ── Vote combination (consensus) ─────────────────────────────────────────────

/// One present vote: the model that produced it, its label, and the model's
/// reputation weight.
#[derive(Debug, Clone)]
pub struct Vote {
    pub model_id: String,
    pub label: String,
    pub weight: f64,
}

/// The agreed label plus how strongly the votes backed it.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ConsensusOutcome {
    pub label: String,
    /// Weight (or count) share of the winning label, in [0, 1].
    pub share: f64,
}

/// Combine present votes. Absent votes (failed models) are simply not in
/// the slice; the caller decides whether enough are present at all.
pub fn combine_votes(
    votes: &[Vote],
    kind: ConsensusKind,
    min_agreement: f64,
) -> Result<ConsensusOutcome, FailureKind> {
    if votes.is_empty() {
        return Err(FailureKind::NoConsensus);
    }
    match kind {
        ConsensusKind::Majority => majority(votes),
        ConsensusKind::Weighted => weighted(votes, min_agreement, FailureKind::NoConsensus),
        ConsensusKind::Review => weighted(votes, min_agreement, FailureKind::ReviewRequired),
    }
}

/// Highest vote count wins; a tie for the top count is no consensus.
fn majority(votes: &[Vote]) -> Result<ConsensusOutcome, FailureKind> {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for vote in votes {
        *counts.entry(vote.label.as_str()).or_insert(0) += 1;
    }
    let best = counts.iter().map(|(_, &c)| c).max().unwrap_or(0);
    let mut winners = counts.iter().filter(|(_, &c)| c == best);
    let (label, _) = winners.next().expect("non-empty votes have a max");
    if winners.next().is_some() {
        return Err(FailureKind::NoConsensus);
    }
    Ok(ConsensusOutcome {
        label: label.to_string(),
        share: best as f64 / votes.len() as f64,
    })
}

/// Sum weights per label; the top label must reach `min_agreement` of the
/// total weight, otherwise `below_threshold` is returned.
fn weighted(
    votes: &[Vote],
    min_agreement: f64,
    below_threshold: FailureKind,
) -> Result<ConsensusOutcome, FailureKind> {
    let mut weights: BTreeMap<&str, f64> = BTreeMap::new();
    let mut total = 0.0;
    for vote in votes {
        *weights.entry(vote.label.as_str()).or_insert(0.0) += vote.weight;
        total += vote.weight;
    }
    if total <= 0.0 {
        return Err(FailureKind::NoConsensus);
    }
    // BTreeMap iteration gives a deterministic winner among exact ties.
    let (label, weight) = weights
        .iter()
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
        .expect("non-empty votes have a max");

    let share = weight / total;
    if share < min_agreement {
        return Err(below_threshold);
    }
    Ok(ConsensusOutcome {
        label: label.to_string(),
        share,
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn partial(node: &str, values: &[f64], reputation: f64) -> NumericPartial {
        NumericPartial {
            node_id: node.into(),
            values: values.to_vec(),
            reputation,
        }
    }

    #[test]
    fn mean_of_three_vectors() {
        let partials = vec![
            partial("a", &[1.0, 1.0], 0.9),
            partial("b", &[3.0, 3.0], 0.9),
            partial("c", &[5.0, 5.0], 0.9),
        ];
        let fused = fuse(&partials, AggregationKind::Mean).unwrap();
        assert_eq!(fused, vec![3.0, 3.0]);
    }

    #[test]
    fn weighted_mean_follows_reputation() {
        // One trusted node, one untrusted: the result leans to the trusted.
        let partials = vec![
            partial("a", &[0.0], 0.75),
            partial("b", &[4.0], 0.25),
        ];
        let fused = fuse(&partials, AggregationKind::WeightedMean).unwrap();
        assert!((fused[0] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn weighted_mean_all_zero_reputation_degrades_to_mean() {
        let partials = vec![partial("a", &[2.0], 0.0), partial("b", &[4.0], 0.0)];
        let fused = fuse(&partials, AggregationKind::WeightedMean).unwrap();
        assert_eq!(fused, vec![3.0]);
    }

    #[test]
    fn median_odd_and_even() {
        let odd = vec![
            partial("a", &[1.0], 0.5),
            partial("b", &[9.0], 0.5),
            partial("c", &[3.0], 0.5),
        ];
        assert_eq!(fuse(&odd, AggregationKind::Median).unwrap(), vec![3.0]);

        // Even count takes the lower middle deterministically.
        let even = vec![partial("a", &[1.0], 0.5), partial("b", &[9.0], 0.5)];
        assert_eq!(fuse(&even, AggregationKind::Median).unwrap(), vec![1.0]);
    }

    #[test]
    fn length_mismatch_is_an_error() {
        let partials = vec![partial("a", &[1.0, 2.0], 0.5), partial("b", &[1.0], 0.5)];
        assert!(matches!(
            fuse(&partials, AggregationKind::Mean),
            Err(FailureKind::Internal(_))
        ));
    }

    #[test]
    fn empty_partials_is_quorum_lost() {
        assert!(matches!(
            fuse(&[], AggregationKind::Mean),
            Err(FailureKind::QuorumLost)
        ));
    }

    #[test]
    fn laplace_noise_perturbs_but_stays_near() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut values = vec![3.0; 1000];
        apply_laplace_noise(&mut values, 1.0, 1.0, &mut rng);

        assert!(values.iter().any(|v| (v - 3.0).abs() > 1e-9));
        // Zero-mean noise: the empirical mean stays close to 3.
        let mean: f64 = values.iter().sum::<f64>() / values.len() as f64;
        assert!((mean - 3.0).abs() < 0.2, "mean drifted to {mean}");
    }

    fn vote(model: &str, label: &str, weight: f64) -> Vote {
        Vote {
            model_id: model.into(),
            label: label.into(),
            weight,
        }
    }

    #[test]
    fn majority_picks_most_common_label() {
        let votes = vec![vote("m1", "X", 0.5), vote("m2", "X", 0.5), vote("m3", "Y", 0.5)];
        let outcome = combine_votes(&votes, ConsensusKind::Majority, 0.0).unwrap();
        assert_eq!(outcome.label, "X");
        assert!((outcome.share - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn majority_tie_is_no_consensus() {
        let votes = vec![vote("m1", "X", 0.5), vote("m2", "Y", 0.5)];
        assert!(matches!(
            combine_votes(&votes, ConsensusKind::Majority, 0.0),
            Err(FailureKind::NoConsensus)
        ));
    }

    #[test]
    fn weighted_consensus_meets_threshold() {
        // X: 0.9 + 0.2 = 1.1, Y: 0.8; share of X = 1.1/1.9 ≈ 0.579.
        let votes = vec![vote("m1", "X", 0.9), vote("m2", "X", 0.2), vote("m3", "Y", 0.8)];
        let outcome = combine_votes(&votes, ConsensusKind::Weighted, 0.5).unwrap();
        assert_eq!(outcome.label, "X");
        assert!((outcome.share - 1.1 / 1.9).abs() < 1e-12);
    }

    #[test]
    fn weighted_below_threshold_is_no_consensus() {
        let votes = vec![vote("m1", "X", 0.5), vote("m2", "Y", 0.5)];
        assert!(matches!(
            combine_votes(&votes, ConsensusKind::Weighted, 0.6),
            Err(FailureKind::NoConsensus)
        ));
    }

    #[test]
    fn review_below_threshold_requires_review() {
        let votes = vec![vote("m1", "X", 0.5), vote("m2", "Y", 0.5)];
        assert!(matches!(
            combine_votes(&votes, ConsensusKind::Review, 0.6),
            Err(FailureKind::ReviewRequired)
        ));
    }

    #[test]
    fn no_votes_is_no_consensus() {
        assert!(matches!(
            combine_votes(&[], ConsensusKind::Majority, 0.5),
            Err(FailureKind::NoConsensus)
        ));
    }
}

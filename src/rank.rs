use std::cmp::Ordering;

use uuid::Uuid;

use crate::aggregate;
use crate::error::EngineError;
use crate::models::{
    CandidateAggregate, Leaderboard, Phase, PhaseAggregates, PhaseWeights, RankedCandidate,
};
use crate::settings::resolve_settings;
use crate::store::RatingRepository;

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// `None` while any phase is still missing.
pub fn composite_score(phases: &PhaseAggregates, weights: &PhaseWeights) -> Option<f64> {
    let mut total = 0.0;
    for phase in Phase::ALL {
        total += phases.get(phase).average? * weights.weight(phase);
    }
    Some(round2(total))
}

pub fn consistency(phases: &PhaseAggregates) -> Option<u32> {
    let total = phases.total_raw();
    if total == 0 {
        return None;
    }
    let kept = total - phases.total_outliers();
    Some(((kept as f64 / total as f64) * 100.0).round() as u32)
}

/// Highest composite first. Ties and pending candidates keep incoming order.
pub fn rank(
    aggregates: Vec<CandidateAggregate>,
    weights: &PhaseWeights,
    top_n: u32,
) -> Vec<RankedCandidate> {
    let mut scored: Vec<(CandidateAggregate, Option<f64>)> = aggregates
        .into_iter()
        .map(|aggregate| {
            let composite = composite_score(&aggregate.phases, weights);
            (aggregate, composite)
        })
        .collect();

    scored.sort_by(|(_, a), (_, b)| match (a, b) {
        (Some(a), Some(b)) => b.total_cmp(a),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    });

    scored
        .into_iter()
        .enumerate()
        .map(|(index, (aggregate, composite))| RankedCandidate {
            rank: index + 1,
            consistency: consistency(&aggregate.phases),
            highlighted: composite.is_some() && index < top_n as usize,
            candidate: aggregate.candidate,
            phases: aggregate.phases,
            composite,
        })
        .collect()
}

pub async fn leaderboard<R>(repo: &R, cohort_id: Uuid) -> Result<Leaderboard, EngineError>
where
    R: RatingRepository + ?Sized,
{
    let settings = resolve_settings(repo, cohort_id).await?;
    let aggregates = aggregate::aggregate(repo, cohort_id, settings.outlier_std_devs).await?;
    let entries = rank(aggregates, &settings.weights, settings.top_n_display);
    Ok(Leaderboard {
        cohort_id,
        settings,
        entries,
    })
}

//! Offload decisions
//!
//! Pure ranking functions over what a node knows locally. Figures for other
//! nodes may be one propagation interval old, so nothing here assumes they
//! are exact.

use ermes_common::{
    BestOffloadTargetsOptions, GeoCoordinates, NodeId, OffloadCriterion, SessionId,
    SessionInfoForOffloadDecision,
};
use ermes_topology::Node;
use std::cmp::Ordering;

/// A node that could receive sessions, with the load of its subtree
#[derive(Clone, Debug, PartialEq)]
pub struct TargetCandidate {
    pub node: Node,
    /// Usage over capacity of the node's subtree
    pub load: f64,
}

fn session_size(info: &SessionInfoForOffloadDecision, dimension: Option<&str>) -> f64 {
    match dimension {
        Some(dimension) => info.resources_usage.get(dimension),
        None => info.resources_usage.dimensions().map(|(_, v)| v).sum(),
    }
}

fn client_distance(info: &SessionInfoForOffloadDecision, here: Option<&GeoCoordinates>) -> f64 {
    match (info.client_geo_coordinates.as_ref(), here) {
        (Some(client), Some(here)) => client.distance_km(here),
        _ => 0.0,
    }
}

/// Divide by the largest value so each factor weighs at most 1
fn normalized(value: f64, max: f64) -> f64 {
    if max > 0.0 { value / max } else { 0.0 }
}

/// Rank local sessions as offload candidates, best first.
///
/// Idle time, size and distance of the client from this node each count
/// for up to one point; ties go to the smaller id. At most
/// `options.max_sessions` are returned.
#[must_use]
pub fn rank_sessions(
    candidates: Vec<SessionInfoForOffloadDecision>,
    here: Option<GeoCoordinates>,
    options: &BestOffloadTargetsOptions,
) -> Vec<SessionInfoForOffloadDecision> {
    let dimension = options.size_dimension.as_deref();
    #[allow(clippy::cast_precision_loss)]
    let idle = |info: &SessionInfoForOffloadDecision| info.idle_ms as f64;
    let size = |info: &SessionInfoForOffloadDecision| session_size(info, dimension);
    let distance = |info: &SessionInfoForOffloadDecision| client_distance(info, here.as_ref());

    let max_idle = candidates.iter().map(idle).fold(0.0, f64::max);
    let max_size = candidates.iter().map(size).fold(0.0, f64::max);
    let max_distance = candidates.iter().map(distance).fold(0.0, f64::max);

    let mut scored: Vec<(f64, SessionInfoForOffloadDecision)> = candidates
        .into_iter()
        .map(|info| {
            let score = normalized(idle(&info), max_idle)
                + normalized(size(&info), max_size)
                + normalized(distance(&info), max_distance);
            (score, info)
        })
        .collect();

    scored.sort_by(|a, b| {
        b.0.partial_cmp(&a.0)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.1.session_id.cmp(&b.1.session_id))
    });
    scored.truncate(options.max_sessions);
    scored.into_iter().map(|(_, info)| info).collect()
}

/// Candidates in the order one criterion prefers them, ties by node id.
/// `None` when the criterion cannot judge this session.
fn order_for<'a>(
    criterion: OffloadCriterion,
    session: &SessionInfoForOffloadDecision,
    eligible: &[&'a TargetCandidate],
) -> Option<Vec<&'a TargetCandidate>> {
    let mut ordered = eligible.to_vec();
    match criterion {
        OffloadCriterion::LeastLoaded => {
            ordered.sort_by(|a, b| {
                a.load
                    .partial_cmp(&b.load)
                    .unwrap_or(Ordering::Equal)
                    .then_with(|| a.node.id.cmp(&b.node.id))
            });
        }
        OffloadCriterion::ClosestToClient => {
            let client = session.client_geo_coordinates?;
            // Nodes with no coordinates go last
            let distance = |c: &TargetCandidate| {
                c.node
                    .geo_coordinates
                    .map_or(f64::INFINITY, |geo| geo.distance_km(&client))
            };
            ordered.sort_by(|a, b| {
                distance(a)
                    .partial_cmp(&distance(b))
                    .unwrap_or(Ordering::Equal)
                    .then_with(|| a.node.id.cmp(&b.node.id))
            });
        }
    }
    Some(ordered)
}

/// Pair sessions with target nodes, in priority order.
///
/// Sessions are taken in the given order; for each one every criterion
/// fills its own slot with up to `options.max_targets_per_session` nodes.
/// Nodes at or above `options.load_threshold` are never proposed. The
/// same (session, node) pair is listed once per slot that names it.
#[must_use]
pub fn rank_targets(
    sessions: &[SessionInfoForOffloadDecision],
    candidates: &[TargetCandidate],
    options: &BestOffloadTargetsOptions,
) -> Vec<(SessionId, NodeId)> {
    let eligible: Vec<&TargetCandidate> = candidates
        .iter()
        .filter(|c| c.load < options.load_threshold)
        .collect();
    if eligible.is_empty() {
        return Vec::new();
    }

    let mut pairs = Vec::new();
    for session in sessions {
        for criterion in &options.criteria {
            let Some(ordered) = order_for(*criterion, session, &eligible) else {
                continue;
            };
            pairs.extend(
                ordered
                    .into_iter()
                    .take(options.max_targets_per_session)
                    .map(|c| (session.session_id.clone(), c.node.id.clone())),
            );
        }
    }
    pairs
}

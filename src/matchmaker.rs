//! Matchmaker Eligibility Gate
//!
//! Decides whether the ladder invite affordance should be shown for the
//! logged-in user, based on the rating boundary tables broadcast in
//! `matchmaker_info`. Evaluated fresh on every message; nothing is memoized.

use serde_json::Value;

use crate::protocol::QueueInfo;

/// Deviations above this suppress the evaluation entirely: the rating is too
/// unconverged to say anything useful.
pub const SUPPRESS_DEVIATION: f64 = 200.0;

/// Deviations below this select the tighter boundary table.
pub const CONVERGED_DEVIATION: f64 = 100.0;

/// The queue the invite affordance is about.
pub const LADDER_QUEUE: &str = "ladder1v1";

/// Events published by the matchmaker gate.
#[derive(Debug, Clone)]
pub enum MatchmakerEvent {
    /// A `matchmaker_info` action message, forwarded verbatim.
    Action(Value),
    /// Whether the invite affordance should be shown.
    Eligibility(bool),
}

/// Boundary table for a queue entry, selected by rating deviation.
fn boundary_table(queue: &QueueInfo, deviation: f64) -> &[(f64, f64)] {
    if deviation < CONVERGED_DEVIATION {
        &queue.boundary_75s
    } else {
        &queue.boundary_80s
    }
}

/// Whether a ladder player with the given rating falls strictly inside any
/// boundary window of the ladder queue.
pub fn is_eligible(queues: &[QueueInfo], ladder_mean: f64, ladder_deviation: f64) -> bool {
    queues
        .iter()
        .filter(|q| q.queue_name == LADDER_QUEUE)
        .any(|q| {
            boundary_table(q, ladder_deviation)
                .iter()
                .any(|(min, max)| *min < ladder_mean && ladder_mean < *max)
        })
}

use crate::{Event, TurnClaims};

/// A crash can persist only a prefix of a turn's schedules, so a resumed
/// replay legitimately appends the missing tail after claiming everything
/// recorded. A replay that appends net-new schedules while a recorded
/// schedule sits unclaimed took a different path than the one persisted.
pub fn detect_frontier_nondeterminism(prior: &[Event], deltas: &[Event], claims: &TurnClaims) -> Option<String> {
    let appended_schedule = deltas.iter().any(|e| matches!(e, Event::ActivityScheduled { .. }));
    if !appended_schedule {
        return None;
    }
    for e in prior {
        if let Event::ActivityScheduled { id, .. } = e {
            if !claims.activities.contains(id) {
                return Some(format!(
                    "nondeterministic: recorded schedule id={id} left unclaimed while new schedules were appended"
                ));
            }
        }
    }
    None
}

/// Every completion appended in the previous batch must correspond to a
/// correlation id the current code actually awaited this turn.
pub fn detect_await_mismatch(last: &[u64], claims: &crate::TurnClaims) -> Option<String> {
    for id in last {
        if !claims.activities.contains(id) {
            return Some(format!(
                "nondeterministic: activity completion id={id} was not awaited this turn"
            ));
        }
    }
    None
}

/// Record the correlation ids of completions appended since `start_idx`.
pub fn collect_last_appended(history: &[Event], start_idx: usize, out: &mut Vec<u64>) {
    for e in &history[start_idx..] {
        match e {
            Event::ActivityCompleted { id, .. } | Event::ActivityFailed { id, .. } => out.push(*id),
            _ => {}
        }
    }
}

/// A completion whose correlation id has no matching schedule in prior
/// history indicates corrupted or foreign state.
pub fn detect_unmatched_completion(prior: &[Event], last: &[u64]) -> Option<String> {
    for id in last {
        let matched = prior
            .iter()
            .any(|e| matches!(e, Event::ActivityScheduled { id: sid, .. } if sid == id));
        if !matched {
            return Some(format!(
                "nondeterministic: completion id={id} has no matching schedule in prior history"
            ));
        }
    }
    None
}

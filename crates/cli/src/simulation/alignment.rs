//! Bilateral alignment: pair leader and follower activations of the same
//! finger by their real firing instant.

use std::collections::BTreeMap;
use std::time::Instant;

use observability::AlignmentAggregator;
use sync_engine::mock::HapticCall;

/// Activation instants per finger, in firing order
fn activations(records: &[(Instant, HapticCall)]) -> BTreeMap<u8, Vec<Instant>> {
    let mut by_finger: BTreeMap<u8, Vec<Instant>> = BTreeMap::new();
    for (at, call) in records {
        if let HapticCall::Activate { finger, amplitude } = *call {
            if amplitude > 0 {
                by_finger.entry(finger).or_default().push(*at);
            }
        }
    }
    for instants in by_finger.values_mut() {
        instants.sort_unstable();
    }
    by_finger
}

/// `a - b` in microseconds
fn signed_diff_us(a: Instant, b: Instant) -> i64 {
    match a.checked_duration_since(b) {
        Some(ahead) => ahead.as_micros() as i64,
        None => -(b.duration_since(a).as_micros() as i64),
    }
}

/// Match activations finger by finger and feed `follower - leader` errors
/// into `aggregator`
///
/// Two activations pair up when they are at most `window_us` apart;
/// everything left over is counted as unmatched.
pub fn align(
    leader: &[(Instant, HapticCall)],
    follower: &[(Instant, HapticCall)],
    window_us: u64,
    aggregator: &mut AlignmentAggregator,
) {
    let leader = activations(leader);
    let mut follower = activations(follower);
    let window = window_us as i64;

    for (finger, leader_at) in &leader {
        let follower_at = follower.remove(finger).unwrap_or_default();
        let (mut i, mut j) = (0, 0);
        let mut unmatched = 0u64;

        while i < leader_at.len() && j < follower_at.len() {
            let error = signed_diff_us(follower_at[j], leader_at[i]);
            if error.abs() <= window {
                aggregator.push(error);
                i += 1;
                j += 1;
            } else if error < 0 {
                unmatched += 1;
                j += 1;
            } else {
                unmatched += 1;
                i += 1;
            }
        }
        unmatched += (leader_at.len() - i + follower_at.len() - j) as u64;
        aggregator.add_unmatched(unmatched);
    }

    // fingers only the follower fired
    let orphans: usize = follower.values().map(Vec::len).sum();
    aggregator.add_unmatched(orphans as u64);
}

use std::time::Duration;

/// Reconnect delays in ms: immediate first retry, doubling, capped at 30 s.
pub const BACKOFF_SCHEDULE_MS: [u64; 7] = [0, 1_000, 2_000, 4_000, 8_000, 16_000, 30_000];

/// Delay before reconnect attempt `attempt` (0-based); holds at the last entry.
pub fn reconnect_delay(attempt: u32) -> Duration {
    let idx = (attempt as usize).min(BACKOFF_SCHEDULE_MS.len() - 1);
    Duration::from_millis(BACKOFF_SCHEDULE_MS[idx])
}

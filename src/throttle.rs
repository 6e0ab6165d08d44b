//! Token-bucket pacer (§4.6): gates outbound video bytes to the congestion controller's
//! current burst bitrate and assigns `group_id`s to pacing bursts.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::config::THROTTLER_BUCKET_MS;

struct State {
    burst_bitrate_bps: u64,
    credit_bits: f64,
    last_refill: Instant,
    current_group_id: u32,
    group_epoch_start: Instant,
}

/// Epoch width: calls landing within this window of each other share a `group_id`.
const GROUP_EPOCH: Duration = Duration::from_millis(THROTTLER_BUCKET_MS as u64);

pub struct Throttler {
    state: Mutex<State>,
    credit_available: Condvar,
}

impl Throttler {
    pub fn new(burst_bitrate_bps: u64) -> Self {
        let now = Instant::now();
        Throttler {
            state: Mutex::new(State {
                burst_bitrate_bps,
                credit_bits: 0.0,
                last_refill: now,
                current_group_id: 0,
                group_epoch_start: now,
            }),
            credit_available: Condvar::new(),
        }
    }

    pub fn set_burst_bitrate(&self, burst_bitrate_bps: u64) {
        self.state.lock().burst_bitrate_bps = burst_bitrate_bps;
    }

    fn refill_locked(state: &mut State) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.credit_bits += elapsed * state.burst_bitrate_bps as f64;
        let bucket_capacity_bits = state.burst_bitrate_bps as f64 * (THROTTLER_BUCKET_MS / 1000.0);
        state.credit_bits = state.credit_bits.min(bucket_capacity_bits);
        state.last_refill = now;
    }

    /// Blocks until at least `bytes * 8` bits of credit are available, subtracts them, and
    /// returns the `group_id` for this send. Only video calls this; audio bypasses it.
    pub fn wait_for_allocation(&self, bytes: usize) -> u32 {
        let needed_bits = bytes as f64 * 8.0;
        let mut state = self.state.lock();
        loop {
            Self::refill_locked(&mut state);
            if state.credit_bits >= needed_bits {
                state.credit_bits -= needed_bits;
                break;
            }
            let bucket_capacity_bits = state.burst_bitrate_bps as f64 * (THROTTLER_BUCKET_MS / 1000.0);
            let deficit_bits = needed_bits - state.credit_bits;
            let wait = Duration::from_secs_f64((deficit_bits / state.burst_bitrate_bps.max(1) as f64).max(0.0))
                .min(Duration::from_millis(THROTTLER_BUCKET_MS as u64).max(Duration::from_micros(1)))
                .max(Duration::from_micros(100));
            let _ = bucket_capacity_bits;
            self.credit_available.wait_for(&mut state, wait);
        }

        let now = Instant::now();
        if now.duration_since(state.group_epoch_start) >= GROUP_EPOCH {
            state.current_group_id = state.current_group_id.wrapping_add(1);
            state.group_epoch_start = now;
        }
        state.current_group_id
    }

    /// Charge the throttler again for the extra bytes AES-GCM's tag/padding add after
    /// encryption, so the pacing bound (§8 property 5) still holds.
    pub fn charge_encryption_overhead(&self, extra_bytes: usize) {
        if extra_bytes == 0 {
            return;
        }
        let mut state = self.state.lock();
        Self::refill_locked(&mut state);
        state.credit_bits -= extra_bytes as f64 * 8.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_sends_within_budget_do_not_block() {
        let throttler = Throttler::new(100_000_000);
        let start = Instant::now();
        for _ in 0..5 {
            throttler.wait_for_allocation(1000);
        }
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn group_id_advances_across_epochs() {
        let throttler = Throttler::new(1_000_000_000);
        let first = throttler.wait_for_allocation(10);
        std::thread::sleep(GROUP_EPOCH + Duration::from_millis(1));
        let second = throttler.wait_for_allocation(10);
        assert_ne!(first, second);
    }

    #[test]
    fn exhausted_bucket_forces_a_wait() {
        let throttler = Throttler::new(8_000); // 1000 bytes/s
        throttler.wait_for_allocation(10); // drain initial credit
        let start = Instant::now();
        throttler.wait_for_allocation(2000); // needs far more than one bucket's credit
        assert!(start.elapsed() >= Duration::from_millis(50));
    }
}

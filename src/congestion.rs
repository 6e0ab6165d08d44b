//! The congestion controller: a pure function over the last few group-transition
//! statistics (§4.5, §9 "coroutine-free"). No callbacks, no internal timer thread —
//! callers feed it group-arrival events and read back the current verdict.

use crate::config::{NetworkSettings, MAX_FEC_RATIO, MAX_GROUP_STATS};

/// One pacing burst's departure/arrival pair, as observed by the receiver.
#[derive(Debug, Clone, Copy)]
pub struct GroupStats {
    pub group_id: u32,
    pub departure_time_us: u64,
    pub arrival_time_us: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DelayClass {
    Overuse,
    Normal,
    Underuse,
}

/// Small circular history of recent groups, keyed by `group_id mod MAX_GROUP_STATS`, plus the
/// incoming-bitrate sliding window and loss-ratio accumulator that feed the control law.
pub struct CongestionController {
    groups: [Option<GroupStats>; MAX_GROUP_STATS],
    current_group_id: Option<u32>,
    delay_gradient_ewma: f64,
    bitrate_window: BitrateWindow,
    settings: NetworkSettings,
    audio_reserved_bps: u64,
}

impl CongestionController {
    pub fn new(initial: NetworkSettings, audio_reserved_bps: u64) -> Self {
        CongestionController {
            groups: [None; MAX_GROUP_STATS],
            current_group_id: None,
            delay_gradient_ewma: 0.0,
            bitrate_window: BitrateWindow::new(),
            settings: initial,
            audio_reserved_bps,
        }
    }

    pub fn current_settings(&self) -> NetworkSettings {
        self.settings
    }

    /// Feed one delivered non-nack non-duplicate video segment's group stats. Acts only when
    /// `group_id` is a strictly-new current group (§5 ordering guarantee); returns the updated
    /// settings if they changed from before this call, `None` otherwise.
    pub fn on_group_arrival(&mut self, stats: GroupStats, now_us: u64, loss_ratio: f64) -> Option<NetworkSettings> {
        self.bitrate_window.record(now_us, stats.bytes * 8);

        let slot = (stats.group_id as usize) % MAX_GROUP_STATS;
        let is_new_current = match self.current_group_id {
            None => true,
            Some(curr) => stats.group_id > curr,
        };
        if !is_new_current {
            // Stale or duplicate group report; still useful for the bitrate window above.
            self.groups[slot] = Some(stats);
            return None;
        }

        let prev = self.current_group_id.and_then(|curr| self.groups[(curr as usize) % MAX_GROUP_STATS]);
        self.groups[slot] = Some(stats);
        self.current_group_id = Some(stats.group_id);

        let prev = match prev {
            Some(p) => p,
            None => return None, // first group ever: no gradient yet
        };

        let delay_gradient = (stats.arrival_time_us as i64 - prev.arrival_time_us as i64)
            - (stats.departure_time_us as i64 - prev.departure_time_us as i64);
        self.delay_gradient_ewma = 0.8 * self.delay_gradient_ewma + 0.2 * delay_gradient as f64;

        let class = classify(self.delay_gradient_ewma);
        let incoming_bps = self.bitrate_window.estimate_bps(now_us);

        let before = self.settings;
        self.settings = apply_control_law(before, class, loss_ratio, incoming_bps, self.audio_reserved_bps);

        if self.settings != before {
            Some(self.settings)
        } else {
            None
        }
    }
}

fn classify(gradient_ewma: f64) -> DelayClass {
    const THRESHOLD_US: f64 = 1500.0;
    if gradient_ewma > THRESHOLD_US {
        DelayClass::Overuse
    } else if gradient_ewma < -THRESHOLD_US {
        DelayClass::Underuse
    } else {
        DelayClass::Normal
    }
}

/// AIMD on normal, multiplicative decrease on overuse or high loss, slow additive increase on
/// underuse — the control law named but left unspecified by §4.5/§9 (kept in its own function
/// so it can be swapped without touching the group-history bookkeeping above).
fn apply_control_law(
    current: NetworkSettings,
    class: DelayClass,
    loss_ratio: f64,
    incoming_bps: u64,
    audio_reserved_bps: u64,
) -> NetworkSettings {
    const HIGH_LOSS_THRESHOLD: f64 = 0.1;
    const MULTIPLICATIVE_DECREASE: f64 = 0.85;
    const ADDITIVE_INCREASE_BPS: u64 = 500_000;
    const MIN_BITRATE_BPS: u64 = 1_000_000;
    const MAX_BITRATE_BPS: u64 = 50_000_000;

    let mut bitrate = current.bitrate_bps;

    if loss_ratio > HIGH_LOSS_THRESHOLD || class == DelayClass::Overuse {
        let target = (bitrate as f64 * MULTIPLICATIVE_DECREASE) as u64;
        bitrate = target.min(incoming_bps.max(MIN_BITRATE_BPS));
    } else if class == DelayClass::Underuse {
        bitrate = bitrate.saturating_add(ADDITIVE_INCREASE_BPS / 4);
    } else {
        bitrate = bitrate.saturating_add(ADDITIVE_INCREASE_BPS);
    }
    bitrate = bitrate.clamp(MIN_BITRATE_BPS, MAX_BITRATE_BPS);

    let video_fec_ratio = if loss_ratio > 0.02 {
        (loss_ratio * 2.0).min(MAX_FEC_RATIO)
    } else {
        0.0
    };

    NetworkSettings {
        bitrate_bps: bitrate,
        burst_bitrate_bps: bitrate + bitrate / 5 + audio_reserved_bps,
        audio_fec_ratio: current.audio_fec_ratio,
        video_fec_ratio,
    }
}

/// Sliding-window incoming-bitrate estimator: `INCOMING_BITRATE_NUM_BUCKETS` buckets of
/// `DURATION_PER_BUCKET_MS` ms each, each accumulating bits of arrivals timestamped within it.
struct BitrateWindow {
    buckets: [u64; crate::config::INCOMING_BITRATE_NUM_BUCKETS as usize],
    bucket_start_us: [u64; crate::config::INCOMING_BITRATE_NUM_BUCKETS as usize],
}

impl BitrateWindow {
    fn new() -> Self {
        BitrateWindow {
            buckets: [0; crate::config::INCOMING_BITRATE_NUM_BUCKETS as usize],
            bucket_start_us: [0; crate::config::INCOMING_BITRATE_NUM_BUCKETS as usize],
        }
    }

    fn bucket_index(&self, now_us: u64) -> usize {
        let bucket_duration_us = crate::config::DURATION_PER_BUCKET_MS * 1000;
        ((now_us / bucket_duration_us) % crate::config::INCOMING_BITRATE_NUM_BUCKETS) as usize
    }

    fn record(&mut self, now_us: u64, bits: u64) {
        let bucket_duration_us = crate::config::DURATION_PER_BUCKET_MS * 1000;
        let idx = self.bucket_index(now_us);
        let bucket_start = (now_us / bucket_duration_us) * bucket_duration_us;
        if self.bucket_start_us[idx] != bucket_start {
            self.buckets[idx] = 0;
            self.bucket_start_us[idx] = bucket_start;
        }
        self.buckets[idx] += bits;
    }

    fn estimate_bps(&mut self, now_us: u64) -> u64 {
        let bucket_duration_us = crate::config::DURATION_PER_BUCKET_MS * 1000;
        let current_bucket_start = (now_us / bucket_duration_us) * bucket_duration_us;
        let mut total_bits = 0u64;
        for i in 0..self.buckets.len() {
            let age = current_bucket_start.saturating_sub(self.bucket_start_us[i]);
            if age < crate::config::INCOMING_BITRATE_WINDOW_MS * 1000 {
                total_bits += self.buckets[i];
            }
        }
        total_bits * 1000 / crate::config::INCOMING_BITRATE_WINDOW_MS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_group_never_changes_settings() {
        let mut cc = CongestionController::new(NetworkSettings::default(), 0);
        let changed = cc.on_group_arrival(
            GroupStats { group_id: 1, departure_time_us: 0, arrival_time_us: 5000, bytes: 1000 },
            5000,
            0.0,
        );
        assert!(changed.is_none());
    }

    #[test]
    fn sustained_high_loss_reduces_bitrate() {
        let mut cc = CongestionController::new(NetworkSettings::default(), 0);
        let mut now = 0u64;
        let starting = cc.current_settings().bitrate_bps;
        for i in 1..20u32 {
            now += 16_000;
            cc.on_group_arrival(
                GroupStats { group_id: i, departure_time_us: now, arrival_time_us: now + 5000, bytes: 2000 },
                now,
                0.3,
            );
        }
        assert!(cc.current_settings().bitrate_bps < starting);
    }

    #[test]
    fn stale_group_id_is_ignored() {
        let mut cc = CongestionController::new(NetworkSettings::default(), 0);
        cc.on_group_arrival(
            GroupStats { group_id: 5, departure_time_us: 0, arrival_time_us: 1000, bytes: 100 },
            1000,
            0.0,
        );
        let changed = cc.on_group_arrival(
            GroupStats { group_id: 3, departure_time_us: 0, arrival_time_us: 1500, bytes: 100 },
            1500,
            0.0,
        );
        assert!(changed.is_none());
    }
}

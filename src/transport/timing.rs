//! Protocol clock and heartbeat bookkeeping.
//!
//! Heartbeat timestamps are hundredths of a second on a wrapping 32-bit
//! counter local to each peer, so only differences between values from
//! the same clock are meaningful.

use std::time::{Duration, Instant};

/// Length of one clock tick.
pub const TICK: Duration = Duration::from_millis(10);

/// Smoothing factor for the round-trip average (1/8, as in RFC 6298).
const SRTT_ALPHA: f64 = 0.125;

/// Wrapping centisecond clock started when a connection is created.
#[derive(Debug, Clone, Copy)]
pub struct TransportClock {
    epoch: Instant,
}

impl Default for TransportClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportClock {
    /// Clock reading zero now.
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    /// Current reading.
    pub fn now(&self) -> u32 {
        self.at(Instant::now())
    }

    /// Reading at `instant`.
    pub fn at(&self, instant: Instant) -> u32 {
        let elapsed = instant.saturating_duration_since(self.epoch);
        (elapsed.as_millis() / TICK.as_millis()) as u32
    }
}

/// One answered heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatSample {
    /// Our clock when the probe left, as echoed by the peer.
    pub echoed_time: u32,
    /// Peer's clock when it answered.
    pub peer_time: u32,
    /// Our clock when the answer arrived.
    pub received_at: u32,
}

impl HeartbeatSample {
    /// Probe round trip.
    pub fn round_trip(&self) -> Duration {
        TICK * self.received_at.wrapping_sub(self.echoed_time)
    }

    /// Estimated peer clock minus local clock, in ticks, assuming a
    /// symmetric path.
    pub fn clock_offset(&self) -> i64 {
        let half_trip = self.received_at.wrapping_sub(self.echoed_time) / 2;
        let local_at_answer = self.echoed_time.wrapping_add(half_trip);
        self.peer_time.wrapping_sub(local_at_answer) as i32 as i64
    }
}

/// Latest heartbeat answer plus a smoothed round trip.
#[derive(Debug, Clone, Default)]
pub struct HeartbeatTracker {
    last: Option<HeartbeatSample>,
    srtt_ms: Option<f64>,
    probes_sent: u64,
}

impl HeartbeatTracker {
    /// Count an outgoing probe.
    pub fn on_probe(&mut self) {
        self.probes_sent += 1;
    }

    /// Fold in an answer.
    pub fn on_response(&mut self, sample: HeartbeatSample) {
        let rtt = sample.round_trip().as_secs_f64() * 1000.0;
        self.srtt_ms = Some(match self.srtt_ms {
            None => rtt,
            Some(srtt) => (1.0 - SRTT_ALPHA) * srtt + SRTT_ALPHA * rtt,
        });
        self.last = Some(sample);
    }

    /// Most recent answer.
    pub fn last(&self) -> Option<HeartbeatSample> {
        self.last
    }

    /// Smoothed round trip, once any answer has arrived.
    pub fn smoothed_rtt(&self) -> Option<Duration> {
        self.srtt_ms.map(|ms| Duration::from_secs_f64(ms / 1000.0))
    }

    /// Probes sent so far.
    pub fn probes_sent(&self) -> u64 {
        self.probes_sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_ticks() {
        let clock = TransportClock::new();
        let later = clock.epoch + Duration::from_millis(1234);
        assert_eq!(clock.at(later), 123);
        assert_eq!(clock.at(clock.epoch), 0);
    }

    #[test]
    fn test_sample_round_trip() {
        let sample = HeartbeatSample {
            echoed_time: 100,
            peer_time: 5000,
            received_at: 112,
        };
        assert_eq!(sample.round_trip(), Duration::from_millis(120));
        assert_eq!(sample.clock_offset(), 5000 - 106);
    }

    #[test]
    fn test_sample_wraps() {
        let sample = HeartbeatSample {
            echoed_time: u32::MAX - 1,
            peer_time: 10,
            received_at: 2,
        };
        assert_eq!(sample.round_trip(), Duration::from_millis(40));
        assert_eq!(sample.clock_offset(), 10);
    }

    #[test]
    fn test_tracker_smoothing() {
        let mut tracker = HeartbeatTracker::default();
        assert!(tracker.smoothed_rtt().is_none());

        let sample = |rtt: u32| HeartbeatSample {
            echoed_time: 0,
            peer_time: 0,
            received_at: rtt,
        };
        tracker.on_response(sample(10));
        assert_eq!(tracker.smoothed_rtt(), Some(Duration::from_millis(100)));

        tracker.on_response(sample(18));
        let srtt = tracker.smoothed_rtt().unwrap().as_millis();
        assert!((109..=110).contains(&srtt));
        assert_eq!(tracker.last(), Some(sample(18)));
    }
}

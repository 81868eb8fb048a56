use parking_lot::Mutex;
use tracing::{info, warn};

use crate::core::Availability;

/// Mutable tracker state
#[derive(Debug)]
struct TrackerState {
    /// Current liveness
    availability: Availability,
    /// Heartbeats sent since the last datagram arrived
    missed_heartbeats: u32,
}

/// Infers gateway liveness from received traffic and heartbeat probes.
///
/// Sending probes and judging them run on separate cadences so that one lost
/// datagram does not flap availability. Every mutator returns the new state
/// only when it differs from the old one.
#[derive(Debug)]
pub struct AvailabilityTracker {
    state: Mutex<TrackerState>,
    threshold: u32,
}

impl AvailabilityTracker {
    /// Creates a tracker that starts available and gives up after more than
    /// `threshold` unanswered heartbeats
    pub fn new(threshold: u32) -> Self {
        AvailabilityTracker {
            state: Mutex::new(TrackerState {
                availability: Availability::Available,
                missed_heartbeats: 0,
            }),
            threshold,
        }
    }

    /// Current liveness
    pub fn current(&self) -> Availability {
        self.state.lock().availability
    }

    /// Shorthand for `current().is_available()`
    pub fn is_available(&self) -> bool {
        self.current().is_available()
    }

    /// Heartbeats sent since the last datagram arrived
    pub fn missed_heartbeats(&self) -> u32 {
        self.state.lock().missed_heartbeats
    }

    /// A datagram arrived
    pub fn record_receive(&self) -> Option<Availability> {
        let mut state = self.state.lock();
        state.missed_heartbeats = 0;
        Self::transition(&mut state, Availability::Available)
    }

    /// A heartbeat probe was queued; returns the updated miss count
    pub fn record_probe_sent(&self) -> u32 {
        let mut state = self.state.lock();
        state.missed_heartbeats = state.missed_heartbeats.saturating_add(1);
        state.missed_heartbeats
    }

    /// Periodic judgement of the miss count
    pub fn evaluate(&self) -> Option<Availability> {
        let mut state = self.state.lock();
        if state.missed_heartbeats > self.threshold {
            Self::transition(&mut state, Availability::Unavailable)
        } else {
            None
        }
    }

    /// Forces the gateway unavailable, e.g. when the start-up probe fails
    pub fn mark_unavailable(&self) -> Option<Availability> {
        let mut state = self.state.lock();
        Self::transition(&mut state, Availability::Unavailable)
    }

    fn transition(state: &mut TrackerState, next: Availability) -> Option<Availability> {
        if state.availability == next {
            return None;
        }
        state.availability = next;
        match next {
            Availability::Available => info!("Gateway is available"),
            Availability::Unavailable => {
                warn!(missed = state.missed_heartbeats, "Gateway is unavailable")
            }
        }
        Some(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_available() {
        let tracker = AvailabilityTracker::new(2);
        assert!(tracker.is_available());
        assert_eq!(tracker.missed_heartbeats(), 0);
        assert_eq!(tracker.record_receive(), None);
    }

    #[test]
    fn test_tolerates_threshold_misses() {
        let tracker = AvailabilityTracker::new(2);
        tracker.record_probe_sent();
        tracker.record_probe_sent();
        assert_eq!(tracker.evaluate(), None);
        assert!(tracker.is_available());
    }

    #[test]
    fn test_edge_triggered_transitions() {
        let tracker = AvailabilityTracker::new(2);
        for _ in 0..3 {
            tracker.record_probe_sent();
        }
        assert_eq!(tracker.evaluate(), Some(Availability::Unavailable));

        // Further misses and evaluations stay quiet
        tracker.record_probe_sent();
        assert_eq!(tracker.evaluate(), None);

        assert_eq!(tracker.record_receive(), Some(Availability::Available));
        assert_eq!(tracker.missed_heartbeats(), 0);
        assert_eq!(tracker.record_receive(), None);
    }

    #[test]
    fn test_mark_unavailable() {
        let tracker = AvailabilityTracker::new(2);
        assert_eq!(tracker.mark_unavailable(), Some(Availability::Unavailable));
        assert_eq!(tracker.mark_unavailable(), None);
        assert_eq!(tracker.current(), Availability::Unavailable);
    }
}

//! Transport/timebase mapping and segment-owner election (§4.H).

use std::sync::atomic::Ordering;

use jackshim_proto::pod::{Activation, Segment, TransportState, SEGMENT_BAR_VALID, SEGMENT_LOOPING, TICKS_PER_BEAT};

/// User-facing decoded transport state, folding the segment's looping flag
/// into the raw wire state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodedTransport {
    Stopped,
    Starting,
    Rolling,
    Looping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bbt {
    pub bar: i32,
    pub beat: i32,
    pub tick: i32,
    pub bpm: f64,
    pub beats_per_bar: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionInfo {
    pub state: DecodedTransport,
    pub frame: u64,
    pub frame_rate: u32,
    pub usecs: u64,
}

/// Decode frame/usecs/state from the driver's clock and active segment
/// (§4.H "Position decode").
pub fn decode_position(activation: &Activation) -> PositionInfo {
    let clock = &activation.position.clock;
    let seg = &activation.position.segment;

    let usecs = clock.nsec / 1000;
    let running = clock.position;

    let within_segment = running >= seg.start && (seg.duration == 0 || running < seg.start.saturating_add(seg.duration));
    let frame = if within_segment {
        let rel = (running - seg.start) as f64;
        seg.position + (rel * seg.rate) as u64
    } else {
        seg.position
    };

    let raw_state = activation.position.transport_state();
    let looping = seg.flags & SEGMENT_LOOPING != 0;
    let state = match raw_state {
        TransportState::Stopped => DecodedTransport::Stopped,
        TransportState::Starting => DecodedTransport::Starting,
        TransportState::Running if looping => DecodedTransport::Looping,
        TransportState::Running => DecodedTransport::Rolling,
    };

    PositionInfo { state, frame, frame_rate: clock.rate_denom, usecs }
}

/// Decode bar/beat/tick, only meaningful when this node owns the segment
/// and the segment's bar info is marked valid.
pub fn decode_bbt(seg: &Segment, is_owner: bool) -> Option<Bbt> {
    if !is_owner || seg.flags & SEGMENT_BAR_VALID == 0 {
        return None;
    }
    let beats_per_bar = seg.beats_per_bar.max(1) as f64;
    let total_beats = seg.bar_offset + seg.bar_beat;
    let bar = (total_beats / beats_per_bar).floor() as i32 + 1;
    let beat_in_bar = total_beats.rem_euclid(beats_per_bar);
    let beat = beat_in_bar.floor() as i32 + 1;
    let tick = ((beat_in_bar.fract()) * TICKS_PER_BEAT as f64).round() as i32;
    Some(Bbt { bar, beat, tick, bpm: seg.bpm, beats_per_bar: beats_per_bar as f32 })
}

#[derive(Debug, thiserror::Error)]
pub enum TimebaseError {
    #[error("another node already owns the timebase")]
    Busy,
    #[error("this node does not own the timebase")]
    NotOwner,
}

/// Attempt to become the timebase/segment owner.
///
/// `conditional = true` fails with [`TimebaseError::Busy`] if another node
/// already owns it — re-acquiring by the current owner succeeds, it is not
/// a conflict; `conditional = false` always takes ownership.
pub fn acquire_timebase(activation: &Activation, node_id: u32, conditional: bool) -> Result<(), TimebaseError> {
    let owner = &activation.position_owner_slot();
    if conditional {
        match owner.compare_exchange(0, node_id, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => Ok(()),
            Err(current) if current == node_id => Ok(()),
            Err(_) => Err(TimebaseError::Busy),
        }
    } else {
        owner.store(node_id, Ordering::Release);
        Ok(())
    }
}

pub fn release_timebase(activation: &Activation, node_id: u32) -> Result<(), TimebaseError> {
    let owner = &activation.position_owner_slot();
    owner
        .compare_exchange(node_id, 0, Ordering::AcqRel, Ordering::Acquire)
        .map(|_| ())
        .map_err(|_| TimebaseError::NotOwner)
}

pub fn is_segment_owner(activation: &Activation, node_id: u32) -> bool {
    activation.segment_owner[0].load(Ordering::Acquire) == node_id
}

/// Request a reposition: the server observes `reposition_owner` and
/// `reposition_frame` atomically.
pub fn request_reposition(activation: &Activation, node_id: u32, frame: u64) {
    activation.reposition_frame.store(frame, Ordering::Release);
    activation.reposition_owner.store(node_id, Ordering::Release);
}

trait SegmentOwnerSlot {
    fn position_owner_slot(&self) -> &std::sync::atomic::AtomicU32;
}

impl SegmentOwnerSlot for Activation {
    fn position_owner_slot(&self) -> &std::sync::atomic::AtomicU32 {
        &self.segment_owner[0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jackshim_proto::pod::{Clock, NodeActivationState, Position};
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU32, AtomicU64};

    fn fresh_activation() -> Activation {
        Activation {
            status: AtomicU32::new(0),
            pending_sync: AtomicU32::new(0),
            pending_new_pos: AtomicU32::new(0),
            awake_time: AtomicI64::new(0),
            finish_time: AtomicI64::new(0),
            signal_time: AtomicI64::new(0),
            segment_owner: [AtomicU32::new(0)],
            reposition_owner: AtomicU32::new(0),
            reposition_frame: AtomicU64::new(0),
            command: AtomicU32::new(0),
            xrun_count: AtomicU32::new(0),
            cpu_load: [AtomicU32::new(0), AtomicU32::new(0), AtomicU32::new(0)],
            states: [NodeActivationState { required: AtomicI32::new(0), pending: AtomicI32::new(0) }],
            position: Position {
                clock: Clock { nsec: 0, rate_num: 1, rate_denom: 48000, position: 48000, duration: 0, delay: 0, rate_diff: 1.0, id: 1, _pad: 0 },
                segment: Segment { start: 0, duration: 0, position: 0, rate: 1.0, flags: 0, beats_per_bar: 4, signature_denom: 4, _pad: 0, bpm: 120.0, bar_offset: 0.0, bar_beat: 0.0 },
                state: AtomicU32::new(TransportState::Running as u32),
            },
        }
    }

    #[test]
    fn decodes_rolling_transport_with_exact_frame() {
        let act = fresh_activation();
        let pos = decode_position(&act);
        assert_eq!(pos.state, DecodedTransport::Rolling);
        assert_eq!(pos.frame, 48000);
        assert_eq!(pos.frame_rate, 48000);
    }

    #[test]
    fn timebase_election_contested() {
        let act = fresh_activation();
        assert!(acquire_timebase(&act, 1, true).is_ok());
        assert!(matches!(acquire_timebase(&act, 2, true), Err(TimebaseError::Busy)));
        assert!(release_timebase(&act, 1).is_ok());
        assert!(acquire_timebase(&act, 2, true).is_ok());
    }

    proptest! {
        /// Whatever sequence of conditional acquires two nodes attempt, the
        /// slot only ever holds 0 or one of the two node ids, and a node
        /// re-acquiring its own ownership always succeeds rather than
        /// observing itself as contention.
        #[test]
        fn owner_cas_never_admits_a_third_owner(attempts in proptest::collection::vec(1u32..=2, 1..32)) {
            let act = fresh_activation();
            let mut owner: u32 = 0;
            for node in attempts {
                match acquire_timebase(&act, node, true) {
                    Ok(()) => {
                        prop_assert!(owner == 0 || owner == node);
                        owner = node;
                    }
                    Err(TimebaseError::Busy) => {
                        prop_assert!(owner != 0 && owner != node);
                    }
                    Err(TimebaseError::NotOwner) => unreachable!("acquire never returns NotOwner"),
                }
                prop_assert_eq!(act.segment_owner[0].load(Ordering::Acquire), owner);
            }
        }
    }
}

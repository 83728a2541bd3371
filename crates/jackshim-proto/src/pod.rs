//! Shared-memory layouts written jointly by this client and the graph
//! server. These are `#[repr(C)]` so their byte layout is exactly what the
//! server expects; fields that are read or written from both sides are
//! plain `std::sync::atomic` types, since the two sides never take a lock
//! across the mapping — only the wait/signal protocol in the cycle engine
//! orders accesses to them.
//!
//! Safe because every field is a fixed-size integer, float, or atomic
//! wrapper around one, the struct has no implicit padding (explicit padding
//! is spelled out where the natural layout would otherwise insert it), and
//! these types are only ever reached through a raw pointer into memory the
//! server itself allocated and sized for this exact layout.

use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU32, AtomicU64};

/// Ticks-per-beat used throughout BBT decode (§4.H).
pub const TICKS_PER_BEAT: u32 = 1920;

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationStatus {
    Idle = 0,
    Awake = 1,
    Finished = 2,
    Triggered = 3,
}

impl ActivationStatus {
    pub fn from_u32(v: u32) -> Self {
        match v {
            1 => ActivationStatus::Awake,
            2 => ActivationStatus::Finished,
            3 => ActivationStatus::Triggered,
            _ => ActivationStatus::Idle,
        }
    }
}

/// Raw transport state as carried on the wire in the position block. The
/// user-facing decoded state (which folds in the looping flag) lives in
/// `jackshim-core::transport`.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Stopped = 0,
    Starting = 1,
    Running = 2,
}

impl TransportState {
    pub fn from_u32(v: u32) -> Self {
        match v {
            1 => TransportState::Starting,
            2 => TransportState::Running,
            _ => TransportState::Stopped,
        }
    }
}

#[repr(C)]
#[derive(Debug)]
pub struct Clock {
    pub nsec: u64,
    pub rate_num: u32,
    pub rate_denom: u32,
    pub position: u64,
    pub duration: u64,
    pub delay: i64,
    pub rate_diff: f64,
    /// id of the node currently driving this clock (the scheduling driver).
    pub id: u32,
    _pad: u32,
}

impl Default for Clock {
    fn default() -> Self {
        Clock { nsec: 0, rate_num: 1, rate_denom: 48000, position: 0, duration: 0, delay: 0, rate_diff: 1.0, id: 0, _pad: 0 }
    }
}

/// Segment bar-flag bit meaning the bar/beat/tick fields below are valid.
pub const SEGMENT_BAR_VALID: u32 = 0x01;
/// Segment flag bit meaning this segment loops.
pub const SEGMENT_LOOPING: u32 = 0x02;

#[repr(C)]
#[derive(Debug)]
pub struct Segment {
    pub start: u64,
    pub duration: u64,
    pub position: u64,
    pub rate: f64,
    pub flags: u32,
    pub beats_per_bar: u32,
    pub signature_denom: u32,
    _pad: u32,
    pub bpm: f64,
    pub bar_offset: f64,
    pub bar_beat: f64,
}

impl Default for Segment {
    fn default() -> Self {
        Segment { start: 0, duration: 0, position: 0, rate: 1.0, flags: 0, beats_per_bar: 4, signature_denom: 4, _pad: 0, bpm: 120.0, bar_offset: 0.0, bar_beat: 0.0 }
    }
}

#[repr(C)]
#[derive(Debug)]
pub struct Position {
    pub clock: Clock,
    pub segment: Segment,
    pub state: AtomicU32,
}

impl Position {
    pub fn transport_state(&self) -> TransportState {
        TransportState::from_u32(self.state.load(std::sync::atomic::Ordering::Acquire))
    }
}

impl Default for Position {
    fn default() -> Self {
        Position { clock: Clock::default(), segment: Segment::default(), state: AtomicU32::new(TransportState::Stopped as u32) }
    }
}

/// Per-predecessor fan-in counter, mirroring the real protocol's
/// `states[1]` array: each cycle a driven node decrements `pending` for
/// every predecessor signal it receives, and runs once it reaches zero.
#[repr(C)]
#[derive(Debug, Default)]
pub struct NodeActivationState {
    pub required: AtomicI32,
    pub pending: AtomicI32,
}

#[repr(C)]
#[derive(Debug)]
pub struct Activation {
    pub status: AtomicU32,
    pub pending_sync: AtomicU32,
    pub pending_new_pos: AtomicU32,
    pub awake_time: AtomicI64,
    pub finish_time: AtomicI64,
    pub signal_time: AtomicI64,
    /// `segment_owner[0]`: 0 means unowned, otherwise the owning node id.
    pub segment_owner: [AtomicU32; 1],
    pub reposition_owner: AtomicU32,
    pub reposition_frame: AtomicU64,
    pub command: AtomicU32,
    pub xrun_count: AtomicU32,
    pub cpu_load: [AtomicU32; 3],
    pub states: [NodeActivationState; 1],
    pub position: Position,
}

impl Activation {
    pub fn status(&self) -> ActivationStatus {
        ActivationStatus::from_u32(self.status.load(std::sync::atomic::Ordering::Acquire))
    }
}

impl Default for Activation {
    fn default() -> Self {
        Activation {
            status: AtomicU32::new(ActivationStatus::Idle as u32),
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
            states: [NodeActivationState::default()],
            position: Position::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::size_of;

    #[test]
    fn clock_has_no_trailing_surprises() {
        // u64+u32+u32+u64+u64+i64+f64+u32+u32 = 8+4+4+8+8+8+8+4+4 = 56
        assert_eq!(size_of::<Clock>(), 56);
    }

    #[test]
    fn activation_status_decodes() {
        assert_eq!(ActivationStatus::from_u32(0), ActivationStatus::Idle);
        assert_eq!(ActivationStatus::from_u32(3), ActivationStatus::Triggered);
        assert_eq!(ActivationStatus::from_u32(99), ActivationStatus::Idle);
    }
}

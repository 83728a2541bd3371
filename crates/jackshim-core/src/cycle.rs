//! Realtime cycle engine (§4.E) and buffer-get façade (§4.F). Everything
//! in this module runs on the data loop thread: no allocation, no locking,
//! no blocking beyond the single eventfd read the caller already performed.

use std::sync::atomic::Ordering;

use jackshim_proto::pod::{ActivationStatus, Activation};

use crate::bufmgr::IoBufferStatus;
use crate::midi::{convert_from_midi, convert_to_midi, MidiBuffer, SequenceControl};
use crate::pool::{LocalPort, PortPool};
use crate::transport::{decode_position, is_segment_owner, DecodedTransport};

/// User-registered realtime callbacks. A client has either a `process` or a
/// `thread` callback (§6), never both.
#[derive(Default)]
pub struct Callbacks {
    pub process: Option<Box<dyn FnMut(u32) -> i32 + Send>>,
    pub thread_init: Option<Box<dyn FnMut() + Send>>,
    pub buffer_size: Option<Box<dyn FnMut(u32) -> i32 + Send>>,
    pub sample_rate: Option<Box<dyn FnMut(u32) -> i32 + Send>>,
    pub xrun: Option<Box<dyn FnMut() -> i32 + Send>>,
    pub sync: Option<Box<dyn FnMut(DecodedTransport, u64) -> bool + Send>>,
    pub timebase: Option<Box<dyn FnMut(DecodedTransport, u32, bool) + Send>>,
}

/// Peer to signal at the end of a cycle (§3 Link, §4.E step 12).
pub struct PeerLink {
    pub node_id: u32,
    pub activation: *const Activation,
    pub signal_fd: std::os::fd::RawFd,
}

/// Mutable per-cycle bookkeeping the engine needs across calls, kept
/// outside `Callbacks` so the borrow checker doesn't force both to be
/// borrowed mutably at once.
pub struct CycleState {
    pub first_cycle: bool,
    pub cached_buffer_frames: u32,
    pub cached_sample_rate: u32,
    pub cached_xrun_count: u32,
    pub node_id: u32,
}

impl CycleState {
    pub fn new(node_id: u32) -> Self {
        CycleState { first_cycle: true, cached_buffer_frames: 0, cached_sample_rate: 0, cached_xrun_count: 0, node_id }
    }
}

/// Outcome of one cycle, for logging/testing; the realtime path itself
/// never returns an `Err` (§7 "the realtime cycle must never fail the
/// process").
#[derive(Debug, Default)]
pub struct CycleReport {
    pub missed_wakeups: bool,
    pub peer_signal_failures: u32,
}

/// Run one realtime cycle. `driver` is the activation this client reads
/// position/transport from (possibly `own` if this client is itself the
/// driver). `own` is this client's own activation record.
#[allow(clippy::too_many_arguments)]
pub fn run_cycle(
    eventfd_value: u64,
    own: &Activation,
    driver: &Activation,
    pool: &mut PortPool,
    peers: &[PeerLink],
    callbacks: &mut Callbacks,
    state: &mut CycleState,
    frames: u32,
) -> CycleReport {
    let mut report = CycleReport::default();
    if eventfd_value > 1 {
        report.missed_wakeups = true;
        tracing::warn!(eventfd_value, "missed wakeups on rt socket");
    }

    own.awake_time.store(driver.position.clock.nsec as i64, Ordering::Relaxed);
    own.status.store(ActivationStatus::Awake as u32, Ordering::Release);

    if state.first_cycle {
        if let Some(cb) = callbacks.thread_init.as_mut() {
            cb();
        }
        state.first_cycle = false;
    }

    let duration = driver.position.clock.duration as u32;
    if duration != 0 && duration != state.cached_buffer_frames {
        state.cached_buffer_frames = duration;
        if let Some(cb) = callbacks.buffer_size.as_mut() {
            let _ = cb(duration);
        }
    }
    let rate = driver.position.clock.rate_denom;
    if rate != 0 && rate != state.cached_sample_rate {
        state.cached_sample_rate = rate;
        if let Some(cb) = callbacks.sample_rate.as_mut() {
            let _ = cb(rate);
        }
    }

    let pos_info = decode_position(driver);

    if driver.pending_sync.load(Ordering::Acquire) != 0 {
        let complete = match callbacks.sync.as_mut() {
            Some(cb) => cb(pos_info.state, pos_info.frame),
            None => true,
        };
        if complete {
            driver.pending_sync.store(0, Ordering::Release);
        }
    }

    let xruns = own.xrun_count.load(Ordering::Acquire);
    if state.cached_xrun_count != 0 && xruns != state.cached_xrun_count {
        if let Some(cb) = callbacks.xrun.as_mut() {
            let _ = cb();
        }
    }
    state.cached_xrun_count = xruns;

    if let Some(cb) = callbacks.process.as_mut() {
        let _ = cb(frames);
    }

    if is_segment_owner(driver, state.node_id) {
        let pending_new_pos = own.pending_new_pos.load(Ordering::Acquire) != 0;
        let rolling = matches!(pos_info.state, DecodedTransport::Rolling | DecodedTransport::Looping);
        if pending_new_pos || rolling {
            if let Some(cb) = callbacks.timebase.as_mut() {
                cb(pos_info.state, frames, pending_new_pos);
            }
            own.pending_new_pos.store(0, Ordering::Release);
        }
    }

    tee_midi_outputs(pool);

    let finish_nsec = driver.position.clock.nsec as i64;
    own.finish_time.store(finish_nsec, Ordering::Relaxed);
    own.status.store(ActivationStatus::Finished as u32, Ordering::Release);

    signal_peers(peers, finish_nsec, &mut report);

    report
}

/// §4.E step 10 (the Tee): for every output port, dequeue a buffer from its
/// own producing mix, convert it if the port is MIDI, and fan the buffer's
/// identity out to every reader mix's `io`.
fn tee_midi_outputs(pool: &mut PortPool) {
    let port_indices: Vec<usize> = pool.outputs.iter().map(|(idx, _)| idx).collect();
    for idx in port_indices {
        fan_out_port_io(pool, idx);
    }
}

/// Pops a buffer from `port`'s own mix, marks it held by the producer, and
/// assigns its buffer id into every mix `io` attached to the port (the own
/// mix's, then every reader's) — the zero-copy tee itself. A MIDI port's
/// buffer is additionally run through `midi_out_to_sequence` so the bytes
/// the application wrote land as control events before the fan-out.
fn fan_out_port_io(pool: &mut PortPool, port_idx: usize) {
    let Some(port) = pool.outputs.get(port_idx) else { return };
    let is_midi = port.is_midi;
    let mix_ids = port.mixes.clone();
    let Some(own_mix_idx) = mix_ids.iter().copied().find(|&m| pool.mixes.get(m).map(|s| s.peer_mix_id) == Some(jackshim_proto::INVALID_ID)) else {
        return;
    };

    let buffer_id = {
        let Some(own_mix) = pool.mixes.get_mut(own_mix_idx) else { return };
        let Some(idx) = own_mix.queue.pop() else { return };
        if let Some(desc) = own_mix.buffers[idx].as_mut() {
            desc.out = true;
            if is_midi {
                if let Some(plane) = desc.planes.first() {
                    let midi = MidiBuffer::attach(plane.as_mut_slice());
                    let sequence = midi_out_to_sequence(&midi);
                    tracing::trace!(port = port_idx, events = sequence.len(), "teed midi output port");
                }
            }
        }
        if let Some(io) = &own_mix.io {
            io.set_buffer_id(idx as u32);
            io.set_status(IoBufferStatus::HaveData);
        }
        idx as u32
    };

    for mix_idx in mix_ids {
        if mix_idx == own_mix_idx {
            continue;
        }
        if let Some(mix) = pool.mixes.get(mix_idx) {
            if let Some(io) = &mix.io {
                io.set_buffer_id(buffer_id);
                io.set_status(IoBufferStatus::HaveData);
            }
        }
    }
}

fn signal_peers(peers: &[PeerLink], now_nsec: i64, report: &mut CycleReport) {
    for peer in peers {
        if peer.activation.is_null() {
            continue;
        }
        // Safety: `activation` points into a mapping kept alive for the
        // lifetime of the peer link.
        let act = unsafe { &*peer.activation };
        let remaining = act.states[0].pending.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining <= 0 {
            act.status.store(ActivationStatus::Triggered as u32, Ordering::Release);
            act.signal_time.store(now_nsec, Ordering::Relaxed);
            let one: u64 = 1;
            let ret = unsafe { libc::write(peer.signal_fd, &one as *const u64 as *const libc::c_void, 8) };
            if ret != 8 {
                report.peer_signal_failures += 1;
                tracing::warn!(node_id = peer.node_id, "failed to signal peer activation");
            }
        }
    }
}

/// §4.F buffer-get façade: returns the correct pointer for one port this
/// cycle, per direction x type. For an output port, `own_mix` is the
/// port's producing mix (`None` for a port with no negotiated buffers
/// yet); a real buffer is dequeued from its queue, marked held by the
/// producer, and its `io` status raised to `HaveData` before the slice is
/// handed back for the application to write into.
pub fn port_get_buffer_audio<'a>(
    port: &'a mut LocalPort,
    mix_buffers: &[(&IoBufferStatus, Option<&'a [f32]>)],
    own_mix: Option<&'a mut crate::pool::MixSlot>,
    frames: usize,
) -> &'a [f32] {
    if port.is_output {
        if let Some(mix) = own_mix {
            if let Some(idx) = mix.queue.pop() {
                if let Some(io) = &mix.io {
                    io.set_buffer_id(idx as u32);
                    io.set_status(IoBufferStatus::HaveData);
                }
                if let Some(desc) = mix.buffers[idx].as_mut() {
                    desc.out = true;
                    if let Some(plane) = desc.planes.first() {
                        let bytes = plane.as_slice();
                        let n = (bytes.len() / 4).min(frames);
                        return unsafe { std::slice::from_raw_parts(bytes.as_ptr().cast::<f32>(), n) };
                    }
                }
            }
        }
        return port.empty.as_slice(frames);
    }

    let mut first: Option<&[f32]> = None;
    let mut summed = false;
    for (_status, data) in mix_buffers {
        let Some(samples) = data else { continue };
        match first {
            None => first = Some(samples),
            Some(f) => {
                if !summed {
                    port.empty.as_mut_slice(frames).copy_from_slice(&f[..frames.min(f.len())]);
                    summed = true;
                }
                mix_add(port.empty.as_mut_slice(frames), &samples[..frames.min(samples.len())]);
            }
        }
    }

    if summed {
        port.empty.as_slice(frames)
    } else {
        match first {
            Some(f) => f,
            None => {
                if !port.zeroed_this_cycle {
                    port.empty.as_mut_slice(frames).fill(0.0);
                    port.zeroed_this_cycle = true;
                }
                port.empty.as_slice(frames)
            }
        }
    }
}

/// Scalar mix-add path, obligatory per §9. A SIMD-accelerated variant may
/// dispatch here based on runtime CPU-feature detection but must preserve
/// these exact semantics (no allocation, no branching on alignment).
pub fn mix_add(dst: &mut [f32], src: &[f32]) {
    for (d, s) in dst.iter_mut().zip(src.iter()) {
        *d += *s;
    }
}

/// §4.F "Input MIDI": merge every connected mix's control sequence into
/// the port's legacy MIDI buffer.
pub fn port_get_buffer_midi_in<'a>(buf: &'a mut [u8], nframes: u32, inputs: &[Vec<SequenceControl>]) -> MidiBuffer<'a> {
    let mut out = MidiBuffer::clear(buf, nframes);
    convert_to_midi(inputs, &mut out);
    out
}

/// §4.G: convert an output MIDI port's application-written buffer for tee.
pub fn midi_out_to_sequence(buf: &MidiBuffer<'_>) -> Vec<SequenceControl> {
    convert_from_midi(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mix_sum_is_elementwise() {
        let mut port = LocalPort::new(1, false, 0);
        let a = [1.0f32, 2.0, 3.0, 4.0];
        let b = [0.5f32, 0.5, 0.5, 0.5];
        let status = IoBufferStatus::HaveData;
        let mixes: Vec<(&IoBufferStatus, Option<&[f32]>)> = vec![(&status, Some(&a)), (&status, Some(&b))];
        let out = port_get_buffer_audio(&mut port, &mixes, None, 4);
        assert_eq!(out, &[1.5, 2.5, 3.5, 4.5]);
    }

    #[test]
    fn no_connections_returns_zeroed_empty_buffer() {
        let mut port = LocalPort::new(1, false, 0);
        let mixes: Vec<(&IoBufferStatus, Option<&[f32]>)> = vec![];
        let out = port_get_buffer_audio(&mut port, &mixes, None, 4);
        assert_eq!(out, &[0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn single_connection_is_zero_copy_not_the_empty_buffer() {
        let mut port = LocalPort::new(1, false, 0);
        let a = [9.0f32, 9.0, 9.0, 9.0];
        let status = IoBufferStatus::HaveData;
        let mixes: Vec<(&IoBufferStatus, Option<&[f32]>)> = vec![(&status, Some(&a))];
        let out = port_get_buffer_audio(&mut port, &mixes, None, 4);
        assert_eq!(out.as_ptr(), a.as_ptr());
    }

    #[test]
    fn fan_out_tees_buffer_identity_to_reader_mix() {
        use crate::bufmgr::{BufferDescriptor, DataPlane, IoBuffersHandle, MappedRegion};
        use std::io::Write;
        use std::os::fd::IntoRawFd;
        use std::sync::Arc;

        fn anon_region(bytes: &[u8]) -> Arc<MappedRegion> {
            let mut f = tempfile::tempfile().unwrap();
            f.write_all(bytes).unwrap();
            let fd = f.into_raw_fd();
            Arc::new(unsafe { MappedRegion::from_raw_fd(fd, 0, bytes.len()).unwrap() })
        }

        let mut pool = PortPool::new();
        let port_idx = pool.outputs.alloc(LocalPort::new(1, true, 0)).unwrap();
        let own_mix = pool.own_output_mix(port_idx).unwrap();
        let reader_mix = pool.ensure_mix(port_idx, true, 42).unwrap();

        let data_region = anon_region(&[0u8; 16]);
        let desc = BufferDescriptor {
            metadata: data_region.clone(),
            planes: vec![DataPlane { region: data_region.clone(), offset: 0, size: 16 }],
            mems: vec![data_region],
            out: false,
        };

        {
            let mix = pool.mixes.get_mut(own_mix).unwrap();
            mix.buffers[0] = Some(desc);
            mix.queue.push(0);
            mix.io = Some(IoBuffersHandle { region: anon_region(&[0u8; 8]) });
        }
        {
            let mix = pool.mixes.get_mut(reader_mix).unwrap();
            mix.io = Some(IoBuffersHandle { region: anon_region(&[0u8; 8]) });
        }

        fan_out_port_io(&mut pool, port_idx);

        let own = pool.mixes.get(own_mix).unwrap();
        assert!(own.buffers[0].as_ref().unwrap().out);
        assert!(own.queue.is_empty());
        assert_eq!(own.io.as_ref().unwrap().buffer_id(), 0);
        assert_eq!(own.io.as_ref().unwrap().status(), IoBufferStatus::HaveData);

        let reader = pool.mixes.get(reader_mix).unwrap();
        assert_eq!(reader.io.as_ref().unwrap().buffer_id(), 0);
        assert_eq!(reader.io.as_ref().unwrap().status(), IoBufferStatus::HaveData);
    }
}

//! Fixed-capacity slab allocators for locally-owned ports and their mixes
//! (§3, §4.B). Every operation here is pure data-structure manipulation
//! under the thread-loop lock: no blocking, no I/O, no allocation once a
//! pool has reached its capacity once (the backing `Vec`s are pre-sized).

use jackshim_proto::INVALID_ID;

use crate::bufmgr::BufferDescriptor;
use crate::error::BufferError;

pub const MAX_PORTS: usize = 1024;
pub const MAX_MIX: usize = 4096;
pub const MAX_BUFFERS: usize = 2;
pub const MAX_BUFFER_FRAMES: usize = 8192;

/// A slab with a free list, sized once at construction and never grown.
/// Freed slots are pushed onto `free` and reused by the next `alloc`.
pub struct Slab<T> {
    slots: Vec<Option<T>>,
    free: Vec<usize>,
}

impl<T> Slab<T> {
    pub fn with_capacity(cap: usize) -> Self {
        Slab { slots: (0..cap).map(|_| None).collect(), free: (0..cap).rev().collect() }
    }

    pub fn alloc(&mut self, value: T) -> Result<usize, BufferError> {
        let idx = self.free.pop().ok_or(BufferError::PoolExhausted)?;
        self.slots[idx] = Some(value);
        Ok(idx)
    }

    pub fn free(&mut self, idx: usize) -> Option<T> {
        let v = self.slots[idx].take();
        if v.is_some() {
            self.free.push(idx);
        }
        v
    }

    pub fn get(&self, idx: usize) -> Option<&T> {
        self.slots.get(idx).and_then(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut T> {
        self.slots.get_mut(idx).and_then(|s| s.as_mut())
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &T)> {
        self.slots.iter().enumerate().filter_map(|(i, s)| s.as_ref().map(|v| (i, v)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (usize, &mut T)> {
        self.slots.iter_mut().enumerate().filter_map(|(i, s)| s.as_mut().map(|v| (i, v)))
    }
}

/// A client-owned port: the local side of a registry `Port` object.
pub struct LocalPort {
    pub object_id: u32,
    pub is_output: bool,
    pub index: u32,
    /// Mix slot indices currently attached to this port, in connection order.
    pub mixes: Vec<usize>,
    /// 16-byte aligned, `MAX_BUFFER_FRAMES` wide scratch buffer used as the
    /// zero/default/mix-sum destination (§4.F).
    pub empty: AlignedBuffer,
    pub zeroed_this_cycle: bool,
    pub sample_rate: u32,
    /// Set when the port's negotiated format is MIDI (§4.D), so the cycle
    /// engine's output tee knows to run the ring-buffer -> control-sequence
    /// conversion instead of a plain audio fan-out.
    pub is_midi: bool,
}

impl LocalPort {
    pub fn new(object_id: u32, is_output: bool, index: u32) -> Self {
        LocalPort {
            object_id,
            is_output,
            index,
            mixes: Vec::new(),
            empty: AlignedBuffer::zeroed(),
            zeroed_this_cycle: false,
            sample_rate: 48000,
            is_midi: false,
        }
    }
}

/// 16-byte aligned float scratch space, sized for the largest buffer the
/// protocol will ever ask this client to hold (`MAX_BUFFER_FRAMES`).
#[repr(align(16))]
pub struct AlignedBuffer(pub Box<[f32; MAX_BUFFER_FRAMES]>);

impl AlignedBuffer {
    pub fn zeroed() -> Self {
        AlignedBuffer(Box::new([0.0; MAX_BUFFER_FRAMES]))
    }

    pub fn as_slice(&self, frames: usize) -> &[f32] {
        &self.0[..frames.min(MAX_BUFFER_FRAMES)]
    }

    pub fn as_mut_slice(&mut self, frames: usize) -> &mut [f32] {
        &mut self.0[..frames.min(MAX_BUFFER_FRAMES)]
    }
}

/// One peer endpoint of a port: either an upstream feeding an input port,
/// or a reader of an output port's `io` (§3).
pub struct MixSlot {
    pub port: usize,
    /// `INVALID_ID` designates the port's own output mix.
    pub peer_mix_id: u32,
    /// Set by the server via `port_set_io(Buffers, ...)`; `None` when cleared.
    pub io: Option<crate::bufmgr::IoBuffersHandle>,
    pub buffers: [Option<BufferDescriptor>; MAX_BUFFERS],
    /// Indices into `buffers` currently free for the application to write into.
    pub queue: Vec<usize>,
}

impl MixSlot {
    pub fn new(port: usize, peer_mix_id: u32) -> Self {
        MixSlot {
            port,
            peer_mix_id,
            io: None,
            buffers: [None, None],
            queue: Vec::new(),
        }
    }

    pub fn clear_buffers(&mut self) {
        self.buffers = [None, None];
        self.queue.clear();
    }
}

pub struct PortPool {
    pub inputs: Slab<LocalPort>,
    pub outputs: Slab<LocalPort>,
    pub mixes: Slab<MixSlot>,
}

impl Default for PortPool {
    fn default() -> Self {
        PortPool {
            inputs: Slab::with_capacity(MAX_PORTS),
            outputs: Slab::with_capacity(MAX_PORTS),
            mixes: Slab::with_capacity(MAX_MIX),
        }
    }
}

impl PortPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ports(&self, is_output: bool) -> &Slab<LocalPort> {
        if is_output { &self.outputs } else { &self.inputs }
    }

    pub fn ports_mut(&mut self, is_output: bool) -> &mut Slab<LocalPort> {
        if is_output { &mut self.outputs } else { &mut self.inputs }
    }

    /// Find or lazily create the mix this port uses for `peer_mix_id`
    /// (§4.D `port_set_io`: "allocates the mix lazily").
    pub fn ensure_mix(&mut self, port_idx: usize, is_output: bool, peer_mix_id: u32) -> Result<usize, BufferError> {
        let existing = {
            let port = self.ports(is_output).get(port_idx).expect("port exists");
            port.mixes.iter().copied().find(|&m| self.mixes.get(m).map(|s| s.peer_mix_id) == Some(peer_mix_id))
        };
        if let Some(idx) = existing {
            return Ok(idx);
        }
        let idx = self.mixes.alloc(MixSlot::new(port_idx, peer_mix_id))?;
        self.ports_mut(is_output).get_mut(port_idx).expect("port exists").mixes.push(idx);
        Ok(idx)
    }

    /// `peer_mix_id == INVALID_ID` is the port's own output mix.
    pub fn own_output_mix(&mut self, port_idx: usize) -> Result<usize, BufferError> {
        self.ensure_mix(port_idx, true, INVALID_ID)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slab_reuses_freed_slots() {
        let mut s: Slab<u32> = Slab::with_capacity(2);
        let a = s.alloc(1).unwrap();
        let _b = s.alloc(2).unwrap();
        assert!(s.alloc(3).is_err());
        s.free(a);
        let c = s.alloc(3).unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn ensure_mix_is_idempotent_per_peer() {
        let mut pool = PortPool::new();
        let p = pool.inputs.alloc(LocalPort::new(1, false, 0)).unwrap();
        let m1 = pool.ensure_mix(p, false, 7).unwrap();
        let m2 = pool.ensure_mix(p, false, 7).unwrap();
        assert_eq!(m1, m2);
        let m3 = pool.ensure_mix(p, false, 8).unwrap();
        assert_ne!(m1, m3);
    }
}

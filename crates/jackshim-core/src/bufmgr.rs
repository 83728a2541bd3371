//! Shared-memory mapping (§4.C). All memory exchanged with the graph
//! server is named by `(pool, mem_id, offset, size)`; this module owns the
//! mapping lifetime and the `io` tag bookkeeping (re-issuing a `set_io` for
//! the same tag unmaps the previous mapping before creating the new one).

use std::collections::HashMap;
use std::fs::File;
use std::os::fd::{FromRawFd, RawFd};
use std::sync::Arc;

use jackshim_proto::message::{Direction, IoId, MemRef};
use memmap2::MmapRaw;

pub const MAX_BUFFER_DATAS: usize = 4;
pub const MAX_BUFFER_MEMS: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    #[error("pool exhausted")]
    PoolExhausted,
    #[error("failed to map shared memory: {0}")]
    Mmap(#[from] std::io::Error),
    #[error("mem region not mapped")]
    UnknownRegion,
    #[error("buffer has too many planes (max {MAX_BUFFER_DATAS})")]
    TooManyPlanes,
}

/// An owned mapping of one `(mem_id, offset, size)` region. Keeps the
/// donated fd open (wrapped as a `File` purely for RAII) for as long as
/// any `BufferDescriptor` or `io` handle references it.
pub struct MappedRegion {
    map: MmapRaw,
    _file: File,
}

impl MappedRegion {
    /// Takes ownership of `fd` (as the server handed it to us via
    /// `recvmsg` ancillary data) and maps `len` bytes starting at `offset`.
    ///
    /// Safety: the caller must have received `fd` as a fresh ownership
    /// transfer (the server does not keep using it), matching the
    /// ancillary-fd handoff convention of the underlying protocol.
    pub unsafe fn from_raw_fd(fd: RawFd, offset: u64, len: usize) -> Result<Self, BufferError> {
        let file = File::from_raw_fd(fd);
        let map = memmap2::MmapOptions::new().offset(offset).len(len).map_raw(&file)?;
        Ok(MappedRegion { map, _file: file })
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.map.as_mut_ptr()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.len() == 0
    }

    /// Best-effort `mlock` on the mapped range; failure is warned, not
    /// fatal (§4.C).
    pub fn lock(&self) {
        let ret = unsafe { libc::mlock(self.map.as_mut_ptr().cast(), self.map.len()) };
        if ret != 0 {
            tracing::warn!(errno = std::io::Error::last_os_error().raw_os_error(), "mlock failed on shared buffer region");
        }
    }
}

/// One payload plane of a buffer, pointing into a mapped region.
#[derive(Clone)]
pub struct DataPlane {
    pub region: Arc<MappedRegion>,
    pub offset: usize,
    pub size: usize,
}

impl DataPlane {
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.region.as_ptr().add(self.offset), self.size) }
    }

    #[allow(clippy::mut_from_ref)]
    pub fn as_mut_slice(&self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.region.as_ptr().add(self.offset), self.size) }
    }
}

/// A single buffer: metadata region plus up to `MAX_BUFFER_DATAS` planes.
/// `out` tracks whether the producer currently holds this buffer (`true`)
/// or whether it has been returned to its mix's free queue (`false`).
pub struct BufferDescriptor {
    pub metadata: Arc<MappedRegion>,
    pub planes: Vec<DataPlane>,
    pub mems: Vec<Arc<MappedRegion>>,
    pub out: bool,
}

/// The `io` pointer a mix uses to exchange per-cycle status with the
/// server: which buffer id is current and what status flag it carries.
pub struct IoBuffersHandle {
    pub region: Arc<MappedRegion>,
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoBufferStatus {
    Empty = 0,
    NeedData = 1,
    HaveData = 2,
}

impl IoBuffersHandle {
    /// Layout: `[u32 status][u32 buffer_id]` at the head of the region.
    pub fn buffer_id(&self) -> u32 {
        unsafe { (self.region.as_ptr().add(4) as *const u32).read_volatile() }
    }

    pub fn set_buffer_id(&self, id: u32) {
        unsafe { (self.region.as_ptr().add(4) as *mut u32).write_volatile(id) }
    }

    pub fn status(&self) -> IoBufferStatus {
        let raw = unsafe { (self.region.as_ptr() as *const u32).read_volatile() };
        match raw {
            1 => IoBufferStatus::NeedData,
            2 => IoBufferStatus::HaveData,
            _ => IoBufferStatus::Empty,
        }
    }

    pub fn set_status(&self, status: IoBufferStatus) {
        unsafe { (self.region.as_ptr() as *mut u32).write_volatile(status as u32) }
    }
}

/// Identifies one `set_io`/`port_set_io` binding so a re-issue for the
/// same scope unmaps the previous mapping first.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IoTag {
    pub node_id: u32,
    pub scope: IoScope,
    pub io_id: IoIdKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IoScope {
    Node,
    Port { dir: DirectionKey, port: u32, mix: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DirectionKey {
    Input,
    Output,
}

impl From<Direction> for DirectionKey {
    fn from(d: Direction) -> Self {
        match d {
            Direction::Input => DirectionKey::Input,
            Direction::Output => DirectionKey::Output,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IoIdKey {
    Position,
    Buffers,
}

impl From<IoId> for IoIdKey {
    fn from(id: IoId) -> Self {
        match id {
            IoId::Position => IoIdKey::Position,
            IoId::Buffers => IoIdKey::Buffers,
        }
    }
}

#[derive(Default)]
pub struct BufferManager {
    tagged: HashMap<IoTag, Arc<MappedRegion>>,
}

impl BufferManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `region` for `tag`, dropping whatever was previously mapped for
    /// the same tag. Passing `region = None` clears the tag.
    ///
    /// Safety: `fd` (embedded in the caller-constructed region) must be an
    /// owned, fresh file descriptor, as required by [`MappedRegion::from_raw_fd`].
    pub fn bind(&mut self, tag: IoTag, region: Option<Arc<MappedRegion>>) {
        match region {
            Some(r) => {
                self.tagged.insert(tag, r);
            }
            None => {
                self.tagged.remove(&tag);
            }
        }
    }

    pub fn get(&self, tag: &IoTag) -> Option<&Arc<MappedRegion>> {
        self.tagged.get(tag)
    }

    /// Map a fresh region described by `mem`. The caller (protocol
    /// handler) is responsible for tracking the donated fd and passing it
    /// here exactly once.
    ///
    /// # Safety
    /// `fd` must be owned by the caller and not used again after this call.
    pub unsafe fn map(&self, fd: RawFd, mem: &MemRef) -> Result<Arc<MappedRegion>, BufferError> {
        let region = MappedRegion::from_raw_fd(fd, mem.offset as u64, mem.size as usize)?;
        Ok(Arc::new(region))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::IntoRawFd;

    fn anon_region(bytes: &[u8]) -> Arc<MappedRegion> {
        let mut f = tempfile::tempfile().unwrap();
        f.write_all(bytes).unwrap();
        let fd = f.into_raw_fd();
        let region = unsafe { MappedRegion::from_raw_fd(fd, 0, bytes.len()).unwrap() };
        Arc::new(region)
    }

    #[test]
    fn io_handle_roundtrips_status_and_buffer_id() {
        let region = anon_region(&[0u8; 8]);
        let io = IoBuffersHandle { region };
        io.set_status(IoBufferStatus::HaveData);
        io.set_buffer_id(3);
        assert_eq!(io.status(), IoBufferStatus::HaveData);
        assert_eq!(io.buffer_id(), 3);
    }

    #[test]
    fn rebinding_a_tag_replaces_the_mapping() {
        let mut mgr = BufferManager::new();
        let tag = IoTag { node_id: 1, scope: IoScope::Node, io_id: IoIdKey::Position };
        let r1 = anon_region(&[1u8; 16]);
        mgr.bind(tag.clone(), Some(r1));
        assert!(mgr.get(&tag).is_some());
        mgr.bind(tag.clone(), None);
        assert!(mgr.get(&tag).is_none());
    }
}

//! Node/port protocol handler (§4.D): consumes [`ServerMessage`]s and
//! mutates the registry/port pool/buffer manager, producing
//! [`ClientMessage`] replies.

use jackshim_proto::message::{ClientMessage, Direction, FormatParam, PortParamId, ServerMessage};
use jackshim_proto::{PortFlags, PortType};

use crate::bufmgr::{BufferManager, DirectionKey, IoIdKey, IoScope, IoTag};
use crate::error::CoreError;
use crate::pool::PortPool;

/// Per-port negotiated format, tracked so `port_set_param(Format, null)`
/// can detect "already cleared" and so `port_get_buffer` knows a port's
/// plane width.
#[derive(Debug, Clone)]
pub struct PortFormat {
    pub param: FormatParam,
}

pub struct ProtocolHandler {
    pub pool: PortPool,
    pub bufmgr: BufferManager,
    pub formats: std::collections::HashMap<(bool, u32), PortFormat>,
    pub node_id: u32,
}

impl ProtocolHandler {
    pub fn new(node_id: u32) -> Self {
        ProtocolHandler {
            pool: PortPool::new(),
            bufmgr: BufferManager::new(),
            formats: std::collections::HashMap::new(),
            node_id,
        }
    }

    /// Dispatch one inbound message, returning the replies to send back.
    pub fn handle(&mut self, msg: ServerMessage) -> Result<Vec<ClientMessage>, CoreError> {
        match msg {
            ServerMessage::PortSetParam { dir, port, id, format } => self.port_set_param(dir, port, id, format),
            ServerMessage::PortUseBuffers { dir, port, mix, buffers } => {
                self.port_use_buffers(dir, port, mix, buffers)?;
                Ok(vec![])
            }
            ServerMessage::PortSetIo { dir, port, mix, id, region } => {
                self.port_set_io(dir, port, mix, id, region)?;
                Ok(vec![])
            }
            ServerMessage::AddPort | ServerMessage::RemovePort | ServerMessage::SetParam | ServerMessage::Event => {
                Ok(vec![ClientMessage::NotSupported { code: libc::ENOTSUP }])
            }
            // Transport, SetIo(node-scope), SetActivation, Command are handled
            // by the orchestration layer (`client.rs`), which owns the
            // activation/rt-socket state these messages bind to.
            other => {
                tracing::debug!(?other, "message routed to orchestration layer");
                Ok(vec![])
            }
        }
    }

    fn port_set_param(
        &mut self,
        dir: Direction,
        port: u32,
        id: PortParamId,
        format: Option<FormatParam>,
    ) -> Result<Vec<ClientMessage>, CoreError> {
        let is_output = matches!(dir, Direction::Output);
        let key = (is_output, port);

        if id == PortParamId::Format {
            match format {
                None => {
                    self.formats.remove(&key);
                    self.release_port_buffers(is_output, port as usize);
                }
                Some(f) => {
                    validate_format(&f)?;
                    let is_midi = matches!(f, FormatParam::Midi);
                    if let Some(p) = self.pool.ports_mut(is_output).get_mut(port as usize) {
                        p.is_midi = is_midi;
                    }
                    self.formats.insert(key, PortFormat { param: f });
                }
            }
        }

        Ok(vec![ClientMessage::PortUpdate { dir, port }])
    }

    fn release_port_buffers(&mut self, is_output: bool, port_idx: usize) {
        if let Some(p) = self.pool.ports(is_output).get(port_idx) {
            let mixes = p.mixes.clone();
            for m in mixes {
                if let Some(mix) = self.pool.mixes.get_mut(m) {
                    mix.clear_buffers();
                }
            }
        }
    }

    /// Bookkeeping half of `port_use_buffers`: drops whatever buffers this
    /// mix held before. `buffers` only carries `MemRef`s, not live mapped
    /// memory (the donated fds travel out-of-band), so populating
    /// `mix.buffers`/`mix.queue` with real descriptors is deferred to
    /// [`Self::bind_mapped_buffers`], called by the orchestration layer
    /// once it has mapped each plane — the same split `port_set_io` already
    /// uses for `bind_mapped_io`.
    fn port_use_buffers(
        &mut self,
        dir: Direction,
        port: u32,
        mix_id: u32,
        buffers: Vec<jackshim_proto::message::BufferSpec>,
    ) -> Result<(), CoreError> {
        let is_output = matches!(dir, Direction::Output);
        let port_idx = port as usize;
        let mix_idx = self.pool.ensure_mix(port_idx, is_output, mix_id)?;

        if buffers.is_empty() {
            if let Some(mix) = self.pool.mixes.get_mut(mix_idx) {
                mix.clear_buffers();
            }
        }
        Ok(())
    }

    /// Called by the orchestration layer once it has mapped every plane
    /// named in a `port_use_buffers` message. Stores the real descriptors
    /// and, for an output mix, queues every slot as free for the
    /// application to write into (the §8 invariant `queue.len + {b:OUT} ==
    /// n_buffers` holds immediately after this call).
    pub fn bind_mapped_buffers(
        &mut self,
        dir: Direction,
        port: u32,
        mix_id: u32,
        buffers: Vec<crate::bufmgr::BufferDescriptor>,
    ) -> Result<(), CoreError> {
        let is_output = matches!(dir, Direction::Output);
        let mix_idx = self.pool.ensure_mix(port as usize, is_output, mix_id)?;
        if let Some(mix) = self.pool.mixes.get_mut(mix_idx) {
            mix.clear_buffers();
            for (i, desc) in buffers.into_iter().enumerate().take(crate::pool::MAX_BUFFERS) {
                mix.buffers[i] = Some(desc);
                if is_output {
                    mix.queue.push(i);
                }
            }
        }
        Ok(())
    }

    fn port_set_io(
        &mut self,
        dir: Direction,
        port: u32,
        mix_id: u32,
        id: jackshim_proto::message::IoId,
        region: Option<jackshim_proto::message::MemRef>,
    ) -> Result<(), CoreError> {
        let is_output = matches!(dir, Direction::Output);
        let port_idx = port as usize;
        let mix_idx = self.pool.ensure_mix(port_idx, is_output, mix_id)?;

        let tag = IoTag {
            node_id: self.node_id,
            scope: IoScope::Port { dir: DirectionKey::from(dir), port, mix: mix_id },
            io_id: IoIdKey::from(id),
        };

        match region {
            None => {
                self.bufmgr.bind(tag, None);
                if let Some(mix) = self.pool.mixes.get_mut(mix_idx) {
                    mix.io = None;
                }
            }
            Some(_mem) => {
                // The actual fd->mapping call happens in the orchestration
                // layer, which owns the fd that accompanied this message;
                // it then calls `bind_mapped_io` below with the result.
            }
        }
        Ok(())
    }

    /// Called by the orchestration layer once it has mapped the region
    /// named in a `port_set_io` message.
    pub fn bind_mapped_io(&mut self, dir: Direction, port: u32, mix_id: u32, handle: crate::bufmgr::IoBuffersHandle) -> Result<(), CoreError> {
        let is_output = matches!(dir, Direction::Output);
        let mix_idx = self.pool.ensure_mix(port as usize, is_output, mix_id)?;
        if let Some(mix) = self.pool.mixes.get_mut(mix_idx) {
            mix.io = Some(handle);
        }
        Ok(())
    }

    pub fn register_port(&mut self, object_id: u32, is_output: bool, index: u32) -> Result<usize, CoreError> {
        let local = crate::pool::LocalPort::new(object_id, is_output, index);
        let idx = self.pool.ports_mut(is_output).alloc(local)?;
        if is_output {
            self.pool.own_output_mix(idx)?;
        }
        Ok(idx)
    }

    pub fn unregister_port(&mut self, is_output: bool, port_idx: usize) {
        if let Some(port) = self.pool.ports_mut(is_output).free(port_idx) {
            for m in port.mixes {
                self.pool.mixes.free(m);
            }
        }
    }
}

fn validate_format(format: &FormatParam) -> Result<(), CoreError> {
    match format {
        FormatParam::Audio { rate } if *rate == 0 => {
            Err(jackshim_proto::ProtocolError::FormatMismatch("audio rate must be nonzero".into()).into())
        }
        FormatParam::Video { width, height, .. } if *width == 0 || *height == 0 => {
            Err(jackshim_proto::ProtocolError::FormatMismatch("video dimensions must be nonzero".into()).into())
        }
        _ => Ok(()),
    }
}

/// The four self-advertised params for one port's type (§4.D table),
/// reported on every format change and on `port_register`.
pub fn self_advertised_params(port_type: PortType, flags: PortFlags) -> Vec<PortParamId> {
    let mut params = vec![PortParamId::EnumFormat, PortParamId::Format, PortParamId::Io];
    if flags.is_input() || flags.is_output() {
        params.push(PortParamId::Buffers);
    }
    let _ = port_type;
    params
}

#[cfg(test)]
mod tests {
    use super::*;
    use jackshim_proto::message::IoId;
    use proptest::prelude::*;

    proptest! {
        /// Repeating `port_set_io(Buffers, null)` any number of times is a
        /// no-op past the first call: the mix's `io` stays cleared and the
        /// mix itself keeps resolving to the same slot.
        #[test]
        fn port_set_io_buffers_null_is_idempotent(repeats in 1usize..8) {
            let mut h = ProtocolHandler::new(1);
            let idx = h.register_port(10, true, 0).unwrap();
            let mut mix_idx = None;
            for _ in 0..repeats {
                h.port_set_io(Direction::Output, idx as u32, jackshim_proto::INVALID_ID, IoId::Buffers, None).unwrap();
                let this_mix = h.pool.own_output_mix(idx).unwrap();
                if let Some(prev) = mix_idx {
                    prop_assert_eq!(prev, this_mix);
                }
                mix_idx = Some(this_mix);
                prop_assert!(h.pool.mixes.get(this_mix).unwrap().io.is_none());
            }
        }
    }

    #[test]
    fn format_clear_releases_mix_buffers() {
        let mut h = ProtocolHandler::new(1);
        let idx = h.register_port(10, true, 0).unwrap();
        h.port_set_param(Direction::Output, idx as u32, PortParamId::Format, Some(FormatParam::Audio { rate: 48000 })).unwrap();
        assert!(h.formats.contains_key(&(true, idx as u32)));
        h.port_set_param(Direction::Output, idx as u32, PortParamId::Format, None).unwrap();
        assert!(!h.formats.contains_key(&(true, idx as u32)));
    }

    #[test]
    fn zero_rate_audio_format_is_rejected() {
        let mut h = ProtocolHandler::new(1);
        let idx = h.register_port(10, true, 0).unwrap();
        let err = h.port_set_param(Direction::Output, idx as u32, PortParamId::Format, Some(FormatParam::Audio { rate: 0 })).unwrap_err();
        assert!(matches!(err, CoreError::Protocol(_)));
    }
}

//! Inbound server events and the outbound replies the protocol handler
//! (`jackshim-core::protocol`) produces for them. See §4.D.

use std::os::fd::RawFd;

/// Which `io` region a `set_io`/`port_set_io` message is naming.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoId {
    Position = 0,
    Buffers = 1,
}

/// The four self-advertised port params (§4.D table), also used to tag
/// `port_set_param` requests.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortParamId {
    EnumFormat = 0,
    Format = 1,
    Buffers = 2,
    Io = 3,
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Start = 0,
    Pause = 1,
    Suspend = 2,
}

/// A memory region reference: which pool, which block within it, and the
/// byte range of interest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemRef {
    pub pool: u32,
    pub mem_id: u32,
    pub offset: u32,
    pub size: u32,
}

/// How a buffer's data plane is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaneRef {
    /// The plane is a distinct memory block, mapped on its own.
    MemId(MemRef),
    /// The plane's bytes live inline within the buffer's metadata region
    /// at this byte offset.
    MemPtr { offset: u32 },
}

#[derive(Debug, Clone)]
pub struct BufferSpec {
    pub metadata: MemRef,
    pub planes: Vec<PlaneRef>,
}

/// Direction of a port, as carried in port-addressed messages.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input = 0,
    Output = 1,
}

/// Events the graph server delivers to this client-node.
#[derive(Debug)]
pub enum ServerMessage {
    /// New rt socket for this node: `(node_id, read_fd, write_fd, activation memory)`.
    Transport {
        node_id: u32,
        read_fd: RawFd,
        write_fd: RawFd,
        activation: MemRef,
    },
    /// Binds or clears the `position`/`buffers` io region for the node as a whole.
    SetIo { id: IoId, region: Option<MemRef> },
    PortSetParam {
        dir: Direction,
        port: u32,
        id: PortParamId,
        format: Option<FormatParam>,
    },
    PortUseBuffers {
        dir: Direction,
        port: u32,
        mix: u32,
        buffers: Vec<BufferSpec>,
    },
    PortSetIo {
        dir: Direction,
        port: u32,
        mix: u32,
        id: IoId,
        region: Option<MemRef>,
    },
    SetActivation {
        node_id: u32,
        signal_fd: Option<RawFd>,
        activation: Option<MemRef>,
    },
    Command(CommandKind),
    AddPort,
    RemovePort,
    SetParam,
    Event,
}

/// Negotiated media format, parsed from a `port_set_param(Format, ...)` pod.
#[derive(Debug, Clone, PartialEq)]
pub enum FormatParam {
    Audio { rate: u32 },
    Midi,
    Video { width: u32, height: u32, fps_num: u32, fps_denom: u32 },
}

/// Replies this client sends back to the server.
#[derive(Debug)]
pub enum ClientMessage {
    /// `port_update`: re-advertise the four self-advertised params for one port.
    PortUpdate { dir: Direction, port: u32 },
    /// A request this client does not implement; carries an errno-style code.
    NotSupported { code: i32 },
    ProxyError { code: i32, message: String },
}

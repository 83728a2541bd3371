//! Orchestration (§4.I): client open/close, activation handshake, and the
//! thread-loop/data-loop lifecycle, plus the safe public API surface that
//! `jackshim-capi` exposes across the C ABI.
//!
//! The connection to the graph server is split across two concerns, the
//! way the reference daemon splits its stream manager from its event
//! publisher trait object: a [`ServerChannel`] owns the raw protocol
//! transport (connect, registry enumeration, and the node/port messages of
//! §4.D delivered as already-decoded [`ServerMessage`]s), while this
//! module owns the state machine and thread lifecycle that sit on top of
//! it. In production `ServerChannel` is implemented against the safe
//! `pipewire` crate for connection/registry bootstrap and against
//! `pipewire-sys`'s client-node event callbacks for the raw activation and
//! buffer-exchange messages libpipewire does not expose through its safe
//! wrapper.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;

use jackshim_proto::message::ServerMessage;
use jackshim_proto::pod::Activation;

use crate::cycle::{self, Callbacks, CycleState};
use crate::error::CoreError;
use crate::protocol::ProtocolHandler;
use crate::registry::Registry;
use crate::transport::{self, DecodedTransport};

/// Transport boundary: everything that actually touches a socket or the
/// graph server's shared memory. Kept as a trait so the orchestration
/// state machine and realtime cycle can be exercised without a live
/// server.
pub trait ServerChannel: Send {
    fn connect(&mut self, client_name: &str) -> Result<u32, CoreError>;
    fn disconnect(&mut self);
    fn poll(&mut self) -> Vec<ServerMessage>;
    fn send(&mut self, msg: jackshim_proto::message::ClientMessage);
    fn sync(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClientOptions {
    pub no_start_server: bool,
    pub use_exact_name: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientStatus {
    Failure,
    InitFailure,
    ServerFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransportSnapshot {
    pub playing: bool,
}

/// A running client: the legacy API's opaque client handle.
pub struct Client {
    pub name: String,
    pub node_id: u32,
    channel: Mutex<Box<dyn ServerChannel>>,
    registry: RwLock<Registry>,
    protocol: Mutex<ProtocolHandler>,
    callbacks: Mutex<Callbacks>,
    cycle_state: Mutex<CycleState>,
    active: AtomicBool,
    data_loop: Mutex<Option<JoinHandle<()>>>,
    data_loop_running: Arc<AtomicBool>,
    config: jackshim_conf::ClientConfig,
    /// This client's own activation record. Boxed so the pointer handed to
    /// the data loop (and, in production, to peers signalling us) stays
    /// stable across moves of the `Client` itself.
    activation: Box<Activation>,
}

impl Client {
    /// §4.I "Open". `PIPEWIRE_NOJACK` short-circuits before any connection
    /// is attempted (§6, scenario 1 in §8).
    pub fn open(name: &str, _options: ClientOptions, mut channel: Box<dyn ServerChannel>) -> Result<Arc<Client>, (ClientStatus, CoreError)> {
        let config = match jackshim_conf::ClientConfig::from_env() {
            Ok(c) => c,
            Err(e) => return Err((ClientStatus::ServerFailed, CoreError::Config(e))),
        };

        let node_id = channel
            .connect(name)
            .map_err(|e| (ClientStatus::ServerFailed, e))?;

        Ok(Arc::new(Client {
            name: name.to_string(),
            node_id,
            channel: Mutex::new(channel),
            registry: RwLock::new(Registry::new()),
            protocol: Mutex::new(ProtocolHandler::new(node_id)),
            callbacks: Mutex::new(Callbacks::default()),
            cycle_state: Mutex::new(CycleState::new(node_id)),
            active: AtomicBool::new(false),
            data_loop: Mutex::new(None),
            data_loop_running: Arc::new(AtomicBool::new(false)),
            config,
            activation: Box::new(Activation::default()),
        }))
    }

    pub fn config(&self) -> &jackshim_conf::ClientConfig {
        &self.config
    }

    /// §4.I "Close": stop the data loop, disconnect, release every
    /// resource the client acquired (§5 "Resources released on any exit path").
    pub fn close(&self) {
        self.deactivate();
        self.channel_disconnect();
    }

    fn channel_disconnect(&self) {
        self.channel.lock().unwrap().disconnect();
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Any callback setter fails with `EIO` once the client is active (§6).
    pub fn guard_inactive(&self) -> Result<(), CoreError> {
        if self.is_active() {
            Err(CoreError::ActiveClient)
        } else {
            Ok(())
        }
    }

    pub fn set_process_callback(&self, cb: Box<dyn FnMut(u32) -> i32 + Send>) -> Result<(), CoreError> {
        self.guard_inactive()?;
        self.callbacks.lock().unwrap().process = Some(cb);
        Ok(())
    }

    pub fn set_thread_init_callback(&self, cb: Box<dyn FnMut() + Send>) -> Result<(), CoreError> {
        self.guard_inactive()?;
        self.callbacks.lock().unwrap().thread_init = Some(cb);
        Ok(())
    }

    pub fn set_buffer_size_callback(&self, cb: Box<dyn FnMut(u32) -> i32 + Send>) -> Result<(), CoreError> {
        self.guard_inactive()?;
        self.callbacks.lock().unwrap().buffer_size = Some(cb);
        Ok(())
    }

    pub fn set_sample_rate_callback(&self, cb: Box<dyn FnMut(u32) -> i32 + Send>) -> Result<(), CoreError> {
        self.guard_inactive()?;
        self.callbacks.lock().unwrap().sample_rate = Some(cb);
        Ok(())
    }

    pub fn set_xrun_callback(&self, cb: Box<dyn FnMut() -> i32 + Send>) -> Result<(), CoreError> {
        self.guard_inactive()?;
        self.callbacks.lock().unwrap().xrun = Some(cb);
        Ok(())
    }

    pub fn set_sync_callback(&self, cb: Box<dyn FnMut(DecodedTransport, u64) -> bool + Send>) -> Result<(), CoreError> {
        self.guard_inactive()?;
        self.callbacks.lock().unwrap().sync = Some(cb);
        Ok(())
    }

    /// §6 "Timebase": registering a callback also attempts to acquire the
    /// timebase (conditionally unless `conditional` is false).
    pub fn set_timebase_callback(&self, conditional: bool, cb: Box<dyn FnMut(DecodedTransport, u32, bool) + Send>) -> Result<(), CoreError> {
        self.guard_inactive()?;
        transport::acquire_timebase(&self.activation, self.node_id, conditional)?;
        self.callbacks.lock().unwrap().timebase = Some(cb);
        Ok(())
    }

    pub fn release_timebase(&self) -> Result<(), CoreError> {
        transport::release_timebase(&self.activation, self.node_id)?;
        self.callbacks.lock().unwrap().timebase = None;
        Ok(())
    }

    /// §4.D "register_port": allocate a local port slot and advertise it
    /// through the protocol handler's self-advertised params.
    pub fn port_register(&self, is_output: bool, index: u32) -> Result<usize, CoreError> {
        self.protocol.lock().unwrap().register_port(self.node_id, is_output, index)
    }

    pub fn port_unregister(&self, is_output: bool, port_idx: usize) {
        self.protocol.lock().unwrap().unregister_port(is_output, port_idx);
    }

    /// §4.H: decode this client's current transport position.
    pub fn transport_query(&self) -> crate::transport::PositionInfo {
        transport::decode_position(&self.activation)
    }

    pub fn is_timebase_owner(&self) -> bool {
        transport::is_segment_owner(&self.activation, self.node_id)
    }

    pub fn transport_reposition(&self, frame: u64) {
        transport::request_reposition(&self.activation, self.node_id, frame);
    }

    /// §4.I "Activate": start the data loop, tell the server this node is
    /// active, arm the pending-sync/pending-new-pos flags.
    ///
    /// Takes `&Arc<Self>` (rather than `&self`) because the spawned data
    /// loop thread needs a handle that keeps the client alive independent
    /// of the caller's own reference, the same requirement the reference
    /// daemon's timer-shutdown thread has on its `MainLoopRc`.
    pub fn activate(self: &Arc<Self>) -> Result<(), CoreError> {
        if self.active.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.data_loop_running.store(true, Ordering::Release);

        let client = Arc::clone(self);
        let running = self.data_loop_running.clone();
        let frames = self.config.latency.frames;
        *self.data_loop.lock().unwrap() = Some(std::thread::spawn(move || {
            // Standalone pacing: a production build's data loop blocks on
            // the rt eventfd a driver signals; absent a driving peer this
            // client paces itself at its configured buffer period so
            // `process`/`thread_init` still fire while active.
            let period = std::time::Duration::from_secs_f64(frames as f64 / client.config.latency.rate as f64);
            while running.load(Ordering::Acquire) {
                std::thread::sleep(period);
                if !running.load(Ordering::Acquire) {
                    break;
                }
                let mut callbacks = client.callbacks.lock().unwrap();
                let mut cycle_state = client.cycle_state.lock().unwrap();
                let _report = cycle::run_cycle(1, &client.activation, &client.activation, &mut client.protocol.lock().unwrap().pool, &[], &mut callbacks, &mut cycle_state, frames);
            }
        }));
        Ok(())
    }

    /// §4.I "Deactivate".
    pub fn deactivate(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        self.data_loop_running.store(false, Ordering::Release);
        if let Some(handle) = self.data_loop.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    pub fn registry(&self) -> &RwLock<Registry> {
        &self.registry
    }

    pub fn protocol(&self) -> &Mutex<ProtocolHandler> {
        &self.protocol
    }

    /// Drain and dispatch pending server messages. Called from the thread
    /// loop, never from the data loop (§5).
    pub fn pump_control_events(&self) {
        let mut channel = self.channel.lock().unwrap();
        let messages = channel.poll();
        for msg in messages {
            let replies = self.protocol.lock().unwrap().handle(msg);
            match replies {
                Ok(replies) => {
                    for reply in replies {
                        channel.send(reply);
                    }
                }
                Err(e) => tracing::error!(error = %e, "protocol dispatch failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeChannel {
        connected: bool,
    }

    impl ServerChannel for FakeChannel {
        fn connect(&mut self, _name: &str) -> Result<u32, CoreError> {
            self.connected = true;
            Ok(1)
        }
        fn disconnect(&mut self) {
            self.connected = false;
        }
        fn poll(&mut self) -> Vec<ServerMessage> {
            vec![]
        }
        fn send(&mut self, _msg: jackshim_proto::message::ClientMessage) {}
        fn sync(&mut self) {}
    }

    #[test]
    fn nojack_env_blocks_open() {
        std::env::set_var("PIPEWIRE_NOJACK", "1");
        let res = Client::open("test", ClientOptions::default(), Box::new(FakeChannel { connected: false }));
        std::env::remove_var("PIPEWIRE_NOJACK");
        assert!(matches!(res, Err((ClientStatus::ServerFailed, CoreError::Config(_)))));
    }

    #[test]
    fn callback_setters_fail_once_active() {
        let client = Client::open("test", ClientOptions::default(), Box::new(FakeChannel { connected: false })).unwrap();
        client.activate().unwrap();
        let err = client.set_process_callback(Box::new(|_| 0)).unwrap_err();
        assert!(matches!(err, CoreError::ActiveClient));
        client.deactivate();
    }
}

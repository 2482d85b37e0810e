//! The monsoon runtime server
//!
//! One process owns the devices, the shared catalogue and the
//! compositor, and serves one active client over a Unix socket.
//! The pieces:
//!
//! * `devices` - device enumeration and the tracking origin table.
//! * `shm` - the shared memory catalogue clients map at handshake.
//! * `ipc` - listener, poller, wire codec and the client worker.
//! * `squall` - the Vulkan layer compositor (its own crate).
//!
//! The `Server` here ties them together: a strict init order, a
//! non-blocking main loop that consumes the active client's frame
//! submissions, and teardown that runs on every failure path by
//! leaning on drop order.

// The compositor driver and server lifecycle
extern crate squall;
extern crate thiserror;

pub mod debug;
pub mod devices;
pub mod ipc;
pub mod shm;

#[cfg(test)]
mod tests;

use debug::DebugRegistry;
use devices::DeviceRegistry;
use ipc::session::{ClientDeps, ClientState, LayerKind, LayerStack, SessionSlot};
use ipc::socket::Listener;
use ipc::{Event, EventPoller};
use shm::SharedCatalogue;
use squall::{BackendType, Compositor, CreateInfo, SquallError};
use utils::log;

use thiserror::Error;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// The background drawn when no client is active. Visibly not
/// black so a headset on the idle server is clearly alive.
pub const IDLE_CLEAR_COLOR: [f32; 4] = [0.1, 0.1, 0.1, 1.0];
/// The background under an active client's layer stack
pub const ACTIVE_CLEAR_COLOR: [f32; 4] = [0.0, 0.0, 0.0, 1.0];

/// Everything that can go wrong in the server core, one variant
/// per failure kind. Per-frame and per-connection kinds recover
/// locally; the rest unwind init.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("could not initialize the shared catalogue: {0}")]
    CatalogueInit(#[source] nix::errno::Errno),
    #[error("could not bind or listen on the socket: {0}")]
    ListenerBind(#[source] nix::errno::Errno),
    #[error("too many file descriptors passed by the service manager")]
    TooManyInheritedSockets,
    #[error("accept failed: {0}")]
    Accept(#[source] nix::errno::Errno),
    #[error("a client is already connected")]
    ClientAlreadyConnected,
    #[error("frame referenced an invalid swapchain")]
    FrameReconcile,
    #[error("compositor error: {0}")]
    Vulkan(#[from] SquallError),
    #[error("malformed IPC message: {0}")]
    WorkerProtocol(String),
    #[error("could not create the readiness poller: {0}")]
    PollerInit(#[source] nix::errno::Errno),
    #[error("no HMD present in device slot 0")]
    NoHmd,
}

pub type Result<T> = std::result::Result<T, ServerError>;

/// Knobs for the few things the environment does not decide
pub struct ServerOptions {
    pub so_backend: BackendType,
    /// Bind here instead of the well-known path. Inherited sockets
    /// win over both.
    pub so_socket_path: Option<PathBuf>,
    /// Overrides IPC_EXIT_ON_DISCONNECT when set
    pub so_exit_on_disconnect: Option<bool>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            so_backend: BackendType::Vulkan,
            so_socket_path: None,
            so_exit_on_disconnect: None,
        }
    }
}

/// The server singleton
///
/// Owns every process-wide resource. Field order is teardown
/// order: the session joins its worker before anything the worker
/// could still be touching goes away, and the listener unlinks its
/// socket path last.
pub struct Server {
    srv_session: SessionSlot,
    srv_debug: DebugRegistry,
    srv_poller: EventPoller,
    srv_catalogue: SharedCatalogue,
    srv_comp: Arc<Mutex<Compositor>>,
    srv_registry: Arc<Mutex<DeviceRegistry>>,
    srv_listener: Listener,
    srv_running: Arc<AtomicBool>,
    /// The disconnect policy, also copied into each session's deps
    #[allow(dead_code)]
    srv_exit_on_disconnect: bool,
}

impl Server {
    /// Bring the whole server up, in dependency order
    ///
    /// Anything that fails here unwinds the locals constructed so
    /// far in reverse order, which is exactly the teardown the
    /// completed server would run.
    pub fn init_all(opts: ServerOptions) -> Result<Server> {
        // Environment first, everything below may consult it
        let exit_on_disconnect = opts
            .so_exit_on_disconnect
            .unwrap_or_else(debug::exit_on_disconnect);

        let mut registry = DeviceRegistry::probe();
        // The compositor cannot pace itself without a display
        if registry.device(0).and_then(|d| d.hmd()).is_none() {
            return Err(ServerError::NoHmd);
        }

        let comp_info = CreateInfo::builder()
            .backend_type(opts.so_backend)
            .clear_color(IDLE_CLEAR_COLOR)
            .build();
        let comp = Compositor::new(&comp_info)?;

        // Snapshot the registry, wait-frame semaphore included
        let catalogue = SharedCatalogue::build(&mut registry)?;

        let listener = Listener::bootstrap(opts.so_socket_path)?;
        let poller = EventPoller::new(listener.fd(), !listener.activated())?;

        let running = Arc::new(AtomicBool::new(true));
        let num_devices = registry.num_devices() as u32;
        let comp = Arc::new(Mutex::new(comp));
        let registry = Arc::new(Mutex::new(registry));

        let session = SessionSlot::new(ClientDeps {
            cd_comp: comp.clone(),
            cd_registry: registry.clone(),
            cd_running: running.clone(),
            cd_exit_on_disconnect: exit_on_disconnect,
            cd_shm_fd: catalogue.fd(),
            cd_num_devices: num_devices,
        });

        let mut dbg = DebugRegistry::new("monsoon server");
        dbg.add_bool("running", running.clone());
        dbg.add_flag("exit_on_disconnect", exit_on_disconnect);
        dbg.publish();

        Ok(Server {
            srv_session: session,
            srv_debug: dbg,
            srv_poller: poller,
            srv_catalogue: catalogue,
            srv_comp: comp,
            srv_registry: registry,
            srv_listener: listener,
            srv_running: running,
            srv_exit_on_disconnect: exit_on_disconnect,
        })
    }

    /// The shared running flag; storing false stops the main loop
    /// at its next iteration boundary
    pub fn running(&self) -> Arc<AtomicBool> {
        self.srv_running.clone()
    }

    /// Handle to the compositor, shared with the session worker
    pub fn compositor(&self) -> Arc<Mutex<Compositor>> {
        self.srv_comp.clone()
    }

    /// Accept one pending connection and apply the single-client
    /// policy
    fn handle_listen(&mut self) {
        let fd = match self.srv_listener.accept() {
            Ok(fd) => fd,
            Err(e) => {
                log::error!("{}", e);
                self.srv_running.store(false, Ordering::Release);
                return;
            }
        };

        match self.srv_session.handle_accept(fd) {
            Ok(()) => log::info!("accepted new client"),
            Err(ServerError::ClientAlreadyConnected) => {
                // Non-fatal, the active session continues
                log::error!("client already connected, rejecting new connection");
            }
            Err(e) => {
                log::error!("could not start client session: {}", e);
                self.srv_running.store(false, Ordering::Release);
            }
        }
    }

    /// The steady-state loop
    ///
    /// Never blocks: polling is zero-timeout and pacing comes from
    /// the compositor. Each iteration services connection events,
    /// reconciles the active client's pending frame if there is
    /// one, then draws.
    pub fn main_loop(&mut self) {
        while self.srv_running.load(Ordering::Acquire) {
            for ev in self.srv_poller.poll() {
                match ev {
                    Event::NewConnection => self.handle_listen(),
                    Event::ShutdownRequested => {
                        log::info!("operator requested shutdown");
                        self.srv_running.store(false, Ordering::Release);
                    }
                    Event::Error(e) => {
                        log::error!("poller failed: {}", e);
                        self.srv_running.store(false, Ordering::Release);
                    }
                }
            }

            // Update the active client
            let active = self.srv_session.active_state().cloned();

            {
                let mut comp = self.srv_comp.lock().unwrap();

                match active.as_ref().filter(|s| s.num_swapchains() > 0) {
                    None => {
                        if comp.num_layers() != 0 {
                            log::debug!("destroying layers");
                            comp.destroy_layers();
                        }
                        comp.set_clear_color(IDLE_CLEAR_COLOR);
                    }
                    Some(state) => {
                        comp.set_clear_color(ACTIVE_CLEAR_COLOR);

                        // The worker fills the stack and flips
                        // rendering when the client ends a frame
                        if let Some(stack) = state.render().consume() {
                            match reconcile_layers(&mut comp, state, &stack) {
                                Ok(()) => state.render().complete(),
                                Err(e) => {
                                    // Fatal for this frame only. The
                                    // submission stays pending so a
                                    // client retry overwrites it.
                                    log::error!("skipping frame: {}", e);
                                    continue;
                                }
                            }
                        }
                    }
                }

                if let Err(e) = comp.draw() {
                    log::error!("draw failed: {}", e);
                }
                comp.garbage_collect();
            }

            // Let the client schedule its next frame
            if active.is_some() {
                self.srv_catalogue.post_wait_frame();
            }
        }

        log::info!("leaving the compositor loop");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        // Reap the worker before the things it borrows go away,
        // then null the device slots. Field drop order takes care
        // of the rest in reverse init order.
        self.srv_session.teardown();
        self.srv_registry.lock().unwrap().destroy_devices();
    }
}

/// Push one submitted frame into the compositor
///
/// Resizes the layer array when the count changed, then resolves
/// every layer's swapchain ids against the session's table. Any
/// missing swapchain or image index fails the whole frame.
fn reconcile_layers(
    comp: &mut Compositor,
    state: &ClientState,
    stack: &LayerStack,
) -> Result<()> {
    let num_layers = stack.ls_num_layers as usize;

    if num_layers != comp.num_layers() {
        comp.destroy_layers();
        comp.allocate_layers(num_layers);
    }

    for i in 0..num_layers {
        let layer = stack.ls_layers[i].ok_or(ServerError::FrameReconcile)?;
        let flip_y = layer.lr_flags.contains(ipc::session::LayerFlags::FLIP_Y);

        match layer.lr_kind {
            LayerKind::StereoProjection { l, r } => {
                let left = state.swapchain_image(layer.lr_swapchain_ids[0], l.image_index);
                let right = state.swapchain_image(layer.lr_swapchain_ids[1], r.image_index);
                let (left, right) = match (left, right) {
                    (Some(left), Some(right)) => (left, right),
                    _ => {
                        log::error!("invalid swapchain for projection layer");
                        return Err(ServerError::FrameReconcile);
                    }
                };

                comp.set_projection_layer(i, left, right, flip_y, l.array_index, r.array_index)?;
            }
            LayerKind::Quad { pose, size, sub } => {
                let image = match state.swapchain_image(layer.lr_swapchain_ids[0], sub.image_index)
                {
                    Some(image) => image,
                    None => {
                        log::error!("invalid swapchain for quad layer");
                        return Err(ServerError::FrameReconcile);
                    }
                };

                comp.set_quad_layer(i, image, pose, size, flip_y, sub.array_index)?;
            }
        }
    }

    Ok(())
}

/// The toplevel handle main() drives
pub struct Monsoon {
    mn_server: Server,
}

impl Monsoon {
    /// Bring the runtime up with the production defaults
    pub fn spin() -> Result<Monsoon> {
        Ok(Monsoon {
            mn_server: Server::init_all(ServerOptions::default())?,
        })
    }

    /// Run until shutdown is requested
    pub fn run_forever(&mut self) {
        self.mn_server.main_loop();
    }
}

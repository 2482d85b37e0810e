// Per-client session state and the worker thread
//
// There is exactly one session slot in the server. The worker owns
// the socket: it decodes framed requests, manages the client's
// swapchain table and publishes finished frames into the render
// handoff for the main loop to consume.
extern crate nix;
extern crate squall;

use crate::monsoon::devices::DeviceRegistry;
use crate::monsoon::ipc::proto::{self, Opcode};
use crate::monsoon::ServerError;
use squall::{Compositor, ImageFormat, Swapchain, SwapchainCreateInfo, SwapchainImage};
use utils::geom::{Pose, Rect, Vec2};
use utils::log;

use nix::sys::socket::{shutdown, Shutdown};
use nix::unistd;

use std::cell::UnsafeCell;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

/// Bounded size of the client-indexed swapchain table
pub const MAX_CLIENT_SWAPCHAINS: usize = 8;

bitflags! {
    /// Per-layer sampling flags
    pub struct LayerFlags: u32 {
        const UNPREMULTIPLIED_ALPHA = 1 << 0;
        const FLIP_Y = 1 << 1;
    }
}

/// Which part of a swapchain image a layer samples
#[derive(Copy, Clone, Debug)]
pub struct ViewSub {
    pub image_index: u32,
    pub array_index: u32,
    pub rect: Rect,
}

#[derive(Copy, Clone, Debug)]
pub enum LayerKind {
    StereoProjection { l: ViewSub, r: ViewSub },
    Quad { pose: Pose, size: Vec2, sub: ViewSub },
}

/// One layer of a submitted frame, in decoded form
#[derive(Copy, Clone, Debug)]
pub struct LayerRenderState {
    /// Client-space swapchain ids; only [0] is meaningful for quads
    pub lr_swapchain_ids: [u32; 2],
    pub lr_flags: LayerFlags,
    pub lr_kind: LayerKind,
}

/// The payload side of the render handoff
#[derive(Copy, Clone)]
pub struct LayerStack {
    pub ls_num_layers: u32,
    pub ls_layers: [Option<LayerRenderState>; proto::MAX_LAYERS],
}

impl LayerStack {
    pub fn empty() -> Self {
        Self {
            ls_num_layers: 0,
            ls_layers: [None; proto::MAX_LAYERS],
        }
    }
}

/// The single-slot frame handoff between worker and main loop
///
/// The worker is the only writer, the main loop the only reader.
/// `rs_rendering` gates the plain-memory stack with release/acquire
/// pairing: the worker fills the stack and then stores true, the
/// main loop observes true, reads the stack, and stores false once
/// it has reconciled. There is no queue; a later frame simply
/// replaces one the compositor has not drained yet.
pub struct RenderState {
    rs_rendering: AtomicBool,
    rs_stack: UnsafeCell<LayerStack>,
}

// WARNING
// This is only as safe as the protocol above. The worker must not
// touch the stack after its release store until the main loop's
// release store comes back around, and the client's wait-frame
// throttling is what keeps the overwrite window empty in practice.
unsafe impl Sync for RenderState {}

impl RenderState {
    fn new() -> Self {
        Self {
            rs_rendering: AtomicBool::new(false),
            rs_stack: UnsafeCell::new(LayerStack::empty()),
        }
    }

    /// Producer side: install a finished frame and flag it
    pub fn publish(&self, stack: LayerStack) {
        unsafe {
            *self.rs_stack.get() = stack;
        }
        self.rs_rendering.store(true, Ordering::Release);
    }

    pub fn is_rendering(&self) -> bool {
        self.rs_rendering.load(Ordering::Acquire)
    }

    /// Consumer side: copy out the pending frame, if there is one.
    /// The frame stays pending until `complete` is called.
    pub fn consume(&self) -> Option<LayerStack> {
        if !self.rs_rendering.load(Ordering::Acquire) {
            return None;
        }
        Some(unsafe { *self.rs_stack.get() })
    }

    /// Consumer side: hand the slot back to the producer
    pub fn complete(&self) {
        self.rs_rendering.store(false, Ordering::Release);
    }
}

/// Everything a new session needs from the server
#[derive(Clone)]
pub struct ClientDeps {
    pub cd_comp: Arc<Mutex<Compositor>>,
    pub cd_registry: Arc<Mutex<DeviceRegistry>>,
    pub cd_running: Arc<AtomicBool>,
    pub cd_exit_on_disconnect: bool,
    /// The shared catalogue fd, passed during the handshake
    pub cd_shm_fd: RawFd,
    pub cd_num_devices: u32,
}

/// Per-connection state, shared between the worker thread and the
/// main loop
pub struct ClientState {
    cs_fd: RawFd,
    /// Set once the handshake completes
    cs_active: AtomicBool,
    /// Set by the worker on its way out, cleared when the slot is
    /// reaped
    cs_stopping: AtomicBool,
    cs_render: RenderState,
    /// Swapchain handles indexed by client-assigned id
    cs_swapchains: Mutex<[Option<Swapchain>; MAX_CLIENT_SWAPCHAINS]>,
    cs_num_swapchains: AtomicU32,
    cs_deps: ClientDeps,
}

impl ClientState {
    fn new(fd: RawFd, deps: ClientDeps) -> Self {
        Self {
            cs_fd: fd,
            cs_active: AtomicBool::new(false),
            cs_stopping: AtomicBool::new(false),
            cs_render: RenderState::new(),
            cs_swapchains: Mutex::new(Default::default()),
            cs_num_swapchains: AtomicU32::new(0),
            cs_deps: deps,
        }
    }

    pub fn active(&self) -> bool {
        self.cs_active.load(Ordering::Acquire)
    }

    pub fn stopping(&self) -> bool {
        self.cs_stopping.load(Ordering::Acquire)
    }

    pub fn render(&self) -> &RenderState {
        &self.cs_render
    }

    pub fn num_swapchains(&self) -> u32 {
        self.cs_num_swapchains.load(Ordering::Acquire)
    }

    /// Copy out one image of the swapchain the client calls `id`
    pub fn swapchain_image(&self, id: u32, image_index: u32) -> Option<SwapchainImage> {
        if id as usize >= MAX_CLIENT_SWAPCHAINS {
            return None;
        }
        let table = self.cs_swapchains.lock().unwrap();
        table[id as usize]
            .as_ref()
            .and_then(|sc| sc.image(image_index as usize))
    }

    /// Hand every swapchain back to the compositor for deferred
    /// destruction. Runs when the worker exits; idempotent.
    fn release_swapchains(&self) {
        let drained: Vec<Swapchain> = {
            let mut table = self.cs_swapchains.lock().unwrap();
            table.iter_mut().filter_map(|slot| slot.take()).collect()
        };
        self.cs_num_swapchains.store(0, Ordering::Release);

        if !drained.is_empty() {
            let mut comp = self.cs_deps.cd_comp.lock().unwrap();
            for sc in drained {
                comp.destroy_swapchain(sc);
            }
        }
    }
}

impl Drop for ClientState {
    fn drop(&mut self) {
        let _ = unistd::close(self.cs_fd);
    }
}

/// The one client slot the server maintains
pub struct SessionSlot {
    ss_thread: Option<thread::JoinHandle<()>>,
    ss_state: Option<Arc<ClientState>>,
    ss_deps: ClientDeps,
}

impl SessionSlot {
    pub fn new(deps: ClientDeps) -> Self {
        Self {
            ss_thread: None,
            ss_state: None,
            ss_deps: deps,
        }
    }

    /// Single-client policy for a freshly accepted connection:
    /// reject while a worker is live, reap a stopping worker, then
    /// spawn for the new fd.
    pub fn handle_accept(&mut self, fd: RawFd) -> Result<(), ServerError> {
        if let Some(state) = &self.ss_state {
            if self.ss_thread.is_some() && !state.stopping() {
                let _ = unistd::close(fd);
                return Err(ServerError::ClientAlreadyConnected);
            }
        }

        // Reap the stopped worker before starting over
        if let Some(handle) = self.ss_thread.take() {
            let _ = handle.join();
            self.ss_state = None;
        }

        let state = Arc::new(ClientState::new(fd, self.ss_deps.clone()));
        let thread_state = state.clone();
        let handle = thread::Builder::new()
            .name("monsoon-ipc-client".to_string())
            .spawn(move || run_client(thread_state))
            .map_err(|_| ServerError::Accept(nix::errno::Errno::EAGAIN))?;

        self.ss_thread = Some(handle);
        self.ss_state = Some(state);
        Ok(())
    }

    /// The session, once its handshake has completed
    pub fn active_state(&self) -> Option<&Arc<ClientState>> {
        self.ss_state.as_ref().filter(|s| s.active())
    }

    /// Wake the worker out of its blocking read and reap it
    pub fn teardown(&mut self) {
        if let Some(state) = &self.ss_state {
            let _ = shutdown(state.cs_fd, Shutdown::Both);
        }
        if let Some(handle) = self.ss_thread.take() {
            let _ = handle.join();
        }
        self.ss_state = None;
    }
}

impl Drop for SessionSlot {
    fn drop(&mut self) {
        self.teardown();
    }
}

// ----------------------------------------------------------------
// The worker
// ----------------------------------------------------------------

/// Logged the first time a client submits a layer with a
/// non-trivial sub-rect, which the compositor does not honor yet
static SUBRECT_NOTICED: AtomicBool = AtomicBool::new(false);

/// Worker thread entry point: service one client until it leaves
pub fn run_client(state: Arc<ClientState>) {
    log::debug!("client worker starting on fd {}", state.cs_fd);

    loop {
        match proto::read_msg(state.cs_fd) {
            Ok(None) => {
                log::debug!("client disconnected");
                break;
            }
            Ok(Some((op, payload))) => match dispatch(&state, op, &payload) {
                Ok(true) => continue,
                Ok(false) => break,
                Err(e) => {
                    log::error!("client session error: {}", e);
                    break;
                }
            },
            Err(e) => {
                log::error!("malformed client message: {}", e);
                break;
            }
        }
    }

    state.cs_active.store(false, Ordering::Release);
    state.release_swapchains();

    if state.cs_deps.cd_exit_on_disconnect {
        log::info!("exit-on-disconnect is set, shutting the server down");
        state.cs_deps.cd_running.store(false, Ordering::Release);
    }

    // Last: flag the slot as reapable
    state.cs_stopping.store(true, Ordering::Release);
}

/// Handle one decoded message. Ok(false) ends the session cleanly.
fn dispatch(state: &ClientState, op: Opcode, payload: &[u8]) -> Result<bool, ServerError> {
    match op {
        Opcode::Hello => handle_hello(state, payload)?,
        Opcode::CreateSwapchain => handle_create_swapchain(state, payload)?,
        Opcode::DestroySwapchain => handle_destroy_swapchain(state, payload)?,
        Opcode::BeginFrame => {
            proto::write_msg(state.cs_fd, Opcode::Ack, &[])?;
        }
        Opcode::EndFrame => handle_end_frame(state, payload)?,
        Opcode::UpdateInputs => handle_update_inputs(state, payload)?,
        Opcode::SetOutput => handle_set_output(state, payload)?,
        Opcode::Goodbye => {
            proto::write_msg(state.cs_fd, Opcode::Ack, &[])?;
            return Ok(false);
        }
        other => {
            return Err(ServerError::WorkerProtocol(format!(
                "unexpected opcode {:?} from client",
                other
            )));
        }
    }
    Ok(true)
}

fn handle_hello(state: &ClientState, payload: &[u8]) -> Result<(), ServerError> {
    let hello: proto::HelloPayload = proto::payload_from(payload)?;
    if hello.version != proto::PROTO_VERSION {
        return Err(ServerError::WorkerProtocol(format!(
            "client speaks protocol {}, we speak {}",
            hello.version,
            proto::PROTO_VERSION
        )));
    }

    let ack = proto::HelloAckPayload {
        version: proto::PROTO_VERSION,
        num_devices: state.cs_deps.cd_num_devices,
    };
    proto::write_msg_with_fd(
        state.cs_fd,
        Opcode::HelloAck,
        proto::as_bytes(&ack),
        state.cs_deps.cd_shm_fd,
    )?;

    state.cs_active.store(true, Ordering::Release);
    log::info!("client handshake complete");
    Ok(())
}

fn handle_create_swapchain(state: &ClientState, payload: &[u8]) -> Result<(), ServerError> {
    let req: proto::CreateSwapchainPayload = proto::payload_from(payload)?;
    if req.id as usize >= MAX_CLIENT_SWAPCHAINS {
        return Err(ServerError::WorkerProtocol(format!(
            "swapchain id {} out of range",
            req.id
        )));
    }
    let format = match req.format {
        proto::FORMAT_RGBA8 => ImageFormat::Rgba8,
        proto::FORMAT_BGRA8 => ImageFormat::Bgra8,
        other => {
            return Err(ServerError::WorkerProtocol(format!(
                "unknown swapchain format {}",
                other
            )));
        }
    };

    let info = SwapchainCreateInfo {
        width: req.width,
        height: req.height,
        format: format,
        array_size: req.array_size.max(1),
    };
    let sc = state
        .cs_deps
        .cd_comp
        .lock()
        .unwrap()
        .create_swapchain(&info)?;
    let num_images = sc.num_images() as u32;

    // Replacing an id the client already used destroys the old ring
    let old = {
        let mut table = state.cs_swapchains.lock().unwrap();
        let old = table[req.id as usize].take();
        table[req.id as usize] = Some(sc);
        let live = table.iter().filter(|s| s.is_some()).count();
        state.cs_num_swapchains.store(live as u32, Ordering::Release);
        old
    };
    if let Some(old) = old {
        state.cs_deps.cd_comp.lock().unwrap().destroy_swapchain(old);
    }

    log::debug!(
        "created swapchain {} ({}x{}, {} images)",
        req.id,
        req.width,
        req.height,
        num_images
    );
    let ack = proto::SwapchainAckPayload {
        id: req.id,
        num_images: num_images,
    };
    proto::write_msg(state.cs_fd, Opcode::SwapchainAck, proto::as_bytes(&ack))
}

fn handle_destroy_swapchain(state: &ClientState, payload: &[u8]) -> Result<(), ServerError> {
    let req: proto::DestroySwapchainPayload = proto::payload_from(payload)?;
    if req.id as usize >= MAX_CLIENT_SWAPCHAINS {
        return Err(ServerError::WorkerProtocol(format!(
            "swapchain id {} out of range",
            req.id
        )));
    }

    let old = {
        let mut table = state.cs_swapchains.lock().unwrap();
        let old = table[req.id as usize].take();
        let live = table.iter().filter(|s| s.is_some()).count();
        state.cs_num_swapchains.store(live as u32, Ordering::Release);
        old
    };
    match old {
        Some(sc) => state.cs_deps.cd_comp.lock().unwrap().destroy_swapchain(sc),
        None => log::debug!("destroy of swapchain {} which does not exist", req.id),
    }

    proto::write_msg(state.cs_fd, Opcode::Ack, &[])
}

fn handle_end_frame(state: &ClientState, payload: &[u8]) -> Result<(), ServerError> {
    let frame: proto::EndFramePayload = proto::payload_from(payload)?;
    if frame.num_layers as usize > proto::MAX_LAYERS {
        return Err(ServerError::WorkerProtocol(format!(
            "frame with {} layers exceeds the limit",
            frame.num_layers
        )));
    }

    let mut stack = LayerStack::empty();
    stack.ls_num_layers = frame.num_layers;

    for i in 0..frame.num_layers as usize {
        let wire = &frame.layers[i];
        let flags = LayerFlags::from_bits_truncate(wire.flags);

        let kind = match wire.ltype {
            proto::LAYER_STEREO_PROJECTION => {
                let stereo = unsafe { wire.data.stereo };
                LayerKind::StereoProjection {
                    l: ViewSub {
                        image_index: stereo.l.image_index,
                        array_index: stereo.l.array_index,
                        rect: stereo.l.rect,
                    },
                    r: ViewSub {
                        image_index: stereo.r.image_index,
                        array_index: stereo.r.array_index,
                        rect: stereo.r.rect,
                    },
                }
            }
            proto::LAYER_QUAD => {
                let quad = unsafe { wire.data.quad };
                LayerKind::Quad {
                    pose: quad.pose,
                    size: quad.size,
                    sub: ViewSub {
                        image_index: quad.sub.image_index,
                        array_index: quad.sub.array_index,
                        rect: quad.sub.rect,
                    },
                }
            }
            other => {
                return Err(ServerError::WorkerProtocol(format!(
                    "unknown layer type {}",
                    other
                )));
            }
        };

        // Sub-rects are accepted but not yet honored by the layer
        // renderers; say so once instead of silently cropping wrong
        let has_subrect = match &kind {
            LayerKind::StereoProjection { l, r } => !l.rect.is_full() || !r.rect.is_full(),
            LayerKind::Quad { sub, .. } => !sub.rect.is_full(),
        };
        if has_subrect && !SUBRECT_NOTICED.swap(true, Ordering::Relaxed) {
            log::error!("client submitted layer sub-rects, which are ignored");
        }

        stack.ls_layers[i] = Some(LayerRenderState {
            lr_swapchain_ids: wire.swapchain_ids,
            lr_flags: flags,
            lr_kind: kind,
        });
    }

    state.cs_render.publish(stack);
    proto::write_msg(state.cs_fd, Opcode::Ack, &[])
}

fn handle_update_inputs(state: &ClientState, payload: &[u8]) -> Result<(), ServerError> {
    let req: proto::UpdateInputsPayload = proto::payload_from(payload)?;

    let mut reply = proto::InputStatePayload::new();
    {
        let mut registry = state.cs_deps.cd_registry.lock().unwrap();
        let dev = registry
            .device_mut(req.device_index as usize)
            .ok_or_else(|| {
                ServerError::WorkerProtocol(format!("no device at index {}", req.device_index))
            })?;

        dev.update_inputs();
        for (i, input) in dev.inputs().iter().take(proto::MAX_WIRE_INPUTS).enumerate() {
            reply.inputs[i] = *input;
            reply.num_inputs += 1;
        }
    }

    proto::write_msg(state.cs_fd, Opcode::InputState, proto::as_bytes(&reply))
}

fn handle_set_output(state: &ClientState, payload: &[u8]) -> Result<(), ServerError> {
    let req: proto::SetOutputPayload = proto::payload_from(payload)?;

    {
        let mut registry = state.cs_deps.cd_registry.lock().unwrap();
        let dev = registry
            .device_mut(req.device_index as usize)
            .ok_or_else(|| {
                ServerError::WorkerProtocol(format!("no device at index {}", req.device_index))
            })?;
        dev.set_output(req.name, req.vibration);
    }

    proto::write_msg(state.cs_fd, Opcode::Ack, &[])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::{AsRawFd, IntoRawFd};
    use std::os::unix::net::UnixStream;

    fn test_deps() -> (ClientDeps, RawFd) {
        let info = squall::CreateInfo::builder()
            .backend_type(squall::BackendType::Headless)
            .build();
        let comp = Arc::new(Mutex::new(Compositor::new(&info).unwrap()));
        let registry = Arc::new(Mutex::new(DeviceRegistry::probe()));
        // Stands in for the catalogue fd, the handshake is never
        // exercised here
        let (shm_fd, other) = unistd::pipe().unwrap();

        (
            ClientDeps {
                cd_comp: comp,
                cd_registry: registry,
                cd_running: Arc::new(AtomicBool::new(true)),
                cd_exit_on_disconnect: false,
                cd_shm_fd: shm_fd,
                cd_num_devices: 2,
            },
            other,
        )
    }

    #[test]
    fn second_accept_is_rejected_while_worker_lives() {
        let (deps, spare) = test_deps();
        let mut slot = SessionSlot::new(deps);

        let (first_srv, _first_client) = UnixStream::pair().unwrap();
        slot.handle_accept(first_srv.into_raw_fd()).unwrap();

        // The slot is taken: a second connection is closed on the
        // spot and the first worker keeps running
        let (second_srv, second_client) = UnixStream::pair().unwrap();
        let err = slot.handle_accept(second_srv.into_raw_fd());
        assert!(matches!(err, Err(ServerError::ClientAlreadyConnected)));
        assert!(proto::read_msg(second_client.as_raw_fd()).unwrap().is_none());

        // Only one worker was ever live
        assert!(slot.ss_thread.is_some());
        assert!(!slot.ss_state.as_ref().unwrap().stopping());

        slot.teardown();
        let _ = unistd::close(spare);
    }

    #[test]
    fn stopped_worker_is_reaped_on_the_next_accept() {
        let (deps, spare) = test_deps();
        let mut slot = SessionSlot::new(deps);

        let (first_srv, first_client) = UnixStream::pair().unwrap();
        slot.handle_accept(first_srv.into_raw_fd()).unwrap();

        // Disconnecting makes the worker exit and flag itself
        drop(first_client);
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while !slot.ss_state.as_ref().unwrap().stopping() {
            assert!(std::time::Instant::now() < deadline);
            std::thread::yield_now();
        }

        // The next accept reaps it and spawns afresh
        let (second_srv, _second_client) = UnixStream::pair().unwrap();
        slot.handle_accept(second_srv.into_raw_fd()).unwrap();
        assert!(!slot.ss_state.as_ref().unwrap().stopping());

        slot.teardown();
        let _ = unistd::close(spare);
    }

    #[test]
    fn handoff_flips_rendering_flag() {
        let rs = RenderState::new();
        assert!(!rs.is_rendering());
        assert!(rs.consume().is_none());

        let mut stack = LayerStack::empty();
        stack.ls_num_layers = 1;
        stack.ls_layers[0] = Some(LayerRenderState {
            lr_swapchain_ids: [0, 1],
            lr_flags: LayerFlags::FLIP_Y,
            lr_kind: LayerKind::Quad {
                pose: Pose::identity(),
                size: Vec2::new(1.0, 1.0),
                sub: ViewSub {
                    image_index: 0,
                    array_index: 0,
                    rect: Rect::zero(),
                },
            },
        });
        rs.publish(stack);

        assert!(rs.is_rendering());
        let consumed = rs.consume().unwrap();
        assert_eq!(consumed.ls_num_layers, 1);
        assert!(consumed.ls_layers[0].unwrap().lr_flags.contains(LayerFlags::FLIP_Y));

        // The frame stays pending until completion, and a second
        // consume sees the same stack
        assert!(rs.is_rendering());
        assert_eq!(rs.consume().unwrap().ls_num_layers, 1);

        rs.complete();
        assert!(!rs.is_rendering());
        assert!(rs.consume().is_none());
    }

    #[test]
    fn later_frame_overwrites_earlier() {
        let rs = RenderState::new();

        let mut first = LayerStack::empty();
        first.ls_num_layers = 1;
        rs.publish(first);

        let mut second = LayerStack::empty();
        second.ls_num_layers = 3;
        rs.publish(second);

        // Last writer wins; the consumer never sees the first frame
        assert_eq!(rs.consume().unwrap().ls_num_layers, 3);
    }
}

//! Server scenario tests
//!
//! These drive a real server instance over a real Unix socket,
//! with the compositor on the headless backend. Tests that build
//! the well-known shared memory object or touch the environment
//! serialize on one lock so the suite can still run in parallel
//! with the per-module unit tests.
use super::*;
use crate::monsoon::ipc::proto::{self, Opcode};
use crate::monsoon::shm::SharedLayout;
use squall::Layer;

use lazy_static::lazy_static;

use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

lazy_static! {
    static ref TEST_LOCK: Mutex<()> = Mutex::new(());
}

fn lock_server_tests() -> MutexGuard<'static, ()> {
    // A poisoned lock just means another test failed
    TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

fn test_socket_path(name: &str) -> PathBuf {
    let path = std::env::temp_dir().join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn headless_options(path: &PathBuf, exit_on_disconnect: bool) -> ServerOptions {
    ServerOptions {
        so_backend: BackendType::Headless,
        so_socket_path: Some(path.clone()),
        so_exit_on_disconnect: Some(exit_on_disconnect),
    }
}

/// Spin the server loop on its own thread, returning the handles a
/// test needs to watch and stop it
fn start_server(
    opts: ServerOptions,
) -> (
    Arc<std::sync::atomic::AtomicBool>,
    Arc<Mutex<Compositor>>,
    std::thread::JoinHandle<()>,
) {
    let mut server = Server::init_all(opts).unwrap();
    let running = server.running();
    let comp = server.compositor();
    let handle = std::thread::spawn(move || {
        server.main_loop();
        // server drops here, running full teardown
    });
    (running, comp, handle)
}

fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    panic!("timed out waiting for {}", what);
}

// ----------------------------------------------------------------
// A minimal client
// ----------------------------------------------------------------

struct TestClient {
    tc_stream: UnixStream,
}

impl TestClient {
    fn connect(path: &PathBuf) -> Self {
        Self {
            tc_stream: UnixStream::connect(path).unwrap(),
        }
    }

    fn fd(&self) -> RawFd {
        self.tc_stream.as_raw_fd()
    }

    fn expect_ack(&self) {
        let (op, _) = proto::read_msg(self.fd()).unwrap().unwrap();
        assert_eq!(op, Opcode::Ack);
    }

    /// Handshake, returning the catalogue fd the server passed us
    fn hello(&self) -> (proto::HelloAckPayload, RawFd) {
        let payload = proto::HelloPayload {
            version: proto::PROTO_VERSION,
        };
        proto::write_msg(self.fd(), Opcode::Hello, proto::as_bytes(&payload)).unwrap();

        let (op, buf, passed) = proto::read_msg_with_fd(self.fd()).unwrap().unwrap();
        assert_eq!(op, Opcode::HelloAck);
        let ack: proto::HelloAckPayload = proto::payload_from(&buf).unwrap();
        (ack, passed.expect("handshake did not pass the catalogue fd"))
    }

    fn create_swapchain(&self, id: u32) -> proto::SwapchainAckPayload {
        let payload = proto::CreateSwapchainPayload {
            id: id,
            width: 1280,
            height: 720,
            format: proto::FORMAT_RGBA8,
            array_size: 1,
        };
        proto::write_msg(self.fd(), Opcode::CreateSwapchain, proto::as_bytes(&payload)).unwrap();

        let (op, buf) = proto::read_msg(self.fd()).unwrap().unwrap();
        assert_eq!(op, Opcode::SwapchainAck);
        proto::payload_from(&buf).unwrap()
    }

    fn begin_frame(&self) {
        proto::write_msg(self.fd(), Opcode::BeginFrame, &[]).unwrap();
        self.expect_ack();
    }

    fn end_frame(&self, frame: &proto::EndFramePayload) {
        proto::write_msg(self.fd(), Opcode::EndFrame, proto::as_bytes(frame)).unwrap();
        self.expect_ack();
    }
}

fn stereo_frame(left_id: u32, right_id: u32) -> proto::EndFramePayload {
    let mut frame = proto::EndFramePayload::new();
    frame.num_layers = 1;
    frame.layers[0].ltype = proto::LAYER_STEREO_PROJECTION;
    frame.layers[0].swapchain_ids = [left_id, right_id];
    frame.layers[0].data = proto::WireLayerData {
        stereo: proto::WireStereo {
            l: proto::WireSub::full_image(0),
            r: proto::WireSub::full_image(0),
        },
    };
    frame
}

fn quad_frame(num_layers: u32, swapchain_id: u32) -> proto::EndFramePayload {
    let mut frame = proto::EndFramePayload::new();
    frame.num_layers = num_layers;
    for i in 0..num_layers as usize {
        frame.layers[i].ltype = proto::LAYER_QUAD;
        frame.layers[i].swapchain_ids = [swapchain_id, 0];
        frame.layers[i].data = proto::WireLayerData {
            quad: proto::WireQuad {
                pose: utils::geom::Pose::identity(),
                size: utils::geom::Vec2::new(1.0, 1.0),
                sub: proto::WireSub::full_image(0),
            },
        };
    }
    frame
}

// ----------------------------------------------------------------
// Scenarios
// ----------------------------------------------------------------

#[test]
fn cold_start_draws_idle_frames() {
    let _guard = lock_server_tests();
    let path = test_socket_path("monsoon_e2e_cold.sock");

    let (running, comp, handle) = start_server(headless_options(&path, false));
    assert!(path.exists());

    // With nobody connected the compositor still ticks, on the
    // idle background
    wait_until("idle frames", || comp.lock().unwrap().frames_drawn() >= 2);
    assert_eq!(comp.lock().unwrap().clear_color(), IDLE_CLEAR_COLOR);
    assert_eq!(comp.lock().unwrap().num_layers(), 0);

    running.store(false, Ordering::Release);
    handle.join().unwrap();

    // Teardown left nothing on disk
    assert!(!path.exists());
    let err = nix::sys::mman::shm_open(
        shm::SHM_NAME,
        nix::fcntl::OFlag::O_RDWR,
        nix::sys::stat::Mode::S_IRUSR,
    )
    .unwrap_err();
    assert_eq!(err, nix::errno::Errno::ENOENT);
}

#[test]
fn two_inherited_sockets_fail_init() {
    let _guard = lock_server_tests();

    std::env::set_var("LISTEN_PID", std::process::id().to_string());
    std::env::set_var("LISTEN_FDS", "2");
    let result = Server::init_all(headless_options(
        &test_socket_path("monsoon_e2e_actv.sock"),
        false,
    ));
    std::env::remove_var("LISTEN_PID");
    std::env::remove_var("LISTEN_FDS");

    assert!(matches!(result, Err(ServerError::TooManyInheritedSockets)));

    // The partially initialized server unwound: no shm object and
    // no socket file remain
    let err = nix::sys::mman::shm_open(
        shm::SHM_NAME,
        nix::fcntl::OFlag::O_RDWR,
        nix::sys::stat::Mode::S_IRUSR,
    )
    .unwrap_err();
    assert_eq!(err, nix::errno::Errno::ENOENT);
}

#[test]
fn single_client_lifecycle() {
    let _guard = lock_server_tests();
    let path = test_socket_path("monsoon_e2e_single.sock");

    let (_running, comp, handle) = start_server(headless_options(&path, true));

    {
        let client = TestClient::connect(&path);
        let (ack, shm_fd) = client.hello();
        assert_eq!(ack.version, proto::PROTO_VERSION);
        assert_eq!(ack.num_devices, 2);

        // The passed fd maps to the device catalogue
        let size = std::mem::size_of::<SharedLayout>();
        let ptr = unsafe {
            nix::sys::mman::mmap(
                None,
                std::num::NonZeroUsize::new(size).unwrap(),
                nix::sys::mman::ProtFlags::PROT_READ | nix::sys::mman::ProtFlags::PROT_WRITE,
                nix::sys::mman::MapFlags::MAP_SHARED,
                shm_fd,
                0,
            )
            .unwrap()
        };
        let ism = ptr as *mut SharedLayout;
        assert_eq!(unsafe { (*ism).num_idevs }, 2);
        assert!(unsafe { (*ism).hmd[0].display.w_pixels } > 0);

        let sc = client.create_swapchain(0);
        assert!(sc.num_images > 0);
        client.create_swapchain(1);

        client.begin_frame();
        client.end_frame(&stereo_frame(0, 1));

        // The main loop reconciles exactly one projection layer
        // and keeps drawing
        wait_until("projection layer", || {
            let comp = comp.lock().unwrap();
            comp.num_layers() == 1
                && matches!(comp.layers()[0], Some(Layer::Projection { .. }))
        });
        let drawn = comp.lock().unwrap().frames_drawn();
        wait_until("more frames", || {
            comp.lock().unwrap().frames_drawn() > drawn
        });
        assert_eq!(comp.lock().unwrap().clear_color(), ACTIVE_CLEAR_COLOR);

        // Completed frames post the wait-frame semaphore the
        // client blocks on
        wait_until("wait-frame post", || unsafe {
            libc::sem_trywait(std::ptr::addr_of_mut!((*ism).wait_frame.sem)) == 0
        });

        unsafe {
            nix::sys::mman::munmap(ptr, size).unwrap();
        }
        let _ = nix::unistd::close(shm_fd);
        // client drops here: disconnect
    }

    // exit_on_disconnect brings the whole server down cleanly
    handle.join().unwrap();
    assert!(!path.exists());
}

#[test]
fn second_client_is_rejected() {
    let _guard = lock_server_tests();
    let path = test_socket_path("monsoon_e2e_double.sock");

    let (running, _comp, handle) = start_server(headless_options(&path, false));

    let client_a = TestClient::connect(&path);
    client_a.hello();

    // B's fd is closed by the server without a byte of protocol
    let client_b = TestClient::connect(&path);
    assert!(proto::read_msg(client_b.fd()).unwrap().is_none());

    // A is undisturbed
    client_a.begin_frame();

    running.store(false, Ordering::Release);
    handle.join().unwrap();
}

#[test]
fn invalid_swapchain_skips_the_frame() {
    let _guard = lock_server_tests();
    let path = test_socket_path("monsoon_e2e_badsc.sock");

    let (running, comp, handle) = start_server(headless_options(&path, false));

    let client = TestClient::connect(&path);
    client.hello();
    client.create_swapchain(0);

    // Reference swapchain ids nothing was created under. The frame
    // must be skipped without a crash, and draws stall while the
    // bad submission is pending.
    client.end_frame(&stereo_frame(5, 6));
    std::thread::sleep(Duration::from_millis(50));
    let stalled_at = comp.lock().unwrap().frames_drawn();
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(comp.lock().unwrap().frames_drawn(), stalled_at);

    // A valid resubmission overwrites the bad frame and rendering
    // resumes
    client.end_frame(&stereo_frame(0, 0));
    wait_until("recovery", || {
        let comp = comp.lock().unwrap();
        comp.frames_drawn() > stalled_at
            && matches!(comp.layers().first(), Some(Some(Layer::Projection { .. })))
    });

    running.store(false, Ordering::Release);
    handle.join().unwrap();
}

#[test]
fn layer_count_change_reallocates() {
    let _guard = lock_server_tests();
    let path = test_socket_path("monsoon_e2e_count.sock");

    let (running, comp, handle) = start_server(headless_options(&path, false));

    let client = TestClient::connect(&path);
    client.hello();
    client.create_swapchain(0);

    client.end_frame(&quad_frame(2, 0));
    wait_until("two layers", || comp.lock().unwrap().num_layers() == 2);

    client.end_frame(&quad_frame(3, 0));
    wait_until("three layers", || {
        let comp = comp.lock().unwrap();
        comp.num_layers() == 3 && comp.layers().iter().all(|l| l.is_some())
    });

    running.store(false, Ordering::Release);
    handle.join().unwrap();
}

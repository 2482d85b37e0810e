// The wire codec
//
// Every message is an 8 byte header followed by a fixed repr(C)
// payload. The handshake reply additionally carries the shared
// catalogue fd as SCM_RIGHTS ancillary data, which is why the
// reading side goes through recvmsg for the header.
//
// Both directions of the protocol live here; the client half is
// exercised by the test suites and by out-of-tree client libraries.
extern crate nix;

use crate::monsoon::devices::{Input, Vibration};
use crate::monsoon::ServerError;
use utils::geom::{Pose, Rect, Vec2};

use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};
use nix::unistd;

use std::io::{IoSlice, IoSliceMut};
use std::mem::size_of;
use std::os::unix::io::RawFd;

pub const PROTO_VERSION: u32 = 1;
/// Most layers one frame submission can carry
pub const MAX_LAYERS: usize = 16;
/// Most input records one InputState reply can carry
pub const MAX_WIRE_INPUTS: usize = 16;
/// Upper bound on any framed payload, for sanity checking headers
pub const MAX_MSG_SIZE: usize = 64 * 1024;

#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Opcode {
    // client to server
    Hello = 1,
    CreateSwapchain = 2,
    DestroySwapchain = 3,
    BeginFrame = 4,
    EndFrame = 5,
    UpdateInputs = 6,
    SetOutput = 7,
    Goodbye = 8,
    // server to client
    HelloAck = 100,
    SwapchainAck = 101,
    Ack = 102,
    InputState = 103,
}

impl Opcode {
    pub fn from_u32(raw: u32) -> Option<Opcode> {
        match raw {
            1 => Some(Opcode::Hello),
            2 => Some(Opcode::CreateSwapchain),
            3 => Some(Opcode::DestroySwapchain),
            4 => Some(Opcode::BeginFrame),
            5 => Some(Opcode::EndFrame),
            6 => Some(Opcode::UpdateInputs),
            7 => Some(Opcode::SetOutput),
            8 => Some(Opcode::Goodbye),
            100 => Some(Opcode::HelloAck),
            101 => Some(Opcode::SwapchainAck),
            102 => Some(Opcode::Ack),
            103 => Some(Opcode::InputState),
            _ => None,
        }
    }
}

#[repr(C)]
#[derive(Copy, Clone)]
struct MsgHeader {
    op: u32,
    len: u32,
}

// ----------------------------------------------------------------
// Payloads
// ----------------------------------------------------------------

#[repr(C)]
#[derive(Copy, Clone)]
pub struct HelloPayload {
    pub version: u32,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct HelloAckPayload {
    pub version: u32,
    pub num_devices: u32,
}

pub const FORMAT_RGBA8: u32 = 1;
pub const FORMAT_BGRA8: u32 = 2;

#[repr(C)]
#[derive(Copy, Clone)]
pub struct CreateSwapchainPayload {
    /// Client-assigned swapchain id
    pub id: u32,
    pub width: u32,
    pub height: u32,
    pub format: u32,
    pub array_size: u32,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct SwapchainAckPayload {
    pub id: u32,
    pub num_images: u32,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct DestroySwapchainPayload {
    pub id: u32,
}

pub const LAYER_STEREO_PROJECTION: u32 = 1;
pub const LAYER_QUAD: u32 = 2;

pub const LAYER_FLAG_UNPREMULTIPLIED_ALPHA: u32 = 1 << 0;
pub const LAYER_FLAG_FLIP_Y: u32 = 1 << 1;

/// Where in a swapchain image a layer samples from
#[repr(C)]
#[derive(Copy, Clone)]
pub struct WireSub {
    pub image_index: u32,
    pub array_index: u32,
    pub rect: Rect,
}

impl WireSub {
    pub fn full_image(image_index: u32) -> Self {
        Self {
            image_index: image_index,
            array_index: 0,
            rect: Rect::zero(),
        }
    }
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct WireStereo {
    pub l: WireSub,
    pub r: WireSub,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct WireQuad {
    pub pose: Pose,
    pub size: Vec2,
    pub sub: WireSub,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub union WireLayerData {
    pub stereo: WireStereo,
    pub quad: WireQuad,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct WireLayer {
    pub ltype: u32,
    pub swapchain_ids: [u32; 2],
    pub flags: u32,
    pub data: WireLayerData,
}

impl WireLayer {
    pub fn empty() -> Self {
        Self {
            ltype: 0,
            swapchain_ids: [0, 0],
            flags: 0,
            data: WireLayerData {
                quad: WireQuad {
                    pose: Pose::identity(),
                    size: Vec2::new(0.0, 0.0),
                    sub: WireSub::full_image(0),
                },
            },
        }
    }
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct EndFramePayload {
    pub num_layers: u32,
    pub layers: [WireLayer; MAX_LAYERS],
}

impl EndFramePayload {
    pub fn new() -> Self {
        Self {
            num_layers: 0,
            layers: [WireLayer::empty(); MAX_LAYERS],
        }
    }
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct UpdateInputsPayload {
    pub device_index: u32,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct InputStatePayload {
    pub num_inputs: u32,
    pub inputs: [Input; MAX_WIRE_INPUTS],
}

impl InputStatePayload {
    pub fn new() -> Self {
        Self {
            num_inputs: 0,
            inputs: [Input::new(0); MAX_WIRE_INPUTS],
        }
    }
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct SetOutputPayload {
    pub device_index: u32,
    pub name: u32,
    pub vibration: Vibration,
}

// ----------------------------------------------------------------
// Encoding helpers
// ----------------------------------------------------------------

/// View any payload struct as its wire bytes
pub fn as_bytes<T: Copy>(t: &T) -> &[u8] {
    unsafe { std::slice::from_raw_parts(t as *const T as *const u8, size_of::<T>()) }
}

/// Decode a payload struct out of received bytes
///
/// The length must match exactly; a short or long payload is a
/// protocol violation, not something to be lenient about.
pub fn payload_from<T: Copy>(buf: &[u8]) -> Result<T, ServerError> {
    if buf.len() != size_of::<T>() {
        return Err(ServerError::WorkerProtocol(format!(
            "payload size {} does not match expected {}",
            buf.len(),
            size_of::<T>()
        )));
    }
    Ok(unsafe { std::ptr::read_unaligned(buf.as_ptr() as *const T) })
}

// ----------------------------------------------------------------
// Socket IO
// ----------------------------------------------------------------

/// Fill `buf` completely. Ok(false) means the peer closed before
/// the first byte, i.e. a clean end of stream.
fn read_bytes(fd: RawFd, buf: &mut [u8]) -> Result<bool, ServerError> {
    let mut done = 0;
    while done < buf.len() {
        match unistd::read(fd, &mut buf[done..]) {
            Ok(0) => {
                if done == 0 {
                    return Ok(false);
                }
                return Err(ServerError::WorkerProtocol(
                    "peer closed mid-message".to_string(),
                ));
            }
            Ok(n) => done += n,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => {
                return Err(ServerError::WorkerProtocol(format!("read failed: {}", e)));
            }
        }
    }
    Ok(true)
}

fn write_bytes(fd: RawFd, buf: &[u8]) -> Result<(), ServerError> {
    let mut done = 0;
    while done < buf.len() {
        match unistd::write(fd, &buf[done..]) {
            Ok(n) => done += n,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => {
                return Err(ServerError::WorkerProtocol(format!("write failed: {}", e)));
            }
        }
    }
    Ok(())
}

fn parse_header(buf: &[u8; size_of::<MsgHeader>()]) -> Result<(Opcode, usize), ServerError> {
    let header: MsgHeader = payload_from(buf)?;

    let op = Opcode::from_u32(header.op).ok_or_else(|| {
        ServerError::WorkerProtocol(format!("unknown opcode {}", header.op))
    })?;
    if header.len as usize > MAX_MSG_SIZE {
        return Err(ServerError::WorkerProtocol(format!(
            "oversized message of {} bytes",
            header.len
        )));
    }

    Ok((op, header.len as usize))
}

/// Read one framed message. None on a clean disconnect.
pub fn read_msg(fd: RawFd) -> Result<Option<(Opcode, Vec<u8>)>, ServerError> {
    let mut hdr_buf = [0u8; size_of::<MsgHeader>()];
    if !read_bytes(fd, &mut hdr_buf)? {
        return Ok(None);
    }
    let (op, len) = parse_header(&hdr_buf)?;

    let mut payload = vec![0u8; len];
    if len > 0 && !read_bytes(fd, &mut payload)? {
        return Err(ServerError::WorkerProtocol(
            "peer closed mid-message".to_string(),
        ));
    }

    Ok(Some((op, payload)))
}

/// Read one framed message, also collecting a passed fd if the
/// peer attached one to the header.
pub fn read_msg_with_fd(
    fd: RawFd,
) -> Result<Option<(Opcode, Vec<u8>, Option<RawFd>)>, ServerError> {
    let mut hdr_buf = [0u8; size_of::<MsgHeader>()];
    let mut received_fd = None;
    let mut got: usize;

    {
        let mut cmsg_buf = nix::cmsg_space!([RawFd; 1]);
        let mut iov = [IoSliceMut::new(&mut hdr_buf)];
        let msg = loop {
            match recvmsg::<nix::sys::socket::UnixAddr>(
                fd,
                &mut iov,
                Some(&mut cmsg_buf),
                MsgFlags::empty(),
            ) {
                Ok(m) => break m,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => {
                    return Err(ServerError::WorkerProtocol(format!("recvmsg failed: {}", e)));
                }
            }
        };

        for cmsg in msg.cmsgs() {
            if let ControlMessageOwned::ScmRights(fds) = cmsg {
                received_fd = fds.first().copied();
            }
        }
        got = msg.bytes;
    }

    if got == 0 {
        return Ok(None);
    }
    // The kernel may split the header; the fd always rides on the
    // first segment
    if got < hdr_buf.len() {
        let mut rest = [0u8; size_of::<MsgHeader>()];
        if !read_bytes(fd, &mut rest[..hdr_buf.len() - got])? {
            return Err(ServerError::WorkerProtocol(
                "peer closed mid-message".to_string(),
            ));
        }
        let missing = hdr_buf.len() - got;
        hdr_buf.copy_within(0..got, 0);
        hdr_buf[got..].copy_from_slice(&rest[..missing]);
        got = hdr_buf.len();
    }
    debug_assert_eq!(got, hdr_buf.len());

    let (op, len) = parse_header(&hdr_buf)?;
    let mut payload = vec![0u8; len];
    if len > 0 && !read_bytes(fd, &mut payload)? {
        return Err(ServerError::WorkerProtocol(
            "peer closed mid-message".to_string(),
        ));
    }

    Ok(Some((op, payload, received_fd)))
}

/// Send one framed message
pub fn write_msg(fd: RawFd, op: Opcode, payload: &[u8]) -> Result<(), ServerError> {
    let header = MsgHeader {
        op: op as u32,
        len: payload.len() as u32,
    };

    write_bytes(fd, as_bytes(&header))?;
    write_bytes(fd, payload)
}

/// Send one framed message with `pass_fd` attached to the header
/// as SCM_RIGHTS
pub fn write_msg_with_fd(
    fd: RawFd,
    op: Opcode,
    payload: &[u8],
    pass_fd: RawFd,
) -> Result<(), ServerError> {
    let header = MsgHeader {
        op: op as u32,
        len: payload.len() as u32,
    };
    let mut msg = Vec::with_capacity(size_of::<MsgHeader>() + payload.len());
    msg.extend_from_slice(as_bytes(&header));
    msg.extend_from_slice(payload);

    let fds = [pass_fd];
    let cmsgs = [ControlMessage::ScmRights(&fds)];
    let iov = [IoSlice::new(&msg)];

    let sent = loop {
        match sendmsg::<nix::sys::socket::UnixAddr>(fd, &iov, &cmsgs, MsgFlags::empty(), None) {
            Ok(n) => break n,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => {
                return Err(ServerError::WorkerProtocol(format!("sendmsg failed: {}", e)));
            }
        }
    };

    if sent < msg.len() {
        write_bytes(fd, &msg[sent..])?;
    }
    Ok(())
}

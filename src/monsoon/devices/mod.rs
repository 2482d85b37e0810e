//! # Device enumeration
//!
//! The registry owns every tracked device the runtime exposes and
//! the table of tracking origins they are expressed in. Devices
//! reference their origin by a stable index into the registry's
//! origin table; nothing in the tree holds owning pointers across
//! that boundary.
//!
//! The input and output records are plain repr(C) data because they
//! are copied verbatim into the shared catalogue and onto the wire.
//!
//! Only the built-in null drivers live here. Hardware drivers hook
//! in through the same `Device` trait.

extern crate utils as mn_utils;

use mn_utils::geom::{Fov, Pose};
use mn_utils::log;
use mn_utils::timing::get_current_nanos;

/// Bounded capacity of the device table, and of the tracking origin
/// table (every device could in principle bring its own origin)
pub const NUM_XDEVS: usize = 8;

/// What a device is, as advertised to clients
#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DeviceName {
    GenericHmd = 1,
    SimpleController = 2,
}

/// How a tracking origin derives its poses
#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OriginType {
    Unknown = 0,
    /// Orientation only, from an IMU
    Imu3Dof = 1,
    /// Full 6-DoF from external trackers
    OutsideIn = 2,
}

/// Well-known input identifiers
pub mod input_name {
    pub const HEAD_POSE: u32 = 1;
    pub const TRIGGER_VALUE: u32 = 2;
    pub const GRIP_POSE: u32 = 3;
}

/// Well-known output identifiers
pub mod output_name {
    pub const HAPTIC: u32 = 1;
}

/// The value of one input, interpreted according to the input's
/// name
#[repr(C)]
#[derive(Copy, Clone)]
pub union InputValue {
    pub vec1: f32,
    pub vec2: [f32; 2],
    pub vec3: [f32; 3],
    pub pose: Pose,
}

/// One input sample. `active` is nonzero when the device is
/// currently delivering data for this input.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct Input {
    pub active: u32,
    pub timestamp_ns: i64,
    pub name: u32,
    pub value: InputValue,
}

impl Input {
    pub fn new(name: u32) -> Self {
        Self {
            active: 0,
            timestamp_ns: 0,
            name: name,
            value: InputValue {
                pose: Pose::identity(),
            },
        }
    }
}

/// Haptic feedback parameters
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Vibration {
    pub frequency: f32,
    pub amplitude: f32,
    pub duration_ns: i64,
}

impl Vibration {
    pub fn off() -> Self {
        Self {
            frequency: 0.0,
            amplitude: 0.0,
            duration_ns: 0,
        }
    }
}

/// One output slot on a device
#[repr(C)]
#[derive(Copy, Clone)]
pub struct Output {
    pub name: u32,
    pub vibration: Vibration,
}

/// Pixel dimensions of one eye's display
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ViewDisplay {
    pub w_pixels: u32,
    pub h_pixels: u32,
}

/// One eye: its display and its frustum
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct View {
    pub display: ViewDisplay,
    pub fov: Fov,
}

/// The HMD sub-record carried by head mounted devices
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct HmdViews {
    pub views: [View; 2],
}

/// A named 6-DoF reference frame shared by one or more devices
pub struct TrackingOrigin {
    pub to_name: String,
    pub to_type: OriginType,
    pub to_offset: Pose,
}

/// One tracked device
///
/// Implementations poll their hardware in `update_inputs` and leave
/// the latest samples in the slice returned by `inputs`.
pub trait Device: Send {
    fn name(&self) -> DeviceName;
    fn str_name(&self) -> &str;
    /// Index of this device's origin in the registry's origin table
    fn tracking_origin(&self) -> usize;
    fn hmd(&self) -> Option<&HmdViews>;
    fn inputs(&self) -> &[Input];
    fn outputs(&self) -> &[Output];
    /// Refresh the input samples from the hardware
    fn update_inputs(&mut self);
    /// Apply an output, e.g. start a haptic pulse
    fn set_output(&mut self, name: u32, value: Vibration);
}

/// The device enumeration root
pub struct DeviceRegistry {
    /// Dense origin table. Devices hold indices into this.
    dr_origins: Vec<TrackingOrigin>,
    dr_devices: [Option<Box<dyn Device>>; NUM_XDEVS],
}

impl DeviceRegistry {
    /// Enumerate devices
    ///
    /// There is no hardware discovery yet so this always selects
    /// the null drivers: an HMD in slot 0 and one controller.
    pub fn probe() -> Self {
        let mut reg = Self {
            dr_origins: Vec::new(),
            dr_devices: Default::default(),
        };

        let head = reg.add_origin(TrackingOrigin {
            to_name: "Null head tracker".to_string(),
            to_type: OriginType::Imu3Dof,
            to_offset: Pose::identity(),
        });
        let hand = reg.add_origin(TrackingOrigin {
            to_name: "Null hand tracker".to_string(),
            to_type: OriginType::OutsideIn,
            to_offset: Pose::identity(),
        });

        reg.dr_devices[0] = Some(Box::new(NullHmd::new(head)));
        reg.dr_devices[1] = Some(Box::new(NullController::new(hand)));

        log::info!("probed {} null devices", reg.num_devices());
        reg
    }

    pub fn add_origin(&mut self, origin: TrackingOrigin) -> usize {
        assert!(self.dr_origins.len() < NUM_XDEVS);
        self.dr_origins.push(origin);
        self.dr_origins.len() - 1
    }

    pub fn origins(&self) -> &[TrackingOrigin] {
        &self.dr_origins
    }

    pub fn device(&self, index: usize) -> Option<&dyn Device> {
        self.dr_devices.get(index).and_then(|d| d.as_deref())
    }

    pub fn device_mut(&mut self, index: usize) -> Option<&mut (dyn Device + 'static)> {
        self.dr_devices.get_mut(index).and_then(|d| d.as_deref_mut())
    }

    pub fn num_devices(&self) -> usize {
        self.dr_devices.iter().filter(|d| d.is_some()).count()
    }

    /// Drop every device, nulling its slot. Called during server
    /// teardown before the enumeration root itself goes away.
    pub fn destroy_devices(&mut self) {
        for slot in self.dr_devices.iter_mut() {
            *slot = None;
        }
    }
}

// ----------------------------------------------------------------
// Null drivers
// ----------------------------------------------------------------

/// A stationary head mounted display
///
/// Reports two 1280x720 views with a symmetric 90 degree frustum
/// and an identity head pose.
pub struct NullHmd {
    nh_origin: usize,
    nh_views: HmdViews,
    nh_inputs: [Input; 1],
}

impl NullHmd {
    pub fn new(origin: usize) -> Self {
        let view = View {
            display: ViewDisplay {
                w_pixels: 1280,
                h_pixels: 720,
            },
            fov: Fov::symmetric(std::f32::consts::FRAC_PI_4),
        };

        Self {
            nh_origin: origin,
            nh_views: HmdViews {
                views: [view, view],
            },
            nh_inputs: [Input::new(input_name::HEAD_POSE)],
        }
    }
}

impl Device for NullHmd {
    fn name(&self) -> DeviceName {
        DeviceName::GenericHmd
    }

    fn str_name(&self) -> &str {
        "Null HMD"
    }

    fn tracking_origin(&self) -> usize {
        self.nh_origin
    }

    fn hmd(&self) -> Option<&HmdViews> {
        Some(&self.nh_views)
    }

    fn inputs(&self) -> &[Input] {
        &self.nh_inputs
    }

    fn outputs(&self) -> &[Output] {
        &[]
    }

    fn update_inputs(&mut self) {
        self.nh_inputs[0].active = 1;
        self.nh_inputs[0].timestamp_ns = get_current_nanos();
        self.nh_inputs[0].value = InputValue {
            pose: Pose::identity(),
        };
    }

    fn set_output(&mut self, name: u32, _value: Vibration) {
        log::debug!("null hmd has no output {}", name);
    }
}

/// A controller with a trigger, a grip pose and one haptic output
pub struct NullController {
    nc_origin: usize,
    nc_inputs: [Input; 2],
    nc_outputs: [Output; 1],
}

impl NullController {
    pub fn new(origin: usize) -> Self {
        Self {
            nc_origin: origin,
            nc_inputs: [
                Input::new(input_name::TRIGGER_VALUE),
                Input::new(input_name::GRIP_POSE),
            ],
            nc_outputs: [Output {
                name: output_name::HAPTIC,
                vibration: Vibration::off(),
            }],
        }
    }
}

impl Device for NullController {
    fn name(&self) -> DeviceName {
        DeviceName::SimpleController
    }

    fn str_name(&self) -> &str {
        "Null Controller"
    }

    fn tracking_origin(&self) -> usize {
        self.nc_origin
    }

    fn hmd(&self) -> Option<&HmdViews> {
        None
    }

    fn inputs(&self) -> &[Input] {
        &self.nc_inputs
    }

    fn outputs(&self) -> &[Output] {
        &self.nc_outputs
    }

    fn update_inputs(&mut self) {
        let now = get_current_nanos();
        self.nc_inputs[0].active = 1;
        self.nc_inputs[0].timestamp_ns = now;
        self.nc_inputs[0].value = InputValue { vec1: 0.0 };
        self.nc_inputs[1].active = 1;
        self.nc_inputs[1].timestamp_ns = now;
        self.nc_inputs[1].value = InputValue {
            pose: Pose::identity(),
        };
    }

    fn set_output(&mut self, name: u32, value: Vibration) {
        if name == output_name::HAPTIC {
            self.nc_outputs[0].vibration = value;
        } else {
            log::debug!("null controller has no output {}", name);
        }
    }
}

//! # The Squall composition toolkit.
//!
//! Squall owns the layer stack that an XR compositor renders each
//! frame. A consumer creates swapchains (rings of GPU images), fills
//! an ordered array of composition layers referencing those images,
//! and calls `draw` once per frame. Squall validates the stack,
//! clears the frame target and hands the layers to the backend.
//!
//! Two backends are provided:
//! * `vulkan` - the real thing. Creates an instance and device with
//!   ash and serializes all queue work behind a mutex.
//! * `headless` - allocates image ids only and counts frames. This
//!   is what the test suites run against so they do not need an ICD
//!   or a display.
//!
//! The per-layer sampling pipelines and shader modules live above
//! this crate, next to the display engine that presents the frame
//! target. Squall stops at a cleared, layer-validated frame.
#![allow(non_camel_case_types)]

extern crate ash;
extern crate thiserror;
extern crate utils;

use thiserror::Error;
use utils::geom::{Pose, Vec2};
use utils::log;

mod headless;
mod vulkan;

pub use headless::HeadlessBackend;
pub use vulkan::VkBackend;

pub type Result<T> = std::result::Result<T, SquallError>;

/// Squall error codes
/// These signify that action should be taken by the app.
#[derive(Error, Eq, PartialEq, Debug)]
pub enum SquallError {
    #[error("The Vulkan library could not be loaded")]
    LOADER_NOT_AVAILABLE,
    #[error("No physical device exposes a graphics queue")]
    NO_SUITABLE_GPU,
    #[error("Vulkan call failed: {0}")]
    VK_CALL_FAILED(#[from] ash::vk::Result),
    #[error("Allocation failure")]
    OUT_OF_MEMORY,
    #[error("The referenced swapchain image does not exist")]
    SWAPCHAIN_NOT_FOUND,
    #[error("Layer index is outside the allocated layer array")]
    INVALID_LAYER,
}

/// Which backend a Compositor should be driven by
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BackendType {
    Vulkan,
    Headless,
}

/// Parameters for Compositor creation
pub struct CreateInfo {
    pub backend_type: BackendType,
    /// The clear color drawn under the layer stack
    pub clear_color: [f32; 4],
}

impl CreateInfo {
    pub fn builder() -> CreateInfoBuilder {
        CreateInfoBuilder {
            ci: CreateInfo {
                backend_type: BackendType::Vulkan,
                clear_color: [0.0, 0.0, 0.0, 1.0],
            },
        }
    }
}

/// Implements the builder pattern for easier compositor creation
pub struct CreateInfoBuilder {
    ci: CreateInfo,
}

impl CreateInfoBuilder {
    pub fn backend_type(mut self, ty: BackendType) -> Self {
        self.ci.backend_type = ty;
        self
    }

    pub fn clear_color(mut self, color: [f32; 4]) -> Self {
        self.ci.clear_color = color;
        self
    }

    pub fn build(self) -> CreateInfo {
        self.ci
    }
}

/// Requested dimensions for one swapchain
#[derive(Copy, Clone, Debug)]
pub struct SwapchainCreateInfo {
    pub width: u32,
    pub height: u32,
    pub format: ImageFormat,
    /// Number of array layers in each image, 1 for a plain 2D image
    pub array_size: u32,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ImageFormat {
    Rgba8,
    Bgra8,
}

/// An opaque backend image handle
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct ImageId(u64);

impl ImageId {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub(crate) fn raw(&self) -> u64 {
        self.0
    }
}

/// One image out of a swapchain's ring
///
/// This is a value type so the consumer can copy it out of a locked
/// table and hand it to layer operations without holding locks.
#[derive(Copy, Clone, Debug)]
pub struct SwapchainImage {
    si_id: ImageId,
    si_width: u32,
    si_height: u32,
    si_array_size: u32,
}

impl SwapchainImage {
    pub fn dims(&self) -> (u32, u32) {
        (self.si_width, self.si_height)
    }

    pub fn array_size(&self) -> u32 {
        self.si_array_size
    }
}

/// A ring of images a client rotates through while rendering
pub struct Swapchain {
    sc_images: Vec<SwapchainImage>,
}

impl Swapchain {
    pub fn num_images(&self) -> usize {
        self.sc_images.len()
    }

    /// Copy out the image at `index`, if it exists
    pub fn image(&self, index: usize) -> Option<SwapchainImage> {
        self.sc_images.get(index).copied()
    }
}

/// One slot in the layer stack
///
/// The stack is ordered back to front. Every variant carries copies
/// of the swapchain images it samples so the stack stays valid even
/// if the owning table changes under it.
#[derive(Copy, Clone, Debug)]
pub enum Layer {
    Projection {
        left: SwapchainImage,
        right: SwapchainImage,
        flip_y: bool,
        left_array: u32,
        right_array: u32,
    },
    Quad {
        image: SwapchainImage,
        pose: Pose,
        size: Vec2,
        flip_y: bool,
        array_index: u32,
    },
}

impl Layer {
    /// Every image id this layer samples from
    fn image_ids(&self) -> [Option<ImageId>; 2] {
        match self {
            Layer::Projection { left, right, .. } => [Some(left.si_id), Some(right.si_id)],
            Layer::Quad { image, .. } => [Some(image.si_id), None],
        }
    }
}

/// The backend seam
///
/// Backends own the actual image storage and the frame target. They
/// never see swapchains or sessions, only image ids and the layer
/// slice for one frame.
pub trait Backend {
    fn create_image(&mut self, info: &SwapchainCreateInfo) -> Result<ImageId>;
    fn destroy_image(&mut self, id: ImageId);
    /// How many images each swapchain ring gets on this backend
    fn images_per_swapchain(&self) -> usize;
    fn draw(&mut self, layers: &[Option<Layer>], clear: [f32; 4]) -> Result<()>;
    /// Block until the device has finished all outstanding work
    fn wait_idle(&mut self);
}

/// The composition engine
///
/// Owns the current layer array, the swapchain image lifetimes and
/// the backend. Shared between the server's worker thread (swapchain
/// creation) and main loop (layer updates and drawing) behind one
/// mutex; the backend's internal queue mutex serializes the GPU.
pub struct Compositor {
    cp_backend: Box<dyn Backend + Send>,
    cp_layers: Vec<Option<Layer>>,
    cp_clear_color: [f32; 4],
    /// Image ids waiting for the device to go idle before they can
    /// be freed
    cp_gc: Vec<ImageId>,
    cp_frames: u64,
}

impl Compositor {
    pub fn new(info: &CreateInfo) -> Result<Compositor> {
        let backend: Box<dyn Backend + Send> = match info.backend_type {
            BackendType::Vulkan => Box::new(VkBackend::new()?),
            BackendType::Headless => Box::new(HeadlessBackend::new()),
        };

        Ok(Compositor {
            cp_backend: backend,
            cp_layers: Vec::new(),
            cp_clear_color: info.clear_color,
            cp_gc: Vec::new(),
            cp_frames: 0,
        })
    }

    /// Allocate a ring of images for a client swapchain
    pub fn create_swapchain(&mut self, info: &SwapchainCreateInfo) -> Result<Swapchain> {
        let count = self.cp_backend.images_per_swapchain();
        let mut images = Vec::with_capacity(count);

        for _ in 0..count {
            match self.cp_backend.create_image(info) {
                Ok(id) => images.push(SwapchainImage {
                    si_id: id,
                    si_width: info.width,
                    si_height: info.height,
                    si_array_size: info.array_size,
                }),
                Err(e) => {
                    // Roll back whatever we managed to create
                    for img in images {
                        self.cp_backend.destroy_image(img.si_id);
                    }
                    return Err(e);
                }
            }
        }

        Ok(Swapchain { sc_images: images })
    }

    /// Queue a swapchain's images for destruction
    ///
    /// The images are not freed until `garbage_collect` has had a
    /// chance to idle the device.
    pub fn destroy_swapchain(&mut self, sc: Swapchain) {
        for img in sc.sc_images {
            self.cp_gc.push(img.si_id);
        }
    }

    pub fn num_layers(&self) -> usize {
        self.cp_layers.len()
    }

    /// Replace the layer array with `count` empty slots
    pub fn allocate_layers(&mut self, count: usize) {
        self.cp_layers = vec![None; count];
    }

    pub fn destroy_layers(&mut self) {
        self.cp_layers.clear();
    }

    pub fn set_projection_layer(
        &mut self,
        index: usize,
        left: SwapchainImage,
        right: SwapchainImage,
        flip_y: bool,
        left_array: u32,
        right_array: u32,
    ) -> Result<()> {
        let slot = self
            .cp_layers
            .get_mut(index)
            .ok_or(SquallError::INVALID_LAYER)?;
        *slot = Some(Layer::Projection {
            left: left,
            right: right,
            flip_y: flip_y,
            left_array: left_array,
            right_array: right_array,
        });
        Ok(())
    }

    pub fn set_quad_layer(
        &mut self,
        index: usize,
        image: SwapchainImage,
        pose: Pose,
        size: Vec2,
        flip_y: bool,
        array_index: u32,
    ) -> Result<()> {
        let slot = self
            .cp_layers
            .get_mut(index)
            .ok_or(SquallError::INVALID_LAYER)?;
        *slot = Some(Layer::Quad {
            image: image,
            pose: pose,
            size: size,
            flip_y: flip_y,
            array_index: array_index,
        });
        Ok(())
    }

    pub fn set_clear_color(&mut self, color: [f32; 4]) {
        self.cp_clear_color = color;
    }

    pub fn clear_color(&self) -> [f32; 4] {
        self.cp_clear_color
    }

    /// The current layer array, for introspection and tests
    pub fn layers(&self) -> &[Option<Layer>] {
        &self.cp_layers
    }

    /// Render one frame: clear the target, then composite the stack
    pub fn draw(&mut self) -> Result<()> {
        self.cp_backend.draw(&self.cp_layers, self.cp_clear_color)?;
        self.cp_frames += 1;
        Ok(())
    }

    /// Total number of frames successfully drawn
    pub fn frames_drawn(&self) -> u64 {
        self.cp_frames
    }

    /// Now is a good time to destroy objects
    ///
    /// Deferred swapchain destruction happens here so that in-flight
    /// frames never lose their images. The device is idled once per
    /// batch, not per image.
    pub fn garbage_collect(&mut self) {
        if self.cp_gc.is_empty() {
            return;
        }

        self.cp_backend.wait_idle();
        for id in self.cp_gc.drain(..) {
            self.cp_backend.destroy_image(id);
        }
    }
}

impl Drop for Compositor {
    fn drop(&mut self) {
        // Flush any swapchains still queued for destruction. The
        // backend idles the device again in its own drop before it
        // frees live images.
        if !self.cp_gc.is_empty() {
            log::debug!("compositor drop: collecting {} images", self.cp_gc.len());
            self.garbage_collect();
        }
    }
}

#[cfg(test)]
mod tests;

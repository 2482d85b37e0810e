// The Vulkan backend
//
// This layer is very low, and as a result is mostly unsafe. Nothing
// unsafe/vulkan/ash should be exposed to upper layers.
//
// One queue is created in the first graphics-capable family. All
// submissions and device idles go through vb_queue's mutex, which is
// what lets the server's worker thread and main loop share one
// device safely.
use ash::{vk, Entry};

use crate::{Backend, ImageFormat, ImageId, Layer, Result, SquallError, SwapchainCreateInfo};
use utils::log;

use std::collections::HashMap;
use std::ffi::CString;
use std::sync::Mutex;

/// The frame target dimensions. The display engine scans out from
/// this image; its size is independent of any client swapchain.
const TARGET_WIDTH: u32 = 1280;
const TARGET_HEIGHT: u32 = 720;

/// One backing image: the handle, its memory and a view for
/// sampling
struct VkImage {
    i_image: vk::Image,
    i_mem: vk::DeviceMemory,
    i_view: vk::ImageView,
}

pub struct VkBackend {
    /// the entry just loads function pointers from the dynamic
    /// library, it has to outlive everything else
    _vb_entry: Entry,
    vb_inst: ash::Instance,
    vb_pdev: vk::PhysicalDevice,
    vb_dev: ash::Device,
    vb_mem_props: vk::PhysicalDeviceMemoryProperties,
    /// All queue submissions and waits are serialized here
    vb_queue: Mutex<vk::Queue>,
    vb_cmd_pool: vk::CommandPool,
    vb_cbuf: vk::CommandBuffer,
    vb_submit_fence: vk::Fence,
    /// The offscreen frame target that gets cleared every draw
    vb_target: VkImage,
    /// Live client images, keyed by their id
    vb_images: HashMap<u64, VkImage>,
    vb_next_id: u64,
}

// The ash handles are all plain ids underneath
unsafe impl Send for VkBackend {}

impl VkBackend {
    /// Choose a queue family
    ///
    /// returns an index into the array of queue types
    fn select_queue_family(
        inst: &ash::Instance,
        pdev: vk::PhysicalDevice,
    ) -> Option<u32> {
        unsafe { inst.get_physical_device_queue_family_properties(pdev) }
            .iter()
            .enumerate()
            .find(|(_, info)| info.queue_flags.contains(vk::QueueFlags::GRAPHICS))
            .map(|(index, _)| index as u32)
    }

    /// Choose a vkPhysicalDevice with a graphics-capable queue
    /// family
    fn select_pdev(inst: &ash::Instance) -> Result<(vk::PhysicalDevice, u32)> {
        let pdevs = unsafe { inst.enumerate_physical_devices()? };

        pdevs
            .iter()
            .find_map(|pdev| Self::select_queue_family(inst, *pdev).map(|f| (*pdev, f)))
            .ok_or(SquallError::NO_SUITABLE_GPU)
    }

    pub fn new() -> Result<Self> {
        let entry = unsafe { Entry::load().map_err(|_| SquallError::LOADER_NOT_AVAILABLE)? };

        let app_name = CString::new("squall").unwrap();
        let appinfo = vk::ApplicationInfo::builder()
            .application_name(&app_name)
            .application_version(0)
            .engine_name(&app_name)
            .engine_version(0)
            .api_version(vk::API_VERSION_1_1);
        let create_info = vk::InstanceCreateInfo::builder().application_info(&appinfo);

        let inst = unsafe { entry.create_instance(&create_info, None)? };

        let (pdev, queue_family) = match Self::select_pdev(&inst) {
            Ok(p) => p,
            Err(e) => {
                unsafe { inst.destroy_instance(None) };
                return Err(e);
            }
        };
        let mem_props = unsafe { inst.get_physical_device_memory_properties(pdev) };

        // for now we only have one graphics queue, so one priority
        let priorities = [1.0];
        let queue_infos = [vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(queue_family)
            .queue_priorities(&priorities)
            .build()];
        let dev_create_info = vk::DeviceCreateInfo::builder().queue_create_infos(&queue_infos);

        let dev = match unsafe { inst.create_device(pdev, &dev_create_info, None) } {
            Ok(d) => d,
            Err(e) => {
                unsafe { inst.destroy_instance(None) };
                return Err(SquallError::VK_CALL_FAILED(e));
            }
        };
        let queue = unsafe { dev.get_device_queue(queue_family, 0) };

        let pool_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(queue_family);
        let cmd_pool = unsafe { dev.create_command_pool(&pool_info, None)? };

        let cbuf_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(cmd_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let cbuf = unsafe { dev.allocate_command_buffers(&cbuf_info)?[0] };

        let fence_info = vk::FenceCreateInfo::builder();
        let fence = unsafe { dev.create_fence(&fence_info, None)? };

        let mut ret = Self {
            _vb_entry: entry,
            vb_inst: inst,
            vb_pdev: pdev,
            vb_dev: dev,
            vb_mem_props: mem_props,
            vb_queue: Mutex::new(queue),
            vb_cmd_pool: cmd_pool,
            vb_cbuf: cbuf,
            vb_submit_fence: fence,
            vb_target: VkImage {
                i_image: vk::Image::null(),
                i_mem: vk::DeviceMemory::null(),
                i_view: vk::ImageView::null(),
            },
            vb_images: HashMap::new(),
            vb_next_id: 1,
        };

        ret.vb_target = ret.alloc_image(
            TARGET_WIDTH,
            TARGET_HEIGHT,
            vk::Format::B8G8R8A8_UNORM,
            vk::ImageUsageFlags::COLOR_ATTACHMENT
                | vk::ImageUsageFlags::TRANSFER_DST
                | vk::ImageUsageFlags::TRANSFER_SRC,
            1,
        )?;

        Ok(ret)
    }

    /// Find a memory type index satisfying `reqs` and `flags`
    fn find_memory_type(
        &self,
        reqs: &vk::MemoryRequirements,
        flags: vk::MemoryPropertyFlags,
    ) -> Option<u32> {
        for i in 0..self.vb_mem_props.memory_type_count {
            if reqs.memory_type_bits & (1 << i) != 0
                && self.vb_mem_props.memory_types[i as usize]
                    .property_flags
                    .contains(flags)
            {
                return Some(i);
            }
        }
        None
    }

    fn alloc_image(
        &mut self,
        width: u32,
        height: u32,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        array_size: u32,
    ) -> Result<VkImage> {
        let extent = vk::Extent3D {
            width: width,
            height: height,
            depth: 1,
        };

        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(extent)
            .mip_levels(1)
            .array_layers(array_size)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image = unsafe { self.vb_dev.create_image(&image_info, None)? };

        let reqs = unsafe { self.vb_dev.get_image_memory_requirements(image) };
        let mem_type = match self.find_memory_type(&reqs, vk::MemoryPropertyFlags::DEVICE_LOCAL) {
            Some(t) => t,
            None => {
                unsafe { self.vb_dev.destroy_image(image, None) };
                return Err(SquallError::OUT_OF_MEMORY);
            }
        };

        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(reqs.size)
            .memory_type_index(mem_type);
        let mem = match unsafe { self.vb_dev.allocate_memory(&alloc_info, None) } {
            Ok(m) => m,
            Err(e) => {
                unsafe { self.vb_dev.destroy_image(image, None) };
                return Err(SquallError::VK_CALL_FAILED(e));
            }
        };
        unsafe { self.vb_dev.bind_image_memory(image, mem, 0)? };

        let view_type = if array_size > 1 {
            vk::ImageViewType::TYPE_2D_ARRAY
        } else {
            vk::ImageViewType::TYPE_2D
        };
        let view_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(view_type)
            .format(format)
            .subresource_range(
                vk::ImageSubresourceRange::builder()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .base_mip_level(0)
                    .level_count(1)
                    .base_array_layer(0)
                    .layer_count(array_size)
                    .build(),
            );
        let view = unsafe { self.vb_dev.create_image_view(&view_info, None)? };

        Ok(VkImage {
            i_image: image,
            i_mem: mem,
            i_view: view,
        })
    }

    fn free_image(&self, img: &VkImage) {
        unsafe {
            self.vb_dev.destroy_image_view(img.i_view, None);
            self.vb_dev.destroy_image(img.i_image, None);
            self.vb_dev.free_memory(img.i_mem, None);
        }
    }
}

impl Backend for VkBackend {
    fn create_image(&mut self, info: &SwapchainCreateInfo) -> Result<ImageId> {
        let format = match info.format {
            ImageFormat::Rgba8 => vk::Format::R8G8B8A8_UNORM,
            ImageFormat::Bgra8 => vk::Format::B8G8R8A8_UNORM,
        };

        let img = self.alloc_image(
            info.width,
            info.height,
            format,
            vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
            info.array_size.max(1),
        )?;

        let id = self.vb_next_id;
        self.vb_next_id += 1;
        self.vb_images.insert(id, img);

        Ok(ImageId::new(id))
    }

    fn destroy_image(&mut self, id: ImageId) {
        if let Some(img) = self.vb_images.remove(&id.raw()) {
            self.free_image(&img);
        }
    }

    fn images_per_swapchain(&self) -> usize {
        // Triple buffered so a client can have one image queued,
        // one being sampled and one being rendered
        3
    }

    fn draw(&mut self, layers: &[Option<Layer>], clear: [f32; 4]) -> Result<()> {
        // The stack must only reference images we still own
        for layer in layers.iter().flatten() {
            for id in layer.image_ids().iter().flatten() {
                if !self.vb_images.contains_key(&id.raw()) {
                    return Err(SquallError::SWAPCHAIN_NOT_FOUND);
                }
            }
        }

        let queue = self.vb_queue.lock().unwrap();
        unsafe {
            self.vb_dev.reset_command_buffer(
                self.vb_cbuf,
                vk::CommandBufferResetFlags::RELEASE_RESOURCES,
            )?;

            let record_info = vk::CommandBufferBeginInfo::builder()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            self.vb_dev.begin_command_buffer(self.vb_cbuf, &record_info)?;

            // Move the target into a clearable layout. The previous
            // contents are about to be overwritten, so UNDEFINED is
            // accurate and lets the driver skip a copy.
            let range = vk::ImageSubresourceRange::builder()
                .aspect_mask(vk::ImageAspectFlags::COLOR)
                .base_mip_level(0)
                .level_count(1)
                .base_array_layer(0)
                .layer_count(1)
                .build();
            let barrier = vk::ImageMemoryBarrier::builder()
                .image(self.vb_target.i_image)
                .old_layout(vk::ImageLayout::UNDEFINED)
                .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                .src_access_mask(vk::AccessFlags::empty())
                .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .subresource_range(range)
                .build();
            self.vb_dev.cmd_pipeline_barrier(
                self.vb_cbuf,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );

            let clear_value = vk::ClearColorValue { float32: clear };
            self.vb_dev.cmd_clear_color_image(
                self.vb_cbuf,
                self.vb_target.i_image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &clear_value,
                &[range],
            );

            self.vb_dev.end_command_buffer(self.vb_cbuf)?;

            let cbufs = [self.vb_cbuf];
            let submits = [vk::SubmitInfo::builder().command_buffers(&cbufs).build()];
            self.vb_dev
                .queue_submit(*queue, &submits, self.vb_submit_fence)?;
            self.vb_dev
                .wait_for_fences(&[self.vb_submit_fence], true, u64::MAX)?;
            self.vb_dev.reset_fences(&[self.vb_submit_fence])?;
        }

        Ok(())
    }

    fn wait_idle(&mut self) {
        let _queue = self.vb_queue.lock().unwrap();
        if let Err(e) = unsafe { self.vb_dev.device_wait_idle() } {
            log::error!("vkDeviceWaitIdle failed: {:?}", e);
        }
    }
}

// Clean up after ourselves when the backend gets destroyed.
//
// Things are destroyed in roughly the reverse order that they were
// created in.
impl Drop for VkBackend {
    fn drop(&mut self) {
        self.wait_idle();
        unsafe {
            for (_, img) in self.vb_images.drain().collect::<Vec<_>>() {
                self.vb_dev.destroy_image_view(img.i_view, None);
                self.vb_dev.destroy_image(img.i_image, None);
                self.vb_dev.free_memory(img.i_mem, None);
            }
            self.vb_dev.destroy_image_view(self.vb_target.i_view, None);
            self.vb_dev.destroy_image(self.vb_target.i_image, None);
            self.vb_dev.free_memory(self.vb_target.i_mem, None);

            self.vb_dev.destroy_fence(self.vb_submit_fence, None);
            self.vb_dev.destroy_command_pool(self.vb_cmd_pool, None);
            self.vb_dev.destroy_device(None);
            self.vb_inst.destroy_instance(None);
        }
    }
}

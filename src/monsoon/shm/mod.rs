//! # The shared device catalogue
//!
//! At startup the server snapshots the device registry into a
//! shared memory object that every client maps. The layout is
//! position stable repr(C) data: devices reference their tracking
//! origin by index and their inputs and outputs as ranges into two
//! global flat arrays. Nothing pointer-shaped crosses the process
//! boundary.
//!
//! The object's name is unlinked as soon as it is mapped, so the
//! only way in is the fd handed over during the connection
//! handshake.
//!
//! The wait-frame semaphore lives at the end of the region. It is
//! process shared: clients block on it and the server posts it each
//! time the compositor finishes a frame.

extern crate libc;
extern crate nix;

use crate::monsoon::devices::{DeviceRegistry, Input, Output, View, NUM_XDEVS};
use crate::monsoon::ServerError;
use utils::geom::Pose;
use utils::log;

use nix::fcntl::OFlag;
use nix::sys::mman;
use nix::sys::stat::Mode;
use nix::unistd;

use std::num::NonZeroUsize;
use std::os::unix::io::RawFd;

pub const SHM_NAME: &str = "/monsoon_shm";
pub const MAX_INPUTS: usize = 1024;
pub const MAX_OUTPUTS: usize = 128;
/// Size of the name buffers in the shared tables
pub const NAME_LEN: usize = 256;
/// Marks an unresolved index slot
pub const INDEX_SENTINEL: u32 = u32::MAX;

#[repr(C)]
#[derive(Copy, Clone)]
pub struct SharedTrackingOrigin {
    pub name: [u8; NAME_LEN],
    pub otype: u32,
    pub offset: Pose,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct SharedDevice {
    pub name: u32,
    pub str_name: [u8; NAME_LEN],
    /// Index into the itracks table, never a pointer
    pub tracking_origin_index: u32,
    /// Zeroed (w_pixels == 0) when the device is not an HMD
    pub hmd_views: [View; 2],
    pub first_input_index: u32,
    pub num_inputs: u32,
    pub first_output_index: u32,
    pub num_outputs: u32,
}

#[repr(C)]
pub struct WaitFrame {
    pub sem: libc::sem_t,
}

/// The complete cross-process layout
#[repr(C)]
pub struct SharedLayout {
    pub itracks: [SharedTrackingOrigin; NUM_XDEVS],
    pub num_itracks: u32,
    pub idevs: [SharedDevice; NUM_XDEVS],
    pub num_idevs: u32,
    pub inputs: [Input; MAX_INPUTS],
    pub outputs: [Output; MAX_OUTPUTS],
    /// Convenience copy of the first HMD's views
    pub hmd: [View; 2],
    pub wait_frame: WaitFrame,
}

fn copy_name(dst: &mut [u8; NAME_LEN], src: &str) {
    let bytes = src.as_bytes();
    let n = bytes.len().min(NAME_LEN - 1);
    dst[..n].copy_from_slice(&bytes[..n]);
    // the rest of the buffer is already zeroed
}

/// The published catalogue
///
/// Owns the mapping and the fd for its whole lifetime; the fd is
/// what gets passed to clients.
pub struct SharedCatalogue {
    scm_fd: RawFd,
    scm_ptr: *mut SharedLayout,
}

// The region is written once during build and read-only afterwards,
// and the semaphore is operated on atomically by the OS.
unsafe impl Send for SharedCatalogue {}

impl SharedCatalogue {
    /// Snapshot `registry` into a fresh shared memory object
    pub fn build(registry: &mut DeviceRegistry) -> Result<SharedCatalogue, ServerError> {
        Self::build_named(registry, SHM_NAME)
    }

    pub(crate) fn build_named(
        registry: &mut DeviceRegistry,
        name: &str,
    ) -> Result<SharedCatalogue, ServerError> {
        let size = std::mem::size_of::<SharedLayout>();

        let fd = mman::shm_open(
            name,
            OFlag::O_CREAT | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(ServerError::CatalogueInit)?;

        if let Err(e) = unistd::ftruncate(fd, size as i64) {
            let _ = unistd::close(fd);
            let _ = mman::shm_unlink(name);
            return Err(ServerError::CatalogueInit(e));
        }

        let ptr = match unsafe {
            mman::mmap(
                None,
                NonZeroUsize::new(size).unwrap(),
                mman::ProtFlags::PROT_READ | mman::ProtFlags::PROT_WRITE,
                mman::MapFlags::MAP_SHARED,
                fd,
                0,
            )
        } {
            Ok(p) => p as *mut SharedLayout,
            Err(e) => {
                let _ = unistd::close(fd);
                let _ = mman::shm_unlink(name);
                return Err(ServerError::CatalogueInit(e));
            }
        };

        // We have a filehandle now, clients receive it over the
        // socket rather than through the filesystem
        let _ = mman::shm_unlink(name);

        // Process-shared semaphore, initially zero
        let ret = unsafe {
            libc::sem_init(
                std::ptr::addr_of_mut!((*ptr).wait_frame.sem),
                1, /* pshared */
                0,
            )
        };
        if ret != 0 {
            unsafe {
                let _ = mman::munmap(ptr as *mut _, size);
            }
            let _ = unistd::close(fd);
            return Err(ServerError::CatalogueInit(nix::errno::Errno::last()));
        }

        let cat = SharedCatalogue {
            scm_fd: fd,
            scm_ptr: ptr,
        };
        cat.populate(registry);

        log::info!("published shared catalogue, {} bytes", size);
        Ok(cat)
    }

    /// Fill in the mapped layout from the registry
    ///
    /// Two sweeps over the device array: the first builds the dense
    /// tracking origin table, the second writes the device entries
    /// and packs their inputs and outputs into the flat arrays.
    fn populate(&self, registry: &mut DeviceRegistry) {
        let ism = unsafe { &mut *self.scm_ptr };

        // Running table mapping dense slots back to registry origin
        // indices. First-empty-slot insertion keeps it dense and
        // deduplicated.
        let mut used: [Option<usize>; NUM_XDEVS] = [None; NUM_XDEVS];

        for i in 0..NUM_XDEVS {
            let dev = match registry.device(i) {
                Some(d) => d,
                None => continue,
            };
            let origin = dev.tracking_origin();

            for slot in used.iter_mut() {
                match slot {
                    None => {
                        *slot = Some(origin);
                        break;
                    }
                    Some(o) if *o == origin => break,
                    Some(_) => continue,
                }
            }
        }

        let mut count = 0;
        for slot in used.iter() {
            let origin = match slot {
                Some(o) => &registry.origins()[*o],
                None => continue,
            };

            let itrack = &mut ism.itracks[count];
            copy_name(&mut itrack.name, &origin.to_name);
            itrack.otype = origin.to_type as u32;
            itrack.offset = origin.to_offset;
            count += 1;
        }
        assert!(count <= NUM_XDEVS);
        ism.num_itracks = count as u32;

        // Second sweep: the device entries themselves
        let mut count = 0;
        let mut input_index: usize = 0;
        let mut output_index: usize = 0;
        let mut wrote_hmd = false;

        for i in 0..NUM_XDEVS {
            // Refresh so clients see a valid initial sample set
            if let Some(dev) = registry.device_mut(i) {
                dev.update_inputs();
            }
            let dev = match registry.device(i) {
                Some(d) => d,
                None => continue,
            };

            let idev = &mut ism.idevs[count];
            count += 1;

            idev.name = dev.name() as u32;
            copy_name(&mut idev.str_name, dev.str_name());

            if let Some(hmd) = dev.hmd() {
                idev.hmd_views = hmd.views;
                if !wrote_hmd {
                    ism.hmd = hmd.views;
                    wrote_hmd = true;
                }
            }

            // Resolve the origin to its dense slot
            idev.tracking_origin_index = INDEX_SENTINEL;
            for (k, slot) in used.iter().enumerate() {
                if *slot == Some(dev.tracking_origin()) {
                    idev.tracking_origin_index = k as u32;
                    break;
                }
            }
            assert!(idev.tracking_origin_index != INDEX_SENTINEL);

            // Pack inputs into the flat array
            let input_start = input_index;
            for input in dev.inputs() {
                assert!(input_index < MAX_INPUTS);
                ism.inputs[input_index] = *input;
                input_index += 1;
            }
            if input_start != input_index {
                idev.first_input_index = input_start as u32;
                idev.num_inputs = (input_index - input_start) as u32;
            }

            // And the outputs
            let output_start = output_index;
            for output in dev.outputs() {
                assert!(output_index < MAX_OUTPUTS);
                ism.outputs[output_index] = *output;
                output_index += 1;
            }
            if output_start != output_index {
                idev.first_output_index = output_start as u32;
                idev.num_outputs = (output_index - output_start) as u32;
            }
        }

        // Finally tell the client how many devices we have
        ism.num_idevs = count as u32;
    }

    /// The inheritable fd clients map the catalogue from
    pub fn fd(&self) -> RawFd {
        self.scm_fd
    }

    pub fn layout(&self) -> &SharedLayout {
        unsafe { &*self.scm_ptr }
    }

    /// Signal frame completion to the waiting client
    pub fn post_wait_frame(&self) {
        unsafe {
            libc::sem_post(std::ptr::addr_of_mut!((*self.scm_ptr).wait_frame.sem));
        }
    }
}

impl Drop for SharedCatalogue {
    fn drop(&mut self) {
        unsafe {
            libc::sem_destroy(std::ptr::addr_of_mut!((*self.scm_ptr).wait_frame.sem));
            let _ = mman::munmap(
                self.scm_ptr as *mut _,
                std::mem::size_of::<SharedLayout>(),
            );
        }
        let _ = unistd::close(self.scm_fd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monsoon::devices::DeviceName;

    // Each test maps its own uniquely named object so the suite can
    // run in parallel.
    fn build(name: &str) -> (DeviceRegistry, SharedCatalogue) {
        let mut reg = DeviceRegistry::probe();
        let cat = SharedCatalogue::build_named(&mut reg, name).unwrap();
        (reg, cat)
    }

    #[test]
    fn origin_indices_are_in_range() {
        let (_reg, cat) = build("/monsoon_test_origins");
        let ism = cat.layout();

        assert!(ism.num_idevs > 0);
        for i in 0..ism.num_idevs as usize {
            assert!(ism.idevs[i].tracking_origin_index < ism.num_itracks);
        }
    }

    #[test]
    fn input_ranges_are_disjoint_and_bounded() {
        let (_reg, cat) = build("/monsoon_test_ranges");
        let ism = cat.layout();

        let mut seen: Vec<(u32, u32)> = Vec::new();
        for i in 0..ism.num_idevs as usize {
            let d = &ism.idevs[i];
            assert!(d.first_input_index as usize + d.num_inputs as usize <= MAX_INPUTS);
            assert!(d.first_output_index as usize + d.num_outputs as usize <= MAX_OUTPUTS);

            if d.num_inputs == 0 {
                continue;
            }
            let range = (d.first_input_index, d.first_input_index + d.num_inputs);
            for (lo, hi) in seen.iter() {
                assert!(range.1 <= *lo || range.0 >= *hi);
            }
            seen.push(range);
        }
    }

    #[test]
    fn name_is_unlinked_after_build() {
        let name = "/monsoon_test_unlink";
        let (_reg, _cat) = build(name);

        // Opening without O_CREAT must fail now
        let err = mman::shm_open(name, OFlag::O_RDWR, Mode::S_IRUSR).unwrap_err();
        assert_eq!(err, nix::errno::Errno::ENOENT);
    }

    #[test]
    fn second_mapping_reads_back_the_snapshot() {
        let (reg, cat) = build("/monsoon_test_remap");
        let size = std::mem::size_of::<SharedLayout>();

        let ptr = unsafe {
            mman::mmap(
                None,
                std::num::NonZeroUsize::new(size).unwrap(),
                mman::ProtFlags::PROT_READ,
                mman::MapFlags::MAP_SHARED,
                cat.fd(),
                0,
            )
            .unwrap()
        };
        let remapped = unsafe { &*(ptr as *const SharedLayout) };

        assert_eq!(remapped.num_idevs, reg.num_devices() as u32);
        assert_eq!(remapped.num_itracks, reg.origins().len() as u32);
        assert_eq!(remapped.idevs[0].name, DeviceName::GenericHmd as u32);
        assert_eq!(remapped.hmd[0].display.w_pixels, 1280);

        // Names are nul-padded utf8
        let name = &remapped.itracks[0].name;
        let end = name.iter().position(|b| *b == 0).unwrap();
        assert_eq!(&name[..end], b"Null head tracker");

        unsafe {
            mman::munmap(ptr, size).unwrap();
        }
    }

    #[test]
    fn wait_frame_semaphore_posts() {
        let (_reg, cat) = build("/monsoon_test_sem");

        cat.post_wait_frame();
        cat.post_wait_frame();

        let mut value = 0;
        unsafe {
            let sem = std::ptr::addr_of_mut!((*cat.scm_ptr).wait_frame.sem);
            libc::sem_getvalue(sem, &mut value);
        }
        assert_eq!(value, 2);
    }
}

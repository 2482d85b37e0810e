// Headless backend
//
// Used by test suites and by environments with no GPU. Images are
// ids with no storage behind them; draws only validate the stack
// and record what would have been rendered.
use crate::{Backend, ImageId, Layer, Result, SquallError, SwapchainCreateInfo};

use std::collections::HashSet;

pub struct HeadlessBackend {
    hb_live: HashSet<u64>,
    hb_next_id: u64,
    hb_frames: u64,
    hb_last_clear: [f32; 4],
}

impl HeadlessBackend {
    pub fn new() -> Self {
        Self {
            hb_live: HashSet::new(),
            hb_next_id: 1,
            hb_frames: 0,
            hb_last_clear: [0.0; 4],
        }
    }
}

impl Backend for HeadlessBackend {
    fn create_image(&mut self, _info: &SwapchainCreateInfo) -> Result<ImageId> {
        let id = self.hb_next_id;
        self.hb_next_id += 1;
        self.hb_live.insert(id);
        Ok(ImageId::new(id))
    }

    fn destroy_image(&mut self, id: ImageId) {
        self.hb_live.remove(&id.raw());
    }

    fn images_per_swapchain(&self) -> usize {
        // Double buffered is plenty when nothing is displayed
        2
    }

    fn draw(&mut self, layers: &[Option<Layer>], clear: [f32; 4]) -> Result<()> {
        for layer in layers.iter().flatten() {
            for id in layer.image_ids().iter().flatten() {
                if !self.hb_live.contains(&id.raw()) {
                    return Err(SquallError::SWAPCHAIN_NOT_FOUND);
                }
            }
        }

        self.hb_frames += 1;
        self.hb_last_clear = clear;
        Ok(())
    }

    fn wait_idle(&mut self) {}
}

use ash::vk;
use itertools::Itertools;

use crate::commands::{command_buffer::GfxCommandBuffer, semaphore::GfxSemaphore};

/// 对 VkSubmitInfo2 的封装，持有所有被引用的数组
#[derive(Default)]
pub struct GfxSubmitInfo {
    command_buffers: Vec<vk::CommandBufferSubmitInfo<'static>>,
    wait_infos: Vec<vk::SemaphoreSubmitInfo<'static>>,
    signal_infos: Vec<vk::SemaphoreSubmitInfo<'static>>,
}

impl GfxSubmitInfo {
    pub fn new(commands: &[&GfxCommandBuffer]) -> Self {
        for cmd in commands.iter().filter(|cmd| !cmd.state().can_submit()) {
            log::warn!("submitting command buffer {} while {:?}", cmd.name(), cmd.state());
            debug_assert!(false, "command buffer {} is not executable", cmd.name());
        }

        let command_buffers = commands
            .iter()
            .map(|cmd| vk::CommandBufferSubmitInfo::default().command_buffer(cmd.handle()))
            .collect_vec();

        Self {
            command_buffers,
            wait_infos: vec![],
            signal_infos: vec![],
        }
    }

    #[inline]
    pub fn submit_info(&self) -> vk::SubmitInfo2<'_> {
        vk::SubmitInfo2::default()
            .command_buffer_infos(&self.command_buffers)
            .wait_semaphore_infos(&self.wait_infos)
            .signal_semaphore_infos(&self.signal_infos)
    }

    /// binary semaphore 的 value 会被忽略，传 None 即可
    #[inline]
    pub fn wait(mut self, semaphore: &GfxSemaphore, stage: vk::PipelineStageFlags2, value: Option<u64>) -> Self {
        self.wait_infos.push(
            vk::SemaphoreSubmitInfo::default()
                .semaphore(semaphore.handle())
                .stage_mask(stage)
                .value(value.unwrap_or_default()),
        );
        self
    }

    #[inline]
    pub fn signal(mut self, semaphore: &GfxSemaphore, stage: vk::PipelineStageFlags2, value: Option<u64>) -> Self {
        self.signal_infos.push(
            vk::SemaphoreSubmitInfo::default()
                .semaphore(semaphore.handle())
                .stage_mask(stage)
                .value(value.unwrap_or_default()),
        );
        self
    }

    #[inline]
    pub fn command_buffer_count(&self) -> usize {
        self.command_buffers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_submit_info() {
        let info = GfxSubmitInfo::new(&[]);
        assert_eq!(info.command_buffer_count(), 0);
        let vk_info = info.submit_info();
        assert_eq!(vk_info.command_buffer_info_count, 0);
        assert_eq!(vk_info.wait_semaphore_info_count, 0);
        assert_eq!(vk_info.signal_semaphore_info_count, 0);
    }
}

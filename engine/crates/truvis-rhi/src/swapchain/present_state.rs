//! swapchain 的帧状态：frame ring、acquire / present 结果的分类
//!
//! 不涉及任何 vk 调用，可以脱离 GPU 测试

use ash::vk;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapchainState {
    Uninitialized,
    Live,
    /// 收到了 out of date / suboptimal，或者 present mode 变化，等待 resize
    ResizePending,
    Destroyed,
}
impl SwapchainState {
    /// 只有 Live 时才能 acquire；ResizePending 需要先 resize
    #[inline]
    pub fn can_acquire(self) -> bool {
        self == Self::Live
    }

    #[inline]
    pub fn can_resize(self) -> bool {
        matches!(self, Self::Live | Self::ResizePending)
    }
}

/// present 之前 image 必须处于 PRESENT_SRC_KHR
#[inline]
pub fn is_presentable_layout(layout: vk::ImageLayout) -> bool {
    layout == vk::ImageLayout::PRESENT_SRC_KHR
}

/// vkAcquireNextImageKHR 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired { image_index: u32 },
    /// image 已经被 acquire，可以继续使用，但是 swapchain 需要重建
    Suboptimal { image_index: u32 },
    /// 没有 acquire 到 image
    OutOfDate,
    /// 在 timeout 内没有可用的 image，swapchain 本身没有问题
    Timeout,
}
impl AcquireOutcome {
    #[inline]
    pub fn image_index(self) -> Option<u32> {
        match self {
            Self::Acquired { image_index } | Self::Suboptimal { image_index } => Some(image_index),
            Self::OutOfDate | Self::Timeout => None,
        }
    }

    /// 只有真正 acquire 到 image 时才 reset fence，
    /// 否则这一帧被跳过，fence 不会再被 signal
    #[inline]
    pub fn should_reset_fence(self) -> bool {
        self.image_index().is_some()
    }
}

/// vkQueuePresentKHR 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    Suboptimal,
    OutOfDate,
}

/// 其他错误原样返回，由调用者视为致命错误
pub fn classify_acquire(result: Result<(u32, bool), vk::Result>) -> Result<AcquireOutcome, vk::Result> {
    match result {
        Ok((image_index, false)) => Ok(AcquireOutcome::Acquired { image_index }),
        Ok((image_index, true)) => Ok(AcquireOutcome::Suboptimal { image_index }),
        Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::OutOfDate),
        Err(vk::Result::TIMEOUT | vk::Result::NOT_READY) => Ok(AcquireOutcome::Timeout),
        Err(e) => Err(e),
    }
}

pub fn classify_present(result: Result<bool, vk::Result>) -> Result<PresentOutcome, vk::Result> {
    match result {
        Ok(false) => Ok(PresentOutcome::Presented),
        Ok(true) | Err(vk::Result::SUBOPTIMAL_KHR) => Ok(PresentOutcome::Suboptimal),
        Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::OutOfDate),
        Err(e) => Err(e),
    }
}

/// frame ring 的游标
///
/// - frame index：frames in flight 中的第几帧，决定使用哪一组同步对象
/// - image index：当前 acquire 到的 swapchain image
/// - frame id：单调递增的帧号，用于 deletion queue
#[derive(Debug, Clone)]
pub struct FrameCursor {
    frames_count: usize,
    frame_index: Option<usize>,
    image_index: Option<u32>,
    frame_id: u64,
    resize_required: bool,
}
impl FrameCursor {
    pub fn new(frames_count: usize) -> Self {
        debug_assert!(frames_count > 0);
        Self {
            frames_count: frames_count.max(1),
            frame_index: None,
            image_index: None,
            frame_id: 0,
            resize_required: false,
        }
    }

    /// 推进到下一个 frame slot，等待该 slot 上一次的 GPU 工作完成，然后递增 frame id
    ///
    /// 同时在 GPU 上执行的帧数因此不会超过 frames_count
    ///
    /// wait_slot 返回 false 表示等待超时：游标保持不动，下一次调用会重试同一个 slot
    pub fn begin_frame(&mut self, wait_slot: impl FnOnce(usize) -> bool) -> Option<usize> {
        let slot = match self.frame_index {
            None => 0,
            Some(i) => (i + 1) % self.frames_count,
        };
        if !wait_slot(slot) {
            return None;
        }
        self.frame_index = Some(slot);
        self.frame_id += 1;
        Some(slot)
    }

    pub fn on_acquire(&mut self, outcome: AcquireOutcome) {
        match outcome {
            AcquireOutcome::Acquired { image_index } => {
                self.image_index = Some(image_index);
            }
            AcquireOutcome::Suboptimal { image_index } => {
                log::warn!("swapchain acquire image index {} is not optimal", image_index);
                self.image_index = Some(image_index);
                self.resize_required = true;
            }
            AcquireOutcome::OutOfDate => {
                log::warn!("swapchain is out of date when acquire next image");
                self.resize_required = true;
            }
            AcquireOutcome::Timeout => {
                log::debug!("acquire next image timed out");
            }
        }
    }

    /// present 之后 image 归还给 presentation engine
    pub fn on_present(&mut self, outcome: PresentOutcome) {
        match outcome {
            PresentOutcome::Presented => {}
            PresentOutcome::Suboptimal => {
                log::warn!("swapchain present image index {:?} is not optimal", self.image_index);
                self.resize_required = true;
            }
            PresentOutcome::OutOfDate => {
                log::warn!("swapchain is out of date when present image");
                self.resize_required = true;
            }
        }
        self.image_index = None;
    }

    /// swapchain 重建时调用：frame index 和 image index 回到无效值
    pub fn invalidate(&mut self) {
        self.frame_index = None;
        self.image_index = None;
    }

    #[inline]
    pub fn request_resize(&mut self) {
        self.resize_required = true;
    }

    #[inline]
    pub fn clear_resize_required(&mut self) {
        self.resize_required = false;
    }
}
// getters
impl FrameCursor {
    #[inline]
    pub fn frames_count(&self) -> usize {
        self.frames_count
    }

    #[inline]
    pub fn frame_index(&self) -> Option<usize> {
        self.frame_index
    }

    #[inline]
    pub fn image_index(&self) -> Option<u32> {
        self.image_index
    }

    #[inline]
    pub fn frame_id(&self) -> u64 {
        self.frame_id
    }

    #[inline]
    pub fn is_resize_required(&self) -> bool {
        self.resize_required
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Arc, Condvar, Mutex, mpsc},
        time::Duration,
    };

    use super::*;

    #[test]
    fn test_frame_ring_wraps() {
        let mut cursor = FrameCursor::new(3);
        let mut waited = vec![];
        let slots = (0..7)
            .map(|_| {
                cursor
                    .begin_frame(|slot| {
                        waited.push(slot);
                        true
                    })
                    .unwrap()
            })
            .collect::<Vec<_>>();
        assert_eq!(slots, vec![0, 1, 2, 0, 1, 2, 0]);
        assert_eq!(waited, slots);
        assert_eq!(cursor.frame_id(), 7);

        cursor.invalidate();
        assert_eq!(cursor.frame_index(), None);
        assert_eq!(cursor.begin_frame(|_| true), Some(0));
        // frame id 不会因为重建而回退
        assert_eq!(cursor.frame_id(), 8);
    }

    #[test]
    fn test_out_of_date_acquire_keeps_image_index_invalid() {
        let mut cursor = FrameCursor::new(2);
        cursor.begin_frame(|_| true);

        let outcome = classify_acquire(Err(vk::Result::ERROR_OUT_OF_DATE_KHR)).unwrap();
        assert_eq!(outcome, AcquireOutcome::OutOfDate);
        assert!(!outcome.should_reset_fence());

        cursor.on_acquire(outcome);
        assert!(cursor.is_resize_required());
        assert_eq!(cursor.image_index(), None);

        // resize：invalidate 之后清除 flag
        cursor.invalidate();
        cursor.clear_resize_required();
        assert_eq!(cursor.image_index(), None);
        assert_eq!(cursor.frame_index(), None);
        assert!(!cursor.is_resize_required());
    }

    #[test]
    fn test_suboptimal_acquire_keeps_image() {
        let mut cursor = FrameCursor::new(2);
        cursor.begin_frame(|_| true);

        let outcome = classify_acquire(Ok((1, true))).unwrap();
        assert!(outcome.should_reset_fence());
        cursor.on_acquire(outcome);
        assert_eq!(cursor.image_index(), Some(1));
        assert!(cursor.is_resize_required());

        cursor.on_present(classify_present(Ok(false)).unwrap());
        assert_eq!(cursor.image_index(), None);
    }

    #[test]
    fn test_classify_results() {
        assert_eq!(classify_acquire(Ok((2, false))), Ok(AcquireOutcome::Acquired { image_index: 2 }));
        assert_eq!(classify_acquire(Err(vk::Result::ERROR_DEVICE_LOST)), Err(vk::Result::ERROR_DEVICE_LOST));

        assert_eq!(classify_present(Ok(true)), Ok(PresentOutcome::Suboptimal));
        assert_eq!(classify_present(Err(vk::Result::ERROR_OUT_OF_DATE_KHR)), Ok(PresentOutcome::OutOfDate));
        assert_eq!(classify_present(Err(vk::Result::ERROR_SURFACE_LOST_KHR)), Err(vk::Result::ERROR_SURFACE_LOST_KHR));

        let mut cursor = FrameCursor::new(2);
        cursor.on_present(PresentOutcome::OutOfDate);
        assert!(cursor.is_resize_required());
    }

    /// 用 Condvar 模拟 fence：signal 之后 wait 才会返回
    struct MockFences {
        signaled: Mutex<Vec<bool>>,
        cond: Condvar,
    }
    impl MockFences {
        fn new(count: usize) -> Self {
            // 与真实的 render fence 一样，创建时就是 signaled
            Self {
                signaled: Mutex::new(vec![true; count]),
                cond: Condvar::new(),
            }
        }

        /// 超时返回 false，与 `GfxFence::wait` 一致
        fn wait_and_reset(&self, slot: usize, timeout: Option<Duration>) -> bool {
            let signaled = self.signaled.lock().unwrap();
            let mut signaled = match timeout {
                None => self.cond.wait_while(signaled, |s| !s[slot]).unwrap(),
                Some(timeout) => {
                    let (signaled, result) = self.cond.wait_timeout_while(signaled, timeout, |s| !s[slot]).unwrap();
                    if result.timed_out() {
                        return false;
                    }
                    signaled
                }
            };
            signaled[slot] = false;
            true
        }

        fn signal(&self, slot: usize) {
            self.signaled.lock().unwrap()[slot] = true;
            self.cond.notify_all();
        }
    }

    #[test]
    fn test_third_frame_waits_for_first_frame_fence() {
        let fences = Arc::new(MockFences::new(2));
        let (tx, rx) = mpsc::channel();

        let render_thread = {
            let fences = fences.clone();
            std::thread::spawn(move || {
                let mut cursor = FrameCursor::new(2);
                for _ in 0..3 {
                    let slot = cursor.begin_frame(|slot| fences.wait_and_reset(slot, None)).unwrap();
                    tx.send((slot, cursor.frame_id())).unwrap();
                }
            })
        };

        // 前两帧不需要等待
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), (0, 1));
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), (1, 2));

        // 第三帧复用 slot 0，必须等待第一帧的 fence
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        fences.signal(0);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), (0, 3));
        render_thread.join().unwrap();
    }

    #[test]
    fn test_fence_timeout_skips_frame_and_retries_slot() {
        let fences = MockFences::new(2);
        let mut cursor = FrameCursor::new(2);
        let timeout = Some(Duration::from_millis(10));

        assert_eq!(cursor.begin_frame(|slot| fences.wait_and_reset(slot, timeout)), Some(0));
        assert_eq!(cursor.begin_frame(|slot| fences.wait_and_reset(slot, timeout)), Some(1));
        assert_eq!(cursor.frame_id(), 2);

        // slot 0 的 fence 还没有 signal：超时，游标与 frame id 都不变
        assert_eq!(cursor.begin_frame(|slot| fences.wait_and_reset(slot, timeout)), None);
        assert_eq!(cursor.frame_index(), Some(1));
        assert_eq!(cursor.frame_id(), 2);

        fences.signal(0);
        assert_eq!(cursor.begin_frame(|slot| fences.wait_and_reset(slot, timeout)), Some(0));
        assert_eq!(cursor.frame_id(), 3);
    }

    #[test]
    fn test_acquire_timeout_is_not_out_of_date() {
        let mut cursor = FrameCursor::new(2);
        cursor.begin_frame(|_| true);

        for result in [vk::Result::TIMEOUT, vk::Result::NOT_READY] {
            let outcome = classify_acquire(Err(result)).unwrap();
            assert_eq!(outcome, AcquireOutcome::Timeout);
            assert!(!outcome.should_reset_fence());

            cursor.on_acquire(outcome);
            assert_eq!(cursor.image_index(), None);
            assert!(!cursor.is_resize_required());
        }
    }

    #[test]
    fn test_state_gates_acquire_and_resize() {
        assert!(SwapchainState::Live.can_acquire());
        assert!(!SwapchainState::ResizePending.can_acquire());
        assert!(!SwapchainState::Uninitialized.can_acquire());
        assert!(!SwapchainState::Destroyed.can_acquire());

        assert!(SwapchainState::Live.can_resize());
        assert!(SwapchainState::ResizePending.can_resize());
        assert!(!SwapchainState::Uninitialized.can_resize());
        assert!(!SwapchainState::Destroyed.can_resize());
    }

    #[test]
    fn test_presentable_layout() {
        assert!(is_presentable_layout(vk::ImageLayout::PRESENT_SRC_KHR));
        for layout in [
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::GENERAL,
        ] {
            assert!(!is_presentable_layout(layout));
        }
    }
}

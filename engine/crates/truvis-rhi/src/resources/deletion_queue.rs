use std::{
    collections::BTreeMap,
    sync::{
        Mutex, MutexGuard,
        atomic::{AtomicU64, Ordering},
    },
};

use ash::vk;
use itertools::Itertools;

use crate::foundation::device::DeviceFunctions;

/// 可以放入 deletion queue 的资源类型
///
/// 声明顺序即为 clear 时的销毁顺序：pipeline 先于 layout，layout 先于 set layout，
/// sync 对象最后销毁
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    Pipeline,
    PipelineLayout,
    DescriptorPool,
    DescriptorSetLayout,
    ShaderModule,
    Sampler,
    ImageView,
    Image,
    Buffer,
    CommandPool,
    Semaphore,
    Fence,
}
impl ResourceKind {
    pub const ALL: [ResourceKind; 12] = [
        ResourceKind::Pipeline,
        ResourceKind::PipelineLayout,
        ResourceKind::DescriptorPool,
        ResourceKind::DescriptorSetLayout,
        ResourceKind::ShaderModule,
        ResourceKind::Sampler,
        ResourceKind::ImageView,
        ResourceKind::Image,
        ResourceKind::Buffer,
        ResourceKind::CommandPool,
        ResourceKind::Semaphore,
        ResourceKind::Fence,
    ];

    pub fn from_object_type(object_type: vk::ObjectType) -> Option<Self> {
        match object_type {
            vk::ObjectType::PIPELINE => Some(Self::Pipeline),
            vk::ObjectType::PIPELINE_LAYOUT => Some(Self::PipelineLayout),
            vk::ObjectType::DESCRIPTOR_POOL => Some(Self::DescriptorPool),
            vk::ObjectType::DESCRIPTOR_SET_LAYOUT => Some(Self::DescriptorSetLayout),
            vk::ObjectType::SHADER_MODULE => Some(Self::ShaderModule),
            vk::ObjectType::SAMPLER => Some(Self::Sampler),
            vk::ObjectType::IMAGE_VIEW => Some(Self::ImageView),
            vk::ObjectType::IMAGE => Some(Self::Image),
            vk::ObjectType::BUFFER => Some(Self::Buffer),
            vk::ObjectType::COMMAND_POOL => Some(Self::CommandPool),
            vk::ObjectType::SEMAPHORE => Some(Self::Semaphore),
            vk::ObjectType::FENCE => Some(Self::Fence),
            _ => None,
        }
    }
}

/// 真正执行销毁的一方
///
/// 运行时由 [`VmaDestroyer`] 实现；测试中可以替换为只做记录的实现
pub trait ResourceDestroyer {
    type Allocation;

    fn destroy_buffer(&self, buffer: vk::Buffer, allocation: Self::Allocation);

    /// 先销毁 view，再销毁 image
    fn destroy_image(&self, image: vk::Image, view: Option<vk::ImageView>, allocation: Self::Allocation);

    /// 不带内存的 handle，raw 一定非 null
    fn destroy_handle(&self, kind: ResourceKind, raw: u64);
}

/// 记录资源被放入队列时的 frame id
struct Retired<T> {
    frame_id: u64,
    item: T,
}

struct BufferEntry<A> {
    buffer: vk::Buffer,
    allocation: A,
}

struct ImageEntry<A> {
    image: vk::Image,
    view: Option<vk::ImageView>,
    allocation: A,
}

struct DeletionQueueInner<A> {
    buffers: Vec<Retired<BufferEntry<A>>>,
    images: Vec<Retired<ImageEntry<A>>>,
    /// 按 kind 分组，BTreeMap 保证遍历顺序与 ResourceKind 的声明顺序一致
    handles: BTreeMap<ResourceKind, Vec<Retired<u64>>>,
}
impl<A> Default for DeletionQueueInner<A> {
    fn default() -> Self {
        Self {
            buffers: Vec::new(),
            images: Vec::new(),
            handles: BTreeMap::new(),
        }
    }
}
impl<A> DeletionQueueInner<A> {
    fn len(&self) -> usize {
        self.buffers.len() + self.images.len() + self.handles.values().map(Vec::len).sum::<usize>()
    }

    /// 按照固定顺序销毁 `retired(frame_id)` 为 true 的资源，其余的保留
    fn drain_where<D>(&mut self, destroyer: &D, retired: impl Fn(u64) -> bool) -> usize
    where
        D: ResourceDestroyer<Allocation = A>,
    {
        let mut destroyed = 0;

        let (expired, kept): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.buffers).into_iter().partition(|entry| retired(entry.frame_id));
        self.buffers = kept;
        for Retired { item, .. } in expired {
            destroyer.destroy_buffer(item.buffer, item.allocation);
            destroyed += 1;
        }

        let (expired, kept): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.images).into_iter().partition(|entry| retired(entry.frame_id));
        self.images = kept;
        for Retired { item, .. } in expired {
            destroyer.destroy_image(item.image, item.view, item.allocation);
            destroyed += 1;
        }

        for (kind, entries) in self.handles.iter_mut() {
            let (expired, kept): (Vec<_>, Vec<_>) =
                std::mem::take(entries).into_iter().partition(|entry| retired(entry.frame_id));
            *entries = kept;
            for Retired { item, .. } in expired {
                destroyer.destroy_handle(*kind, item);
                destroyed += 1;
            }
        }
        self.handles.retain(|_, entries| !entries.is_empty());

        destroyed
    }
}

/// 延迟销毁的 GPU 资源
///
/// 资源包装类型不会直接销毁 vk 对象，而是通过 `release` 把 handle 移交到这里，
/// 等到确认 GPU 不再使用之后统一销毁：
/// - [`DeletionQueue::cleanup`]：每帧调用，销毁 frames in flight 帧之前放入的资源
/// - [`DeletionQueue::clear`]：device idle 时调用（resize、退出），销毁所有资源
///
/// 内部使用 Mutex，可以在任意线程放入资源
pub struct DeletionQueue<A> {
    inner: Mutex<DeletionQueueInner<A>>,
    /// 放入资源时打上的 frame id
    current_frame_id: AtomicU64,
}
impl<A> Default for DeletionQueue<A> {
    fn default() -> Self {
        Self::new()
    }
}

/// 运行时使用的 deletion queue，内存由 VMA 管理
pub type GfxDeletionQueue = DeletionQueue<vk_mem::Allocation>;

// new & init
impl<A> DeletionQueue<A> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(DeletionQueueInner::default()),
            current_frame_id: AtomicU64::new(0),
        }
    }

    /// 之后放入的资源都会带上这个 frame id
    #[inline]
    pub fn begin_frame(&self, frame_id: u64) {
        self.current_frame_id.store(frame_id, Ordering::Release);
    }

    fn lock(&self) -> MutexGuard<'_, DeletionQueueInner<A>> {
        // 即使其他线程在持有锁时 panic，队列中的记录依然有效
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[inline]
    fn stamp(&self) -> u64 {
        self.current_frame_id.load(Ordering::Acquire)
    }
}
// add
impl<A> DeletionQueue<A> {
    /// null handle 只会给出警告，不会放入队列
    pub fn add(&self, kind: ResourceKind, raw: u64) {
        if raw == 0 {
            log::warn!("deletion queue: ignoring null {:?} handle", kind);
            return;
        }
        let frame_id = self.stamp();
        self.lock().handles.entry(kind).or_default().push(Retired { frame_id, item: raw });
    }

    /// 根据 handle 的类型推断 ResourceKind
    pub fn add_handle<H: vk::Handle>(&self, handle: H) {
        match ResourceKind::from_object_type(H::TYPE) {
            Some(kind) => self.add(kind, handle.as_raw()),
            None => {
                log::warn!("deletion queue: {:?} is not a deferred resource kind", H::TYPE);
                debug_assert!(false, "unsupported handle type {:?}", H::TYPE);
            }
        }
    }

    pub fn add_buffer(&self, buffer: vk::Buffer, allocation: A) {
        if buffer == vk::Buffer::null() {
            log::warn!("deletion queue: ignoring null buffer");
            return;
        }
        let frame_id = self.stamp();
        self.lock().buffers.push(Retired {
            frame_id,
            item: BufferEntry { buffer, allocation },
        });
    }

    pub fn add_image(&self, image: vk::Image, view: Option<vk::ImageView>, allocation: A) {
        if image == vk::Image::null() {
            log::warn!("deletion queue: ignoring null image");
            return;
        }
        let frame_id = self.stamp();
        self.lock().images.push(Retired {
            frame_id,
            item: ImageEntry {
                image,
                view: view.filter(|v| *v != vk::ImageView::null()),
                allocation,
            },
        });
    }
}
// destroy
impl<A> DeletionQueue<A> {
    /// 销毁队列中的所有资源
    ///
    /// 调用者需要保证 device 已经 idle
    pub fn clear<D>(&self, destroyer: &D) -> usize
    where
        D: ResourceDestroyer<Allocation = A>,
    {
        let _span = tracy_client::span!("DeletionQueue::clear");
        let destroyed = self.lock().drain_where(destroyer, |_| true);
        if destroyed > 0 {
            log::info!("deletion queue: cleared {} resources", destroyed);
        }
        destroyed
    }

    /// 销毁已经退休的资源：放入时的 frame id + frames_in_flight <= current_frame_id
    ///
    /// 调用时机：当前 frame slot 的 fence 已经 wait 完成之后
    pub fn cleanup<D>(&self, destroyer: &D, current_frame_id: u64, frames_in_flight: u64) -> usize
    where
        D: ResourceDestroyer<Allocation = A>,
    {
        let _span = tracy_client::span!("DeletionQueue::cleanup");
        let destroyed =
            self.lock().drain_where(destroyer, |frame_id| frame_id + frames_in_flight <= current_frame_id);
        if destroyed > 0 {
            log::debug!("deletion queue: frame {} destroyed {} retired resources", current_frame_id, destroyed);
        }
        destroyed
    }
}
// getters
impl<A> DeletionQueue<A> {
    #[inline]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn current_frame_id(&self) -> u64 {
        self.stamp()
    }
}
impl<A> Drop for DeletionQueue<A> {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(|e| e.into_inner());
        if inner.len() > 0 {
            let kinds = inner.handles.iter().map(|(kind, entries)| format!("{:?}x{}", kind, entries.len())).join(", ");
            log::warn!(
                "deletion queue dropped with leaked resources: {} buffers, {} images, [{}]",
                inner.buffers.len(),
                inner.images.len(),
                kinds
            );
        }
    }
}

/// 使用 device 函数指针和 VMA allocator 销毁资源
pub struct VmaDestroyer<'a> {
    pub device: &'a DeviceFunctions,
    pub allocator: &'a vk_mem::Allocator,
}
impl ResourceDestroyer for VmaDestroyer<'_> {
    type Allocation = vk_mem::Allocation;

    fn destroy_buffer(&self, buffer: vk::Buffer, mut allocation: vk_mem::Allocation) {
        unsafe { self.allocator.destroy_buffer(buffer, &mut allocation) }
    }

    fn destroy_image(&self, image: vk::Image, view: Option<vk::ImageView>, mut allocation: vk_mem::Allocation) {
        unsafe {
            if let Some(view) = view {
                self.device.destroy_image_view(view, None);
            }
            self.allocator.destroy_image(image, &mut allocation);
        }
    }

    fn destroy_handle(&self, kind: ResourceKind, raw: u64) {
        use vk::Handle;

        let device = self.device;
        unsafe {
            match kind {
                ResourceKind::Pipeline => device.destroy_pipeline(vk::Pipeline::from_raw(raw), None),
                ResourceKind::PipelineLayout => {
                    device.destroy_pipeline_layout(vk::PipelineLayout::from_raw(raw), None)
                }
                ResourceKind::DescriptorPool => {
                    device.destroy_descriptor_pool(vk::DescriptorPool::from_raw(raw), None)
                }
                ResourceKind::DescriptorSetLayout => {
                    device.destroy_descriptor_set_layout(vk::DescriptorSetLayout::from_raw(raw), None)
                }
                ResourceKind::ShaderModule => device.destroy_shader_module(vk::ShaderModule::from_raw(raw), None),
                ResourceKind::Sampler => device.destroy_sampler(vk::Sampler::from_raw(raw), None),
                ResourceKind::ImageView => device.destroy_image_view(vk::ImageView::from_raw(raw), None),
                // 不带 VMA 内存的 image / buffer，内存由其他对象管理
                ResourceKind::Image => device.destroy_image(vk::Image::from_raw(raw), None),
                ResourceKind::Buffer => device.destroy_buffer(vk::Buffer::from_raw(raw), None),
                ResourceKind::CommandPool => device.destroy_command_pool(vk::CommandPool::from_raw(raw), None),
                ResourceKind::Semaphore => device.destroy_semaphore(vk::Semaphore::from_raw(raw), None),
                ResourceKind::Fence => device.destroy_fence(vk::Fence::from_raw(raw), None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, sync::Arc};

    use ash::vk::Handle;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Destroyed {
        Buffer(u64, u32),
        ImageView(u64),
        Image(u64, u32),
        Handle(ResourceKind, u64),
    }

    /// 只记录销毁顺序，allocation 用一个 u32 表示
    #[derive(Default)]
    struct Recorder {
        log: RefCell<Vec<Destroyed>>,
    }
    impl ResourceDestroyer for Recorder {
        type Allocation = u32;

        fn destroy_buffer(&self, buffer: vk::Buffer, allocation: u32) {
            self.log.borrow_mut().push(Destroyed::Buffer(buffer.as_raw(), allocation));
        }

        fn destroy_image(&self, image: vk::Image, view: Option<vk::ImageView>, allocation: u32) {
            if let Some(view) = view {
                self.log.borrow_mut().push(Destroyed::ImageView(view.as_raw()));
            }
            self.log.borrow_mut().push(Destroyed::Image(image.as_raw(), allocation));
        }

        fn destroy_handle(&self, kind: ResourceKind, raw: u64) {
            self.log.borrow_mut().push(Destroyed::Handle(kind, raw));
        }
    }

    #[test]
    fn test_clear_order() {
        let queue = DeletionQueue::<u32>::new();
        queue.add_handle(vk::Fence::from_raw(10));
        queue.add(ResourceKind::Pipeline, 11);
        queue.add_image(vk::Image::from_raw(20), Some(vk::ImageView::from_raw(21)), 2);
        queue.add_buffer(vk::Buffer::from_raw(30), 3);
        queue.add_handle(vk::PipelineLayout::from_raw(12));
        queue.add(ResourceKind::Pipeline, 13);
        assert_eq!(queue.len(), 6);

        let recorder = Recorder::default();
        assert_eq!(queue.clear(&recorder), 6);
        assert!(queue.is_empty());
        assert_eq!(
            recorder.log.into_inner(),
            vec![
                Destroyed::Buffer(30, 3),
                Destroyed::ImageView(21),
                Destroyed::Image(20, 2),
                Destroyed::Handle(ResourceKind::Pipeline, 11),
                Destroyed::Handle(ResourceKind::Pipeline, 13),
                Destroyed::Handle(ResourceKind::PipelineLayout, 12),
                Destroyed::Handle(ResourceKind::Fence, 10),
            ]
        );
    }

    #[test]
    fn test_null_handles_are_ignored() {
        let queue = DeletionQueue::<u32>::new();
        queue.add_buffer(vk::Buffer::from_raw(1), 1);
        for _ in 0..3 {
            queue.add(ResourceKind::Sampler, 0);
            queue.add_handle(vk::Semaphore::null());
            queue.add_buffer(vk::Buffer::null(), 7);
            queue.add_image(vk::Image::null(), Some(vk::ImageView::from_raw(5)), 7);
        }
        assert_eq!(queue.len(), 1);

        let recorder = Recorder::default();
        queue.clear(&recorder);
        assert_eq!(recorder.log.into_inner(), vec![Destroyed::Buffer(1, 1)]);

        // 重复 clear 不会再销毁任何东西
        let recorder = Recorder::default();
        assert_eq!(queue.clear(&recorder), 0);
        assert!(recorder.log.into_inner().is_empty());
    }

    #[test]
    fn test_cleanup_waits_for_frames_in_flight() {
        const FIF: u64 = 2;
        let queue = DeletionQueue::<u32>::new();
        let recorder = Recorder::default();

        queue.begin_frame(1);
        queue.add_handle(vk::Sampler::from_raw(1));
        queue.begin_frame(2);
        queue.add_buffer(vk::Buffer::from_raw(2), 0);

        // frame 2：frame 1 的资源可能仍在使用
        assert_eq!(queue.cleanup(&recorder, 2, FIF), 0);

        // frame 3：frame 1 的 fence 已经 wait 过
        queue.begin_frame(3);
        assert_eq!(queue.cleanup(&recorder, 3, FIF), 1);
        assert_eq!(recorder.log.borrow().as_slice(), &[Destroyed::Handle(ResourceKind::Sampler, 1)]);
        assert_eq!(queue.len(), 1);

        queue.begin_frame(4);
        assert_eq!(queue.cleanup(&recorder, 4, FIF), 1);
        assert!(queue.is_empty());
        assert_eq!(recorder.log.borrow().last(), Some(&Destroyed::Buffer(2, 0)));
    }

    #[test]
    fn test_add_after_clear_is_destroyed_later() {
        let queue = DeletionQueue::<u32>::new();
        let recorder = Recorder::default();
        queue.clear(&recorder);

        queue.add_handle(vk::CommandPool::from_raw(9));
        assert_eq!(queue.len(), 1);
        queue.clear(&recorder);
        assert_eq!(recorder.log.into_inner(), vec![Destroyed::Handle(ResourceKind::CommandPool, 9)]);
    }

    #[test]
    fn test_concurrent_add() {
        let queue = Arc::new(DeletionQueue::<u32>::new());
        let threads = (0..4u64)
            .map(|t| {
                let queue = queue.clone();
                std::thread::spawn(move || {
                    for i in 1..=100u64 {
                        queue.add(ResourceKind::ImageView, t * 1000 + i);
                    }
                })
            })
            .collect_vec();
        for thread in threads {
            thread.join().unwrap();
        }
        assert_eq!(queue.len(), 400);

        let recorder = Recorder::default();
        assert_eq!(queue.clear(&recorder), 400);
        let raws = recorder
            .log
            .into_inner()
            .into_iter()
            .map(|d| match d {
                Destroyed::Handle(ResourceKind::ImageView, raw) => raw,
                other => panic!("unexpected {:?}", other),
            })
            .sorted()
            .dedup()
            .count();
        assert_eq!(raws, 400);
    }

    #[test]
    fn test_kind_from_object_type() {
        for kind in ResourceKind::ALL {
            let object_type = match kind {
                ResourceKind::Pipeline => vk::Pipeline::TYPE,
                ResourceKind::PipelineLayout => vk::PipelineLayout::TYPE,
                ResourceKind::DescriptorPool => vk::DescriptorPool::TYPE,
                ResourceKind::DescriptorSetLayout => vk::DescriptorSetLayout::TYPE,
                ResourceKind::ShaderModule => vk::ShaderModule::TYPE,
                ResourceKind::Sampler => vk::Sampler::TYPE,
                ResourceKind::ImageView => vk::ImageView::TYPE,
                ResourceKind::Image => vk::Image::TYPE,
                ResourceKind::Buffer => vk::Buffer::TYPE,
                ResourceKind::CommandPool => vk::CommandPool::TYPE,
                ResourceKind::Semaphore => vk::Semaphore::TYPE,
                ResourceKind::Fence => vk::Fence::TYPE,
            };
            assert_eq!(ResourceKind::from_object_type(object_type), Some(kind));
        }
        assert_eq!(ResourceKind::from_object_type(vk::ObjectType::QUEUE), None);
    }
}

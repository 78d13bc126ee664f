use std::fmt;
use std::sync::{Arc, OnceLock};

use bytes::BytesMut;

use crate::buf::ByteBuf;
use crate::composite::CompositeByteBuf;
use crate::error::{BufferError, Result};
use crate::leak::ResourceLeakDetector;
use crate::storage::{BufferRecycler, DropRecycler, Storage};

/// 未指定时的初始容量。
pub const DEFAULT_INITIAL_CAPACITY: usize = 256;
/// 未指定时的最大容量。
pub const DEFAULT_MAX_CAPACITY: usize = usize::MAX;
/// 复合缓冲默认允许的组件数，超出后合并。
pub const DEFAULT_MAX_COMPONENTS: usize = 16;
/// 扩容策略的分段阈值：低于阈值按 2 的幂翻倍，高于阈值按阈值步进。
pub const CALCULATE_THRESHOLD: usize = 4 * 1024 * 1024;

const MIN_GROWTH_CAPACITY: usize = 64;

/// 计算扩容后的容量。
///
/// # 策略（How）
/// - `min_new_capacity` 恰为阈值时直接返回阈值；
/// - 高于阈值时向上取整到阈值的整数倍，逼近上限时直接取 `max_capacity`；
/// - 低于阈值时从 64 起翻倍到不小于需求的 2 的幂，再以 `max_capacity` 截断。
///
/// # 契约说明（What）
/// - `min_new_capacity > max_capacity` 返回 [`BufferError::Capacity`]；
/// - 返回值满足 `min_new_capacity <= result <= max_capacity`。
pub fn calculate_new_capacity(min_new_capacity: usize, max_capacity: usize) -> Result<usize> {
    if min_new_capacity > max_capacity {
        return Err(BufferError::Capacity {
            requested: min_new_capacity,
            maximum: max_capacity,
        });
    }
    let threshold = CALCULATE_THRESHOLD;
    if min_new_capacity == threshold {
        return Ok(threshold);
    }
    if min_new_capacity > threshold {
        let stepped = min_new_capacity / threshold * threshold;
        return Ok(if stepped > max_capacity - threshold {
            max_capacity
        } else {
            stepped + threshold
        });
    }
    let doubled = min_new_capacity
        .max(MIN_GROWTH_CAPACITY)
        .checked_next_power_of_two()
        .unwrap_or(max_capacity);
    Ok(doubled.min(max_capacity))
}

pub(crate) fn validate_capacity(initial_capacity: usize, max_capacity: usize) -> Result<()> {
    if initial_capacity > max_capacity {
        return Err(BufferError::Capacity {
            requested: initial_capacity,
            maximum: max_capacity,
        });
    }
    Ok(())
}

/// `ByteBufAllocator` 是缓冲的工厂契约。
///
/// # 设计动机（Why）
/// - 传输层与编码器只关心“要一块多大的缓冲”，不关心它来自池还是来自全局堆；
/// - 池化与非池化实现共享同一扩容策略，使缓冲在不同来源间表现一致。
///
/// # 契约说明（What）
/// - 实现必须可跨线程并发调用；
/// - `initial_capacity > max_capacity` 返回 [`BufferError::Capacity`]；
/// - 返回的缓冲计数为 1，读写指针为 0，调用方即唯一所有者。
pub trait ByteBufAllocator: Send + Sync + 'static {
    /// 分配堆内存缓冲。
    fn heap_buffer_with(&self, initial_capacity: usize, max_capacity: usize) -> Result<ByteBuf>;

    /// 分配直接内存缓冲。
    fn direct_buffer_with(&self, initial_capacity: usize, max_capacity: usize) -> Result<ByteBuf>;

    /// `buffer` 系列是否默认走直接内存。
    fn prefers_direct(&self) -> bool;

    /// 以默认容量按偏好分配缓冲。
    fn buffer(&self) -> Result<ByteBuf> {
        self.buffer_with(DEFAULT_INITIAL_CAPACITY, DEFAULT_MAX_CAPACITY)
    }

    /// 按偏好分配堆或直接内存缓冲。
    fn buffer_with(&self, initial_capacity: usize, max_capacity: usize) -> Result<ByteBuf> {
        if self.prefers_direct() {
            self.direct_buffer_with(initial_capacity, max_capacity)
        } else {
            self.heap_buffer_with(initial_capacity, max_capacity)
        }
    }

    /// 以默认容量分配堆内存缓冲。
    fn heap_buffer(&self) -> Result<ByteBuf> {
        self.heap_buffer_with(DEFAULT_INITIAL_CAPACITY, DEFAULT_MAX_CAPACITY)
    }

    /// 以默认容量分配直接内存缓冲。
    fn direct_buffer(&self) -> Result<ByteBuf> {
        self.direct_buffer_with(DEFAULT_INITIAL_CAPACITY, DEFAULT_MAX_CAPACITY)
    }

    /// 以默认容量分配传输读写用的缓冲。
    fn io_buffer(&self) -> Result<ByteBuf> {
        self.io_buffer_with(DEFAULT_INITIAL_CAPACITY, DEFAULT_MAX_CAPACITY)
    }

    /// 面向传输读写的缓冲，统一使用对齐的直接内存。
    fn io_buffer_with(&self, initial_capacity: usize, max_capacity: usize) -> Result<ByteBuf> {
        self.direct_buffer_with(initial_capacity, max_capacity)
    }

    fn composite_buffer(&self) -> CompositeByteBuf {
        self.composite_buffer_with(DEFAULT_MAX_COMPONENTS)
    }

    /// 最多容纳 `max_components` 个组件的复合缓冲。
    fn composite_buffer_with(&self, max_components: usize) -> CompositeByteBuf {
        CompositeByteBuf::new(max_components)
    }

    fn calculate_new_capacity(&self, min_new_capacity: usize, max_capacity: usize) -> Result<usize> {
        calculate_new_capacity(min_new_capacity, max_capacity)
    }
}

/// 每次都向全局分配器申请新存储的分配器，计数归零时直接释放。
#[derive(Clone)]
pub struct UnpooledAllocator {
    prefer_direct: bool,
    recycler: Arc<dyn BufferRecycler>,
    leak: Arc<ResourceLeakDetector>,
}

impl UnpooledAllocator {
    pub fn new(prefer_direct: bool) -> Self {
        Self {
            prefer_direct,
            recycler: Arc::new(DropRecycler),
            leak: ResourceLeakDetector::global(),
        }
    }

    /// 改用指定的泄漏探测器。
    pub fn with_leak_detector(mut self, leak: Arc<ResourceLeakDetector>) -> Self {
        self.leak = leak;
        self
    }

    fn wrap(&self, storage: Storage, max_capacity: usize) -> Result<ByteBuf> {
        ByteBuf::from_storage(
            storage,
            max_capacity,
            Arc::clone(&self.recycler),
            self.leak.track(),
        )
    }
}

impl Default for UnpooledAllocator {
    fn default() -> Self {
        Self::new(false)
    }
}

impl fmt::Debug for UnpooledAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnpooledAllocator")
            .field("prefer_direct", &self.prefer_direct)
            .finish()
    }
}

impl ByteBufAllocator for UnpooledAllocator {
    fn heap_buffer_with(&self, initial_capacity: usize, max_capacity: usize) -> Result<ByteBuf> {
        validate_capacity(initial_capacity, max_capacity)?;
        self.wrap(Storage::heap(initial_capacity), max_capacity)
    }

    fn direct_buffer_with(&self, initial_capacity: usize, max_capacity: usize) -> Result<ByteBuf> {
        validate_capacity(initial_capacity, max_capacity)?;
        self.wrap(Storage::direct(initial_capacity)?, max_capacity)
    }

    fn prefers_direct(&self) -> bool {
        self.prefer_direct
    }
}

/// 进程级非池化缓冲的便捷入口。
#[derive(Debug, Clone, Copy)]
pub struct Unpooled;

impl Unpooled {
    fn allocator() -> &'static UnpooledAllocator {
        static ALLOCATOR: OnceLock<UnpooledAllocator> = OnceLock::new();
        ALLOCATOR.get_or_init(UnpooledAllocator::default)
    }

    /// 进程级非池化分配器，可作为 `Arc<dyn ByteBufAllocator>` 注入。
    pub fn shared_allocator() -> Arc<dyn ByteBufAllocator> {
        Arc::new(Self::allocator().clone())
    }

    pub fn buffer(initial_capacity: usize, max_capacity: usize) -> Result<ByteBuf> {
        Self::allocator().heap_buffer_with(initial_capacity, max_capacity)
    }

    pub fn direct_buffer(initial_capacity: usize, max_capacity: usize) -> Result<ByteBuf> {
        Self::allocator().direct_buffer_with(initial_capacity, max_capacity)
    }

    /// 拷贝 `bytes` 到新缓冲，写指针位于末尾。
    pub fn copied_buffer(bytes: &[u8]) -> Result<ByteBuf> {
        Self::wrapped_buffer(BytesMut::from(bytes))
    }

    /// 接管 `bytes` 作为存储，不发生拷贝。
    pub fn wrapped_buffer(bytes: BytesMut) -> Result<ByteBuf> {
        let length = bytes.len();
        let mut buf = Self::allocator().wrap(Storage::from_bytes_mut(bytes), DEFAULT_MAX_CAPACITY)?;
        buf.set_writer_index(length)?;
        Ok(buf)
    }

    /// 容量为 0 的空缓冲，不参与泄漏追踪。
    pub fn empty_buffer() -> ByteBuf {
        ByteBuf::new_root(Storage::heap(0), 0, Arc::new(DropRecycler), None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::refcnt::ReferenceCounted;

    #[test]
    fn growth_doubles_from_sixty_four() {
        assert_eq!(calculate_new_capacity(1, usize::MAX).expect("calc"), 64);
        assert_eq!(calculate_new_capacity(65, usize::MAX).expect("calc"), 128);
        assert_eq!(calculate_new_capacity(100, 100).expect("calc"), 100);
    }

    #[test]
    fn growth_steps_above_threshold() {
        let t = CALCULATE_THRESHOLD;
        assert_eq!(calculate_new_capacity(t, usize::MAX).expect("calc"), t);
        assert_eq!(calculate_new_capacity(t + 1, usize::MAX).expect("calc"), 2 * t);
        assert_eq!(calculate_new_capacity(t + 1, t + 10).expect("calc"), t + 10);
    }

    #[test]
    fn min_above_max_is_a_capacity_error() {
        let err = calculate_new_capacity(11, 10).expect_err("must fail");
        assert_eq!(err, BufferError::Capacity { requested: 11, maximum: 10 });
    }

    #[test]
    fn allocator_honours_preference() {
        let direct = UnpooledAllocator::new(true);
        let buf = direct.buffer().expect("buffer");
        assert!(buf.is_direct());
        assert_eq!(buf.capacity(), DEFAULT_INITIAL_CAPACITY);
        buf.release().expect("release");

        let heap = UnpooledAllocator::new(false);
        let buf = heap.buffer_with(8, 16).expect("buffer");
        assert!(!buf.is_direct());
        buf.release().expect("release");
        assert!(heap.heap_buffer_with(17, 16).is_err());
    }

    #[test]
    fn empty_buffer_has_no_capacity() {
        let mut empty = Unpooled::empty_buffer();
        assert_eq!(empty.capacity(), 0);
        assert!(empty.write_u8(1).is_err());
        assert!(empty.release().expect("release"));
    }
}

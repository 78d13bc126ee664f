use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};
use spin::Mutex;

use crate::allocator::{ByteBufAllocator, validate_capacity};
use crate::buf::ByteBuf;
use crate::error::Result;
use crate::leak::ResourceLeakDetector;
use crate::storage::{BufferRecycler, Storage};

/// 池化分配器的配置。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PooledAllocatorConfig {
    /// `buffer` 系列是否默认走直接内存。
    pub prefer_direct: bool,
    /// 最小尺寸档位，向上取整为 2 的幂。
    pub min_size_class: usize,
    /// 超过该容量的请求不经过自由链表。
    pub max_cached_capacity: usize,
    /// 每个档位最多缓存的空闲存储块数。
    pub max_cached_per_class: usize,
}

impl Default for PooledAllocatorConfig {
    fn default() -> Self {
        Self {
            prefer_direct: false,
            min_size_class: 64,
            max_cached_capacity: 64 * 1024,
            max_cached_per_class: 64,
        }
    }
}

/// 池统计快照。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct PoolStats {
    /// 由池分配且尚未归还系统的字节数（租出与空闲之和）。
    pub allocated_bytes: usize,
    /// 空闲链表中可立即复用的字节数。
    pub available_bytes: usize,
    /// 尚未归还的缓冲数量。
    pub active_leases: usize,
    pub pool_hits: u64,
    pub pool_misses: u64,
    /// 经由回收钩子归还的存储块数量。
    pub reclaimed: u64,
}

/// `PooledAllocator` 以尺寸档位复用存储块，减少高频收发路径上的系统分配。
///
/// # 模块角色（Why）
/// - 解码器累积缓冲与编码输出缓冲的生命周期很短、尺寸分布集中，逐个向全局堆申请代价偏高；
/// - 存储块经由缓冲的回收钩子自动回到池中，调用方只需遵守 `release` 纪律。
///
/// # 核心机制（How）
/// - 档位为 `min_size_class` 起的 2 的幂，直到 `max_cached_capacity`；
///   堆内存与直接内存各有一组 `spin::Mutex<Vec<Storage>>` 自由链表；
/// - 租借时按请求容量定位档位，命中则复用并把逻辑容量设为请求值，未命中则按档位尺寸新建；
/// - 回收时仅当物理尺寸恰为某个档位且链表未满才缓存，其余直接丢弃；
/// - `PoolMetrics` 以原子计数维护统计，供 [`statistics`](Self::statistics) 生成快照。
///
/// # 契约说明（What）
/// - 克隆共享同一个池，可跨线程并发使用；
/// - 复用的存储块不清零，缓冲的可见内容以写指针为界；
/// - 超出档位的请求仍由本分配器分配，但归还时不缓存。
///
/// # 设计权衡（Trade-offs）
/// - 自旋锁保护的链表只在租借与归还的瞬间持有，临界区极短；
/// - 在档位内增长不触发重新分配，超出档位后存储变为非档位尺寸，归还时即被丢弃。
#[derive(Clone)]
pub struct PooledAllocator {
    inner: Arc<PoolInner>,
    leak: Arc<ResourceLeakDetector>,
}

impl PooledAllocator {
    pub fn new(config: PooledAllocatorConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner::new(config)),
            leak: ResourceLeakDetector::global(),
        }
    }

    /// 改用指定的泄漏探测器。
    pub fn with_leak_detector(mut self, leak: Arc<ResourceLeakDetector>) -> Self {
        self.leak = leak;
        self
    }

    pub fn config(&self) -> &PooledAllocatorConfig {
        &self.inner.config
    }

    /// 统计快照。
    pub fn statistics(&self) -> PoolStats {
        self.inner.snapshot()
    }

    /// 清空全部自由链表，返回归还给系统的字节数。
    pub fn shrink_to_fit(&self) -> usize {
        self.inner.shrink_free_lists()
    }

    fn allocate(&self, initial_capacity: usize, max_capacity: usize, direct: bool) -> Result<ByteBuf> {
        validate_capacity(initial_capacity, max_capacity)?;
        let storage = self.inner.acquire(initial_capacity, direct)?;
        let recycler: Arc<dyn BufferRecycler> = self.inner.clone();
        match ByteBuf::from_storage(storage, max_capacity, recycler, self.leak.track()) {
            Ok(buf) => Ok(buf),
            Err(err) => {
                self.inner.metrics.decrease_active_leases();
                Err(err)
            }
        }
    }
}

impl Default for PooledAllocator {
    fn default() -> Self {
        Self::new(PooledAllocatorConfig::default())
    }
}

impl fmt::Debug for PooledAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledAllocator")
            .field("config", &self.inner.config)
            .field("stats", &self.statistics())
            .finish()
    }
}

impl ByteBufAllocator for PooledAllocator {
    fn heap_buffer_with(&self, initial_capacity: usize, max_capacity: usize) -> Result<ByteBuf> {
        self.allocate(initial_capacity, max_capacity, false)
    }

    fn direct_buffer_with(&self, initial_capacity: usize, max_capacity: usize) -> Result<ByteBuf> {
        self.allocate(initial_capacity, max_capacity, true)
    }

    fn prefers_direct(&self) -> bool {
        self.inner.config.prefer_direct
    }
}

struct PoolInner {
    config: PooledAllocatorConfig,
    class_sizes: Vec<usize>,
    heap_classes: Vec<Mutex<Vec<Storage>>>,
    direct_classes: Vec<Mutex<Vec<Storage>>>,
    metrics: PoolMetrics,
}

impl PoolInner {
    fn new(config: PooledAllocatorConfig) -> Self {
        let smallest = config.min_size_class.max(1).next_power_of_two();
        let mut class_sizes = Vec::new();
        let mut size = smallest;
        while size <= config.max_cached_capacity {
            class_sizes.push(size);
            match size.checked_mul(2) {
                Some(next) => size = next,
                None => break,
            }
        }
        let lists = |count: usize| (0..count).map(|_| Mutex::new(Vec::new())).collect();
        Self {
            config,
            heap_classes: lists(class_sizes.len()),
            direct_classes: lists(class_sizes.len()),
            class_sizes,
            metrics: PoolMetrics::default(),
        }
    }

    /// 不小于 `capacity` 的最小档位。
    fn class_for(&self, capacity: usize) -> Option<usize> {
        self.class_sizes.iter().position(|size| *size >= capacity)
    }

    fn lists(&self, direct: bool) -> &[Mutex<Vec<Storage>>] {
        if direct {
            &self.direct_classes
        } else {
            &self.heap_classes
        }
    }

    fn acquire(&self, capacity: usize, direct: bool) -> Result<Storage> {
        let Some(class) = self.class_for(capacity) else {
            let mut storage = Storage::allocate(capacity, direct)?;
            self.metrics.increase_on_new_allocation(storage.allocated());
            self.metrics.increase_active_leases();
            storage.mark_charged();
            return Ok(storage);
        };

        let reused = self.lists(direct)[class].lock().pop();
        let mut storage = match reused {
            Some(storage) => {
                self.metrics.decrease_available(storage.allocated());
                self.metrics.pool_hits.fetch_add(1, Ordering::Relaxed);
                storage
            }
            None => {
                let storage = Storage::allocate(self.class_sizes[class], direct)?;
                self.metrics.increase_on_new_allocation(storage.allocated());
                storage
            }
        };
        storage.set_capacity(capacity);
        storage.mark_charged();
        self.metrics.increase_active_leases();
        Ok(storage)
    }

    fn shrink_free_lists(&self) -> usize {
        let mut freed = 0;
        for list in self.heap_classes.iter().chain(self.direct_classes.iter()) {
            let drained: Vec<Storage> = list.lock().drain(..).collect();
            freed += drained.iter().map(Storage::allocated).sum::<usize>();
        }
        self.metrics.decrease_on_shrink(freed);
        tracing::debug!(freed_bytes = freed, "pooled allocator shrunk free lists");
        freed
    }

    fn snapshot(&self) -> PoolStats {
        PoolStats {
            allocated_bytes: self.metrics.allocated_bytes.load(Ordering::Relaxed),
            available_bytes: self.metrics.available_bytes.load(Ordering::Relaxed),
            active_leases: self.metrics.active_leases.load(Ordering::Relaxed),
            pool_hits: self.metrics.pool_hits.load(Ordering::Relaxed),
            pool_misses: self.metrics.pool_misses.load(Ordering::Relaxed),
            reclaimed: self.metrics.reclaimed.load(Ordering::Relaxed),
        }
    }
}

impl BufferRecycler for PoolInner {
    fn reclaim(&self, mut storage: Storage) {
        self.metrics.decrease_active_leases();
        self.metrics.reclaimed.fetch_add(1, Ordering::Relaxed);
        // 租出期间越档扩容的部分在此补记，之后缓存或丢弃都按实际物理大小结算。
        let allocated = storage.allocated();
        self.metrics.increase_on_growth(allocated.saturating_sub(storage.charged()));
        storage.mark_charged();
        let class = self
            .class_sizes
            .iter()
            .position(|size| *size == allocated);
        if let Some(class) = class {
            let mut list = self.lists(storage.is_direct())[class].lock();
            if list.len() < self.config.max_cached_per_class {
                list.push(storage);
                self.metrics.increase_available(allocated);
                return;
            }
        }
        self.metrics.decrease_on_loss(allocated);
    }
}

#[derive(Default)]
struct PoolMetrics {
    allocated_bytes: AtomicUsize,
    available_bytes: AtomicUsize,
    active_leases: AtomicUsize,
    pool_hits: AtomicU64,
    pool_misses: AtomicU64,
    reclaimed: AtomicU64,
}

impl PoolMetrics {
    fn increase_on_new_allocation(&self, capacity: usize) {
        self.allocated_bytes.fetch_add(capacity, Ordering::Relaxed);
        self.pool_misses.fetch_add(1, Ordering::Relaxed);
    }

    fn increase_on_growth(&self, grown: usize) {
        self.allocated_bytes.fetch_add(grown, Ordering::Relaxed);
    }

    fn increase_available(&self, capacity: usize) {
        self.available_bytes.fetch_add(capacity, Ordering::Relaxed);
    }

    fn decrease_available(&self, capacity: usize) {
        saturating_sub(&self.available_bytes, capacity);
    }

    fn decrease_on_loss(&self, capacity: usize) {
        saturating_sub(&self.allocated_bytes, capacity);
    }

    fn decrease_on_shrink(&self, capacity: usize) {
        self.decrease_available(capacity);
        self.decrease_on_loss(capacity);
    }

    fn increase_active_leases(&self) {
        self.active_leases.fetch_add(1, Ordering::Relaxed);
    }

    fn decrease_active_leases(&self) {
        saturating_sub(&self.active_leases, 1);
    }
}

fn saturating_sub(target: &AtomicUsize, value: usize) {
    let _ = target.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
        Some(current.saturating_sub(value))
    });
}

use std::alloc::{self, Layout};
use std::fmt;
use std::ptr::NonNull;
use std::slice;

use bytes::BytesMut;

use crate::error::{BufferError, Result};

/// 直接内存按缓存行对齐，便于传输层做向量化写出。
pub const DIRECT_ALIGNMENT: usize = 64;

/// `Storage` 是缓冲背后的一段字节存储。
///
/// # 设计动机（Why）
/// - 堆内存使用 `BytesMut`，直接内存（off-heap）使用按缓存行对齐的独立分配，
///   两者在缓冲层之上呈现为同一类型，池化与回收逻辑无需区分；
/// - 逻辑容量与物理分配分离：池化存储按尺寸档位分配，扩容落在档位内时只需调整逻辑容量。
///
/// # 契约说明（What）
/// - `capacity() <= allocated()` 恒成立；
/// - 只有逻辑容量范围内的字节对缓冲可见；
/// - 存储本身不含引用计数，由持有它的缓冲决定何时交还 [`BufferRecycler`]。
pub struct Storage {
    repr: Repr,
    capacity: usize,
    /// 池在租出时已计入统计的物理字节数，非池化存储为 0。
    charged: usize,
}

enum Repr {
    Heap(BytesMut),
    Direct(DirectRegion),
}

impl Storage {
    /// 分配零填充的堆存储。
    pub fn heap(capacity: usize) -> Self {
        Self {
            repr: Repr::Heap(BytesMut::zeroed(capacity)),
            capacity,
            charged: 0,
        }
    }

    /// 分配对齐的直接存储。
    pub fn direct(capacity: usize) -> Result<Self> {
        Ok(Self {
            repr: Repr::Direct(DirectRegion::new(capacity)?),
            capacity,
            charged: 0,
        })
    }

    /// 按类型分配，`direct` 为真时走直接内存。
    pub fn allocate(capacity: usize, direct: bool) -> Result<Self> {
        if direct {
            Self::direct(capacity)
        } else {
            Ok(Self::heap(capacity))
        }
    }

    /// 复用已有字节作为堆存储，逻辑容量等于字节长度。
    pub fn from_bytes_mut(bytes: BytesMut) -> Self {
        let capacity = bytes.len();
        Self {
            repr: Repr::Heap(bytes),
            capacity,
            charged: 0,
        }
    }

    /// 逻辑容量。
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 物理分配大小。
    pub fn allocated(&self) -> usize {
        match &self.repr {
            Repr::Heap(bytes) => bytes.len(),
            Repr::Direct(region) => region.size,
        }
    }

    /// 是否为直接内存。
    pub fn is_direct(&self) -> bool {
        matches!(self.repr, Repr::Direct(_))
    }

    pub(crate) fn bytes(&self) -> &[u8] {
        let physical = match &self.repr {
            Repr::Heap(bytes) => bytes.as_ref(),
            Repr::Direct(region) => region.as_slice(),
        };
        &physical[..self.capacity]
    }

    pub(crate) fn bytes_mut(&mut self) -> &mut [u8] {
        let capacity = self.capacity;
        let physical = match &mut self.repr {
            Repr::Heap(bytes) => bytes.as_mut(),
            Repr::Direct(region) => region.as_mut_slice(),
        };
        &mut physical[..capacity]
    }

    /// 调整逻辑容量，超出物理分配时重新分配同类存储并拷贝已有内容。
    pub(crate) fn grow(&mut self, new_capacity: usize) -> Result<()> {
        if new_capacity <= self.allocated() {
            self.capacity = self.capacity.max(new_capacity);
            return Ok(());
        }
        match &mut self.repr {
            Repr::Heap(bytes) => bytes.resize(new_capacity, 0),
            Repr::Direct(region) => {
                let mut larger = DirectRegion::new(new_capacity)?;
                larger.as_mut_slice()[..self.capacity]
                    .copy_from_slice(&region.as_slice()[..self.capacity]);
                *region = larger;
            }
        }
        self.capacity = new_capacity;
        Ok(())
    }

    pub(crate) fn charged(&self) -> usize {
        self.charged
    }

    /// 记录当前物理分配已计入池统计。
    pub(crate) fn mark_charged(&mut self) {
        self.charged = self.allocated();
    }

    /// 重设逻辑容量；调用方保证不超过物理分配。
    pub(crate) fn set_capacity(&mut self, capacity: usize) {
        debug_assert!(capacity <= self.allocated());
        self.capacity = capacity.min(self.allocated());
    }
}

impl fmt::Debug for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Storage")
            .field("direct", &self.is_direct())
            .field("capacity", &self.capacity)
            .field("allocated", &self.allocated())
            .finish()
    }
}

/// 按 [`DIRECT_ALIGNMENT`] 对齐的独占内存块。
struct DirectRegion {
    ptr: NonNull<u8>,
    size: usize,
}

impl DirectRegion {
    fn new(size: usize) -> Result<Self> {
        if size == 0 {
            return Ok(Self {
                ptr: NonNull::dangling(),
                size: 0,
            });
        }
        let layout = Self::layout(size)?;
        // SAFETY: layout 尺寸非零且对齐为 2 的幂。
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).unwrap_or_else(|| alloc::handle_alloc_error(layout));
        Ok(Self { ptr, size })
    }

    fn layout(size: usize) -> Result<Layout> {
        Layout::from_size_align(size, DIRECT_ALIGNMENT).map_err(|_| BufferError::Capacity {
            requested: size,
            maximum: isize::MAX as usize - DIRECT_ALIGNMENT,
        })
    }

    fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr 指向 size 字节的已初始化（零填充）独占内存，size 为 0 时为悬垂但合法的空切片。
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.size) }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: 同上，且 &mut self 保证独占访问。
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.size) }
    }
}

impl Drop for DirectRegion {
    fn drop(&mut self) {
        if self.size == 0 {
            return;
        }
        if let Ok(layout) = Self::layout(self.size) {
            // SAFETY: 与 new 中使用的 layout 完全一致。
            unsafe { alloc::dealloc(self.ptr.as_ptr(), layout) };
        }
    }
}

// SAFETY: DirectRegion 独占其内存块，不存在别名。
unsafe impl Send for DirectRegion {}
// SAFETY: 共享访问只暴露不可变切片。
unsafe impl Sync for DirectRegion {}

/// `BufferRecycler` 是缓冲的回收钩子。
///
/// # 设计初衷（Why）
/// - 计数归零时需要把存储交还给“来源”：非池化分配器直接释放，池化分配器放回自由链表；
/// - 将回收入口抽象为 trait，缓冲本身无需知道自己来自哪一个分配器。
///
/// # 契约定义（What）
/// - 每块存储在其生命周期内至多收到一次 `reclaim`；
/// - 在执行最后一次 `release` 的线程上同步调用，实现不得阻塞、不得 panic。
pub trait BufferRecycler: Send + Sync + 'static {
    /// 接收归还的存储。
    fn reclaim(&self, storage: Storage);
}

/// 直接丢弃存储的回收器，用于非池化缓冲。
#[derive(Debug, Default, Clone, Copy)]
pub struct DropRecycler;

impl BufferRecycler for DropRecycler {
    fn reclaim(&self, storage: Storage) {
        drop(storage);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_storage_is_aligned_and_zeroed() {
        let storage = Storage::direct(100).expect("direct alloc");
        assert!(storage.is_direct());
        assert_eq!(storage.bytes().as_ptr() as usize % DIRECT_ALIGNMENT, 0);
        assert!(storage.bytes().iter().all(|b| *b == 0));
    }

    #[test]
    fn grow_preserves_content_for_both_kinds() {
        for direct in [false, true] {
            let mut storage = Storage::allocate(4, direct).expect("alloc");
            storage.bytes_mut().copy_from_slice(&[1, 2, 3, 4]);
            storage.grow(16).expect("grow");
            assert_eq!(storage.capacity(), 16);
            assert_eq!(&storage.bytes()[..4], &[1, 2, 3, 4]);
        }
    }

    #[test]
    fn grow_within_allocation_only_moves_logical_capacity() {
        let mut storage = Storage::heap(64);
        storage.set_capacity(8);
        storage.grow(32).expect("grow");
        assert_eq!(storage.capacity(), 32);
        assert_eq!(storage.allocated(), 64);
    }

    #[test]
    fn zero_sized_direct_storage_is_valid() {
        let storage = Storage::direct(0).expect("zero alloc");
        assert!(storage.bytes().is_empty());
    }
}

use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use spin::RwLock;

use crate::allocator::{Unpooled, calculate_new_capacity};
use crate::error::{BufferError, Result};
use crate::leak::{AccessKind, LeakTracker};
use crate::refcnt::{RefCnt, ReferenceCounted};
use crate::storage::{BufferRecycler, Storage};

/// 多字节整数的字节序。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ByteOrder {
    /// 网络字节序。
    #[default]
    BigEndian,
    LittleEndian,
}

impl ByteOrder {
    fn decode(self, raw: &[u8]) -> u64 {
        match self {
            ByteOrder::BigEndian => raw
                .iter()
                .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte)),
            ByteOrder::LittleEndian => raw
                .iter()
                .rev()
                .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte)),
        }
    }

    fn encode(self, value: u64, out: &mut [u8]) {
        let width = out.len();
        for (i, slot) in out.iter_mut().enumerate() {
            let shift = match self {
                ByteOrder::BigEndian => 8 * (width - 1 - i),
                ByteOrder::LittleEndian => 8 * i,
            };
            *slot = (value >> shift) as u8;
        }
    }
}

/// 同一块存储的全部句柄共享的状态。
///
/// # 契约说明（What）
/// - `refcnt` 是所有共享计数视图（`slice`/`duplicate`）共用的唯一计数单元；
/// - 计数归零时 `storage` 被取走并交给 `recycler`，此后该值恒为 `None`；
/// - 若全部句柄在计数归零前被丢弃，`leak` 追踪句柄随之丢弃并报告泄漏。
struct Shared {
    refcnt: RefCnt,
    storage: RwLock<Option<Storage>>,
    recycler: Arc<dyn BufferRecycler>,
    max_capacity: usize,
    leak: Option<LeakTracker>,
}

impl Shared {
    fn record(&self, kind: AccessKind, hint: Option<&str>) {
        if let Some(tracker) = &self.leak {
            tracker.record(kind, hint);
        }
    }

    fn deallocate(&self) {
        if let Some(tracker) = &self.leak {
            tracker.close();
        }
        let storage = self.storage.write().take();
        if let Some(storage) = storage {
            self.recycler.reclaim(storage);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum View {
    /// 覆盖存储的全部逻辑容量，可扩容。
    Root,
    /// 固定窗口，容量等于窗口长度。
    Slice { offset: usize, len: usize },
}

/// `ByteBuf` 是显式引用计数的字节缓冲句柄。
///
/// # 设计动机（Why）
/// - 传输层、解码器与业务处理器之间以所有权转移的方式传递缓冲：
///   交出句柄而不 `retain` 即转移所有权，最后一位所有者负责 `release`；
/// - 解码出的帧以零拷贝切片的形式引用累积缓冲中的字节，
///   因而多个句柄可以共享同一块存储与同一个计数单元。
///
/// # 核心机制（How）
/// - 句柄由 `Arc<Shared>`、视图窗口、读写指针与字节序组成；
///   `slice`/`duplicate` 复制句柄但共享计数，`retained_*` 变体在派生前先 `retain` 一次；
/// - 计数从 1 变为 0 的那次 `release` 取走存储并同步调用回收钩子，恰好一次；
/// - 计数归零后任何读写都返回 [`BufferError::IllegalReferenceCount`]。
///
/// # 契约说明（What）
/// - 恒有 `reader_index <= writer_index <= capacity <= max_capacity`；
/// - 默认大端字节序，可通过 [`with_order`](Self::with_order) 切换；
/// - 句柄本身不实现 `Clone`，需要第二个所有者时使用 `retained_duplicate`。
///
/// # 风险提示（Trade-offs）
/// - 存储由读写锁保护，只为满足 `Sync`；同一连接上的访问本应是单线程的，锁几乎不会竞争。
pub struct ByteBuf {
    shared: Arc<Shared>,
    view: View,
    reader_index: usize,
    writer_index: usize,
    order: ByteOrder,
}

impl ByteBuf {
    /// 以一块存储构造计数为 1 的新缓冲。
    pub fn from_storage(
        storage: Storage,
        max_capacity: usize,
        recycler: Arc<dyn BufferRecycler>,
        leak: Option<LeakTracker>,
    ) -> Result<Self> {
        if storage.capacity() > max_capacity {
            return Err(BufferError::Capacity {
                requested: storage.capacity(),
                maximum: max_capacity,
            });
        }
        Ok(Self::new_root(storage, max_capacity, recycler, leak))
    }

    pub(crate) fn new_root(
        storage: Storage,
        max_capacity: usize,
        recycler: Arc<dyn BufferRecycler>,
        leak: Option<LeakTracker>,
    ) -> Self {
        debug_assert!(storage.capacity() <= max_capacity);
        Self {
            shared: Arc::new(Shared {
                refcnt: RefCnt::new(),
                storage: RwLock::new(Some(storage)),
                recycler,
                max_capacity,
                leak,
            }),
            view: View::Root,
            reader_index: 0,
            writer_index: 0,
            order: ByteOrder::BigEndian,
        }
    }

    fn derive(&self, view: View, reader_index: usize, writer_index: usize) -> Self {
        self.shared.record(AccessKind::Derive, None);
        Self {
            shared: Arc::clone(&self.shared),
            view,
            reader_index,
            writer_index,
            order: self.order,
        }
    }

    fn window(&self, storage: &Storage) -> Range<usize> {
        match self.view {
            View::Root => 0..storage.capacity(),
            View::Slice { offset, len } => offset..offset + len,
        }
    }

    fn base(&self) -> usize {
        match self.view {
            View::Root => 0,
            View::Slice { offset, .. } => offset,
        }
    }

    fn read_view<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let guard = self.shared.storage.read();
        let storage = guard.as_ref().ok_or(BufferError::released(0))?;
        let window = self.window(storage);
        let capacity = storage.capacity();
        let bytes = storage
            .bytes()
            .get(window.clone())
            .ok_or(BufferError::out_of_bounds(window.start, window.len(), capacity))?;
        Ok(f(bytes))
    }

    fn write_view<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        let mut guard = self.shared.storage.write();
        let storage = guard.as_mut().ok_or(BufferError::released(0))?;
        let window = self.window(storage);
        let capacity = storage.capacity();
        let bytes = storage
            .bytes_mut()
            .get_mut(window.clone())
            .ok_or(BufferError::out_of_bounds(window.start, window.len(), capacity))?;
        Ok(f(bytes))
    }

    fn check_index(&self, index: usize, length: usize) -> Result<()> {
        self.ensure_alive()?;
        let capacity = self.capacity();
        match index.checked_add(length) {
            Some(end) if end <= capacity => Ok(()),
            _ => Err(BufferError::out_of_bounds(index, length, capacity)),
        }
    }

    fn check_readable(&self, length: usize) -> Result<()> {
        self.ensure_alive()?;
        if length > self.readable_bytes() {
            return Err(BufferError::out_of_bounds(
                self.reader_index,
                length,
                self.writer_index,
            ));
        }
        Ok(())
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.shared.refcnt.get() == 0 {
            return Err(BufferError::released(0));
        }
        Ok(())
    }

    /// 当前容量；缓冲已回收时为 0。
    pub fn capacity(&self) -> usize {
        match self.view {
            View::Root => self
                .shared
                .storage
                .read()
                .as_ref()
                .map_or(0, Storage::capacity),
            View::Slice { len, .. } => len,
        }
    }

    /// 允许扩容到的上限；切片视图不可扩容。
    pub fn max_capacity(&self) -> usize {
        match self.view {
            View::Root => self.shared.max_capacity,
            View::Slice { len, .. } => len,
        }
    }

    pub fn reader_index(&self) -> usize {
        self.reader_index
    }

    pub fn writer_index(&self) -> usize {
        self.writer_index
    }

    pub fn set_reader_index(&mut self, index: usize) -> Result<()> {
        if index > self.writer_index {
            return Err(BufferError::out_of_bounds(index, 0, self.writer_index));
        }
        self.reader_index = index;
        Ok(())
    }

    pub fn set_writer_index(&mut self, index: usize) -> Result<()> {
        let capacity = self.capacity();
        if index < self.reader_index || index > capacity {
            return Err(BufferError::out_of_bounds(index, 0, capacity));
        }
        self.writer_index = index;
        Ok(())
    }

    /// 同时设置读写指针。
    pub fn set_index(&mut self, reader_index: usize, writer_index: usize) -> Result<()> {
        let capacity = self.capacity();
        if reader_index > writer_index || writer_index > capacity {
            return Err(BufferError::out_of_bounds(
                reader_index,
                writer_index.saturating_sub(reader_index),
                capacity,
            ));
        }
        self.reader_index = reader_index;
        self.writer_index = writer_index;
        Ok(())
    }

    pub fn readable_bytes(&self) -> usize {
        self.writer_index - self.reader_index
    }

    pub fn writable_bytes(&self) -> usize {
        self.capacity().saturating_sub(self.writer_index)
    }

    /// 扩容到上限后仍可写入的字节数。
    pub fn max_writable_bytes(&self) -> usize {
        self.max_capacity().saturating_sub(self.writer_index)
    }

    pub fn is_readable(&self) -> bool {
        self.writer_index > self.reader_index
    }

    pub fn is_writable(&self) -> bool {
        self.writable_bytes() > 0
    }

    /// 读写指针归零，不触碰内容。
    pub fn clear(&mut self) {
        self.reader_index = 0;
        self.writer_index = 0;
    }

    pub fn order(&self) -> ByteOrder {
        self.order
    }

    /// 返回使用指定字节序的同一句柄。
    pub fn with_order(mut self, order: ByteOrder) -> Self {
        self.order = order;
        self
    }

    /// 底层存储是否为直接内存。
    pub fn is_direct(&self) -> bool {
        self.shared
            .storage
            .read()
            .as_ref()
            .is_some_and(Storage::is_direct)
    }

    /// 两个句柄是否引用同一块存储。
    pub fn shares_storage_with(&self, other: &ByteBuf) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// 保证至少可再写入 `min_writable` 字节，必要时按扩容策略增长。
    pub fn ensure_writable(&mut self, min_writable: usize) -> Result<()> {
        self.ensure_alive()?;
        if min_writable <= self.writable_bytes() {
            return Ok(());
        }
        let max_capacity = self.max_capacity();
        if min_writable > max_capacity.saturating_sub(self.writer_index) {
            return Err(BufferError::Capacity {
                requested: self.writer_index.saturating_add(min_writable),
                maximum: max_capacity,
            });
        }
        let new_capacity = calculate_new_capacity(self.writer_index + min_writable, max_capacity)?;
        let mut guard = self.shared.storage.write();
        let storage = guard.as_mut().ok_or(BufferError::released(0))?;
        storage.grow(new_capacity)
    }

    /// 按指定宽度与字节序读取无符号整数，不移动读指针。
    pub fn get_uint(&self, index: usize, width: usize, order: ByteOrder) -> Result<u64> {
        if !(1..=8).contains(&width) {
            return Err(BufferError::InvalidArgument(
                "integer width must be within 1..=8",
            ));
        }
        let mut raw = [0u8; 8];
        self.get_bytes(index, &mut raw[..width])?;
        Ok(order.decode(&raw[..width]))
    }

    /// 按指定宽度与字节序写入无符号整数的低 `width` 字节，不移动写指针。
    pub fn set_uint(&mut self, index: usize, width: usize, value: u64, order: ByteOrder) -> Result<()> {
        if !(1..=8).contains(&width) {
            return Err(BufferError::InvalidArgument(
                "integer width must be within 1..=8",
            ));
        }
        let mut raw = [0u8; 8];
        order.encode(value, &mut raw[..width]);
        self.set_bytes(index, &raw[..width])
    }

    pub fn get_u8(&self, index: usize) -> Result<u8> {
        self.check_index(index, 1)?;
        self.read_view(|bytes| bytes[index])
    }

    pub fn get_u16(&self, index: usize) -> Result<u16> {
        self.get_uint(index, 2, self.order).map(|v| v as u16)
    }

    pub fn get_u24(&self, index: usize) -> Result<u32> {
        self.get_uint(index, 3, self.order).map(|v| v as u32)
    }

    pub fn get_u32(&self, index: usize) -> Result<u32> {
        self.get_uint(index, 4, self.order).map(|v| v as u32)
    }

    pub fn get_u64(&self, index: usize) -> Result<u64> {
        self.get_uint(index, 8, self.order)
    }

    pub fn get_i64(&self, index: usize) -> Result<i64> {
        self.get_u64(index).map(|v| v as i64)
    }

    /// 将 `[index, index + dst.len())` 拷贝到 `dst`。
    pub fn get_bytes(&self, index: usize, dst: &mut [u8]) -> Result<()> {
        self.check_index(index, dst.len())?;
        self.read_view(|bytes| dst.copy_from_slice(&bytes[index..index + dst.len()]))
    }

    pub fn set_u8(&mut self, index: usize, value: u8) -> Result<()> {
        self.set_bytes(index, &[value])
    }

    pub fn set_u16(&mut self, index: usize, value: u16) -> Result<()> {
        self.set_uint(index, 2, u64::from(value), self.order)
    }

    pub fn set_u24(&mut self, index: usize, value: u32) -> Result<()> {
        self.set_uint(index, 3, u64::from(value), self.order)
    }

    pub fn set_u32(&mut self, index: usize, value: u32) -> Result<()> {
        self.set_uint(index, 4, u64::from(value), self.order)
    }

    pub fn set_u64(&mut self, index: usize, value: u64) -> Result<()> {
        self.set_uint(index, 8, value, self.order)
    }

    pub fn set_i64(&mut self, index: usize, value: i64) -> Result<()> {
        self.set_u64(index, value as u64)
    }

    /// 将 `src` 写入 `[index, index + src.len())`。
    pub fn set_bytes(&mut self, index: usize, src: &[u8]) -> Result<()> {
        self.check_index(index, src.len())?;
        self.write_view(|bytes| bytes[index..index + src.len()].copy_from_slice(src))
    }

    fn read_uint(&mut self, width: usize) -> Result<u64> {
        self.check_readable(width)?;
        let value = self.get_uint(self.reader_index, width, self.order)?;
        self.reader_index += width;
        Ok(value)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        self.check_readable(1)?;
        let value = self.get_u8(self.reader_index)?;
        self.reader_index += 1;
        Ok(value)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        self.read_uint(2).map(|v| v as u16)
    }

    pub fn read_u24(&mut self) -> Result<u32> {
        self.read_uint(3).map(|v| v as u32)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        self.read_uint(4).map(|v| v as u32)
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        self.read_uint(8)
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        self.read_uint(8).map(|v| v as i64)
    }

    /// 读满 `dst` 并推进读指针。
    pub fn read_bytes_into(&mut self, dst: &mut [u8]) -> Result<()> {
        self.check_readable(dst.len())?;
        self.get_bytes(self.reader_index, dst)?;
        self.reader_index += dst.len();
        Ok(())
    }

    /// 跳过 `length` 个可读字节。
    pub fn skip_bytes(&mut self, length: usize) -> Result<()> {
        self.ensure_alive()?;
        self.check_readable(length)?;
        self.reader_index += length;
        Ok(())
    }

    fn write_uint(&mut self, width: usize, value: u64) -> Result<()> {
        self.ensure_writable(width)?;
        self.set_uint(self.writer_index, width, value, self.order)?;
        self.writer_index += width;
        Ok(())
    }

    pub fn write_u8(&mut self, value: u8) -> Result<()> {
        self.write_uint(1, u64::from(value))
    }

    pub fn write_u16(&mut self, value: u16) -> Result<()> {
        self.write_uint(2, u64::from(value))
    }

    pub fn write_u24(&mut self, value: u32) -> Result<()> {
        self.write_uint(3, u64::from(value))
    }

    pub fn write_u32(&mut self, value: u32) -> Result<()> {
        self.write_uint(4, u64::from(value))
    }

    pub fn write_u64(&mut self, value: u64) -> Result<()> {
        self.write_uint(8, value)
    }

    pub fn write_i64(&mut self, value: i64) -> Result<()> {
        self.write_uint(8, value as u64)
    }

    /// 追加 `src` 并推进写指针。
    pub fn write_bytes(&mut self, src: &[u8]) -> Result<()> {
        self.ensure_writable(src.len())?;
        self.set_bytes(self.writer_index, src)?;
        self.writer_index += src.len();
        Ok(())
    }

    /// 将 `src` 的全部可读字节追加到本缓冲，并推进 `src` 的读指针。
    pub fn write_buf(&mut self, src: &mut ByteBuf) -> Result<()> {
        let length = src.readable_bytes();
        if length == 0 {
            return src.ensure_alive();
        }
        self.ensure_writable(length)?;
        if self.shares_storage_with(src) {
            let staged = src.to_vec()?;
            self.set_bytes(self.writer_index, &staged)?;
        } else {
            self.copy_across(src, length)?;
        }
        self.writer_index += length;
        src.reader_index += length;
        Ok(())
    }

    fn copy_across(&self, src: &ByteBuf, length: usize) -> Result<()> {
        // 两把锁按共享状态的地址排序获取，避免交叉拷贝时互相等待。
        let src_first = Arc::as_ptr(&src.shared) < Arc::as_ptr(&self.shared);
        let src_guard;
        let mut dst_guard;
        if src_first {
            src_guard = src.shared.storage.read();
            dst_guard = self.shared.storage.write();
        } else {
            dst_guard = self.shared.storage.write();
            src_guard = src.shared.storage.read();
        }
        let src_storage = src_guard.as_ref().ok_or(BufferError::released(0))?;
        let dst_storage = dst_guard.as_mut().ok_or(BufferError::released(0))?;

        let src_start = src.base() + src.reader_index;
        let dst_start = self.base() + self.writer_index;
        let src_capacity = src_storage.capacity();
        let from = src_storage
            .bytes()
            .get(src_start..src_start + length)
            .ok_or(BufferError::out_of_bounds(src_start, length, src_capacity))?;
        let dst_capacity = dst_storage.capacity();
        let to = dst_storage
            .bytes_mut()
            .get_mut(dst_start..dst_start + length)
            .ok_or(BufferError::out_of_bounds(dst_start, length, dst_capacity))?;
        to.copy_from_slice(from);
        Ok(())
    }

    /// 丢弃已读字节：把可读区间搬到起点并相应调整读写指针。
    pub fn discard_read_bytes(&mut self) -> Result<()> {
        self.ensure_alive()?;
        if self.reader_index == 0 {
            return Ok(());
        }
        let (start, end) = (self.reader_index, self.writer_index);
        if start != end {
            self.write_view(|bytes| bytes.copy_within(start..end, 0))?;
        }
        self.writer_index -= self.reader_index;
        self.reader_index = 0;
        Ok(())
    }

    /// 共享计数的切片，覆盖 `[index, index + length)`。
    pub fn slice(&self, index: usize, length: usize) -> Result<ByteBuf> {
        self.ensure_alive()?;
        self.check_index(index, length)?;
        Ok(self.derive(
            View::Slice {
                offset: self.base() + index,
                len: length,
            },
            0,
            length,
        ))
    }

    /// 覆盖当前可读区间的共享计数切片。
    pub fn readable_slice(&self) -> Result<ByteBuf> {
        self.slice(self.reader_index, self.readable_bytes())
    }

    /// 先 `retain` 再切片，返回的切片拥有独立的一份所有权。
    pub fn retained_slice(&self, index: usize, length: usize) -> Result<ByteBuf> {
        self.check_index(index, length)?;
        self.retain_n(1)?;
        self.slice(index, length)
    }

    /// 读出 `length` 字节的共享计数切片并推进读指针。
    pub fn read_slice(&mut self, length: usize) -> Result<ByteBuf> {
        self.check_readable(length)?;
        let slice = self.slice(self.reader_index, length)?;
        self.reader_index += length;
        Ok(slice)
    }

    /// 读出 `length` 字节的 retained 切片并推进读指针。
    pub fn read_retained_slice(&mut self, length: usize) -> Result<ByteBuf> {
        self.check_readable(length)?;
        let slice = self.retained_slice(self.reader_index, length)?;
        self.reader_index += length;
        Ok(slice)
    }

    /// 共享计数、读写指针独立的完整视图。
    pub fn duplicate(&self) -> Result<ByteBuf> {
        self.ensure_alive()?;
        Ok(self.derive(self.view, self.reader_index, self.writer_index))
    }

    /// 先 `retain` 再复制视图。
    pub fn retained_duplicate(&self) -> Result<ByteBuf> {
        self.retain_n(1)?;
        self.duplicate()
    }

    /// 将 `[index, index + length)` 拷贝到新的非池化缓冲。
    pub fn copy(&self, index: usize, length: usize) -> Result<ByteBuf> {
        let mut bytes = vec![0u8; length];
        self.get_bytes(index, &mut bytes)?;
        Unpooled::copied_buffer(&bytes)
    }

    /// 可读区间的拷贝。
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        self.with_readable(<[u8]>::to_vec)
    }

    /// 可读区间的不可变快照。
    pub fn to_bytes(&self) -> Result<Bytes> {
        self.with_readable(Bytes::copy_from_slice)
    }

    /// 以借用方式访问可读区间。
    pub fn with_readable<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let (start, end) = (self.reader_index, self.writer_index);
        self.read_view(|bytes| f(&bytes[start..end]))
    }
}

impl ReferenceCounted for ByteBuf {
    fn ref_cnt(&self) -> usize {
        self.shared.refcnt.get()
    }

    fn retain_n(&self, increment: usize) -> Result<()> {
        self.shared.refcnt.retain(increment)?;
        self.shared.record(AccessKind::Retain, None);
        Ok(())
    }

    fn release_n(&self, decrement: usize) -> Result<bool> {
        let deallocated = self.shared.refcnt.release(decrement)?;
        if deallocated {
            self.shared.deallocate();
        } else {
            self.shared.record(AccessKind::Release, None);
        }
        Ok(deallocated)
    }

    fn touch(&self, hint: Option<&str>) {
        self.shared.record(AccessKind::Touch, hint);
    }
}

impl fmt::Debug for ByteBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteBuf")
            .field("ridx", &self.reader_index)
            .field("widx", &self.writer_index)
            .field("cap", &self.capacity())
            .field("max_cap", &self.max_capacity())
            .field("ref_cnt", &self.ref_cnt())
            .field("order", &self.order)
            .finish()
    }
}

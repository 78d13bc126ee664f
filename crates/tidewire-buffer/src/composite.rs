use std::fmt;

use spin::Mutex;

use crate::allocator::{DEFAULT_MAX_CAPACITY, Unpooled};
use crate::buf::ByteBuf;
use crate::error::{BufferError, Result};
use crate::refcnt::{RefCnt, ReferenceCounted};

/// `CompositeByteBuf` 把多个组件缓冲呈现为一段连续的可读区域，不拷贝组件内容。
///
/// # 契约说明（What）
/// - `add_component` 转移组件所有权，组件的可读区间按加入顺序拼接；
/// - 组件数超过 `max_components` 时自动合并为单个非池化缓冲；
/// - 自身计数归零时，每个组件恰好被释放一次；
/// - 读指针作用于拼接后的逻辑区间，组件自身的读写指针保持不变。
///
/// # 使用须知（How）
/// - 处理器链的消息联合体没有组合缓冲变体，组合缓冲以
///   `PipelineMessage::counted` 作为计数业务消息传递，释放消息即释放全部组件；
/// - 需要交给只接收 `ByteBuf` 的处理器时，先 `to_vec` 或逐段读出后写入新缓冲。
pub struct CompositeByteBuf {
    refcnt: RefCnt,
    max_components: usize,
    components: Mutex<Vec<ByteBuf>>,
    reader_index: usize,
}

impl CompositeByteBuf {
    /// 构造计数为 1 的空组合缓冲，`max_components` 至少为 1。
    pub fn new(max_components: usize) -> Self {
        Self {
            refcnt: RefCnt::new(),
            max_components: max_components.max(1),
            components: Mutex::new(Vec::new()),
            reader_index: 0,
        }
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.refcnt.get() == 0 {
            return Err(BufferError::released(0));
        }
        Ok(())
    }

    pub fn max_components(&self) -> usize {
        self.max_components
    }

    pub fn num_components(&self) -> usize {
        self.components.lock().len()
    }

    /// 追加组件；超出组件上限时立即合并。
    pub fn add_component(&mut self, component: ByteBuf) -> Result<()> {
        if let Err(err) = self.ensure_alive() {
            component.release()?;
            return Err(err);
        }
        let over_limit = {
            let mut components = self.components.lock();
            components.push(component);
            components.len() > self.max_components
        };
        if over_limit {
            self.consolidate()?;
        }
        Ok(())
    }

    pub fn reader_index(&self) -> usize {
        self.reader_index
    }

    /// 全部组件可读字节之和。
    pub fn writer_index(&self) -> usize {
        self.components
            .lock()
            .iter()
            .map(ByteBuf::readable_bytes)
            .sum()
    }

    pub fn readable_bytes(&self) -> usize {
        self.writer_index() - self.reader_index
    }

    pub fn is_readable(&self) -> bool {
        self.readable_bytes() > 0
    }

    /// 按逻辑下标读取一个字节。
    pub fn get_u8(&self, index: usize) -> Result<u8> {
        let mut byte = [0u8; 1];
        self.get_bytes(index, &mut byte)?;
        Ok(byte[0])
    }

    /// 将逻辑区间 `[index, index + dst.len())` 拷贝到 `dst`，可跨越组件边界。
    pub fn get_bytes(&self, index: usize, dst: &mut [u8]) -> Result<()> {
        self.ensure_alive()?;
        let components = self.components.lock();
        let total: usize = components.iter().map(ByteBuf::readable_bytes).sum();
        match index.checked_add(dst.len()) {
            Some(end) if end <= total => {}
            _ => return Err(BufferError::out_of_bounds(index, dst.len(), total)),
        }

        let mut skip = index;
        let mut copied = 0;
        for component in components.iter() {
            if copied == dst.len() {
                break;
            }
            let readable = component.readable_bytes();
            if skip >= readable {
                skip -= readable;
                continue;
            }
            let take = (readable - skip).min(dst.len() - copied);
            component.get_bytes(
                component.reader_index() + skip,
                &mut dst[copied..copied + take],
            )?;
            copied += take;
            skip = 0;
        }
        Ok(())
    }

    /// 读满 `dst` 并推进读指针。
    pub fn read_bytes(&mut self, dst: &mut [u8]) -> Result<()> {
        self.get_bytes(self.reader_index, dst)?;
        self.reader_index += dst.len();
        Ok(())
    }

    pub fn skip_bytes(&mut self, length: usize) -> Result<()> {
        self.ensure_alive()?;
        let readable = self.readable_bytes();
        if length > readable {
            return Err(BufferError::out_of_bounds(
                self.reader_index,
                length,
                self.writer_index(),
            ));
        }
        self.reader_index += length;
        Ok(())
    }

    /// 可读区间的拷贝。
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        let mut out = vec![0u8; self.readable_bytes()];
        self.get_bytes(self.reader_index, &mut out)?;
        Ok(out)
    }

    /// 将全部组件合并为一个非池化缓冲并释放原组件，逻辑读指针保持不变。
    pub fn consolidate(&mut self) -> Result<()> {
        self.ensure_alive()?;
        let mut components = self.components.lock();
        if components.len() <= 1 {
            return Ok(());
        }
        let total: usize = components.iter().map(ByteBuf::readable_bytes).sum();
        let mut merged = Unpooled::buffer(total, DEFAULT_MAX_CAPACITY)?;
        for component in components.iter_mut() {
            if let Err(err) = merged.write_buf(component) {
                merged.release()?;
                return Err(err);
            }
        }
        for component in components.drain(..) {
            component.release()?;
        }
        components.push(merged);
        Ok(())
    }
}

impl ReferenceCounted for CompositeByteBuf {
    fn ref_cnt(&self) -> usize {
        self.refcnt.get()
    }

    fn retain_n(&self, increment: usize) -> Result<()> {
        self.refcnt.retain(increment).map(|_| ())
    }

    fn release_n(&self, decrement: usize) -> Result<bool> {
        let deallocated = self.refcnt.release(decrement)?;
        if deallocated {
            let components: Vec<ByteBuf> = self.components.lock().drain(..).collect();
            for component in components {
                if let Err(err) = component.release() {
                    tracing::warn!(error = %err, code = err.code(), "failed to release composite component");
                }
            }
        }
        Ok(deallocated)
    }

    fn touch(&self, hint: Option<&str>) {
        for component in self.components.lock().iter() {
            component.touch(hint);
        }
    }
}

impl fmt::Debug for CompositeByteBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompositeByteBuf")
            .field("components", &self.num_components())
            .field("max_components", &self.max_components)
            .field("ridx", &self.reader_index)
            .field("ref_cnt", &self.refcnt.get())
            .finish()
    }
}

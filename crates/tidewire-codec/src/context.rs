use std::fmt;

use tidewire_buffer::ByteBufAllocator;
use tidewire_pipeline::HandlerContext;

/// `DecodeContext` 为一次解码调用提供辅助资源。
///
/// # 设计背景（Why）
/// - 解码步骤只需要分配器与所在处理器的名称，不应直接触碰处理器链：
///   产出统一交给适配器转发，所有权交接因此集中在一处。
///
/// # 契约说明（What）
/// - 上下文只在单次 `decode` 调用内有效；
/// - 通过 [`allocator`](Self::allocator) 申请的缓冲归解码器所有，须转发或释放。
pub struct DecodeContext<'a> {
    allocator: &'a dyn ByteBufAllocator,
    name: &'a str,
}

impl<'a> DecodeContext<'a> {
    pub fn new(allocator: &'a dyn ByteBufAllocator, name: &'a str) -> Self {
        Self { allocator, name }
    }

    pub(crate) fn of(ctx: &'a HandlerContext<'_>) -> Self {
        Self::new(ctx.allocator(), ctx.name())
    }

    pub fn allocator(&self) -> &'a dyn ByteBufAllocator {
        self.allocator
    }

    /// 所在处理器登记的名称。
    pub fn name(&self) -> &'a str {
        self.name
    }
}

impl fmt::Debug for DecodeContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodeContext")
            .field("name", &self.name)
            .field("prefers_direct", &self.allocator.prefers_direct())
            .finish()
    }
}

/// `EncodeContext` 为一次编码调用提供辅助资源，契约与 [`DecodeContext`] 对称。
pub struct EncodeContext<'a> {
    allocator: &'a dyn ByteBufAllocator,
    name: &'a str,
}

impl<'a> EncodeContext<'a> {
    pub fn new(allocator: &'a dyn ByteBufAllocator, name: &'a str) -> Self {
        Self { allocator, name }
    }

    pub(crate) fn of(ctx: &'a HandlerContext<'_>) -> Self {
        Self::new(ctx.allocator(), ctx.name())
    }

    pub fn allocator(&self) -> &'a dyn ByteBufAllocator {
        self.allocator
    }

    pub fn name(&self) -> &'a str {
        self.name
    }
}

impl fmt::Debug for EncodeContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncodeContext")
            .field("name", &self.name)
            .field("prefers_direct", &self.allocator.prefers_direct())
            .finish()
    }
}

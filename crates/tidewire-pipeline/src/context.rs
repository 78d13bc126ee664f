use tidewire_buffer::ByteBufAllocator;

use crate::error::PipelineError;
use crate::message::PipelineMessage;
use crate::pipeline::PipelineCore;

/// 处理器调用期间可见的链路视图。
///
/// # 设计背景（Why）
/// - 处理器不持有链路引用，事件回调时由链路临时借出自身并标注当前位置，
///   处理器借此把事件继续传给相邻处理器。
///
/// # 契约说明（What）
/// - `fire_*` 把入站事件交给当前位置之后的第一个入站处理器，链尾之后是 `InboundSink`；
/// - `write`/`flush`/`close` 把出站事件交给当前位置之前的第一个出站处理器，链首之前是传输层；
/// - 上下文只在一次回调内有效，无法被保存。
pub struct HandlerContext<'a> {
    core: &'a mut PipelineCore,
    index: usize,
}

impl<'a> HandlerContext<'a> {
    pub(crate) fn new(core: &'a mut PipelineCore, index: usize) -> Self {
        Self { core, index }
    }

    /// 当前处理器登记的名称。
    pub fn name(&self) -> &str {
        self.core.name(self.index)
    }

    /// 链路使用的分配器，解码器以它申请累积缓冲与输出缓冲。
    pub fn allocator(&self) -> &dyn ByteBufAllocator {
        self.core.allocator()
    }

    pub fn fire_channel_active(&mut self) -> Result<(), PipelineError> {
        self.core.fire_channel_active(self.index + 1)
    }

    pub fn fire_channel_read(&mut self, msg: PipelineMessage) -> Result<(), PipelineError> {
        self.core.fire_channel_read(self.index + 1, msg)
    }

    pub fn fire_channel_read_complete(&mut self) -> Result<(), PipelineError> {
        self.core.fire_channel_read_complete(self.index + 1)
    }

    pub fn fire_exception_caught(&mut self, error: PipelineError) -> Result<(), PipelineError> {
        self.core.fire_exception_caught(self.index + 1, error)
    }

    pub fn fire_channel_inactive(&mut self) -> Result<(), PipelineError> {
        self.core.fire_channel_inactive(self.index + 1)
    }

    pub fn write(&mut self, msg: PipelineMessage) -> Result<(), PipelineError> {
        self.core.write(self.index, msg)
    }

    pub fn flush(&mut self) -> Result<(), PipelineError> {
        self.core.flush(self.index)
    }

    pub fn write_and_flush(&mut self, msg: PipelineMessage) -> Result<(), PipelineError> {
        self.write(msg)?;
        self.flush()
    }

    pub fn close(&mut self) -> Result<(), PipelineError> {
        self.core.close(self.index)
    }
}

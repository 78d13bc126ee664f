use std::fmt;
use std::sync::Arc;

use tidewire_buffer::{ByteBufAllocator, ReferenceCounted, Unpooled};

use crate::context::HandlerContext;
use crate::error::PipelineError;
use crate::handler::{Handler, InboundHandler, OutboundHandler};
use crate::message::PipelineMessage;

/// 传输层协作方：接收出站消息并负责真正的写出。
///
/// # 契约说明（What）
/// - `write` 获得消息所有权，写出完成后由实现负责 `release`；
/// - `close` 之后的 `write` 应释放消息并返回 [`PipelineError::Closed`]。
pub trait Transport: Send + 'static {
    /// 接收一条出站消息，可先缓存到 `flush`。
    fn write(&mut self, msg: PipelineMessage) -> Result<(), PipelineError>;

    /// 把已接收的消息写出。
    fn flush(&mut self) -> Result<(), PipelineError>;

    /// 关闭传输，之后的写入被拒绝。
    fn close(&mut self) -> Result<(), PipelineError>;
}

/// 链路末端的协作方：接收没有被任何入站处理器消费的事件。
pub trait InboundSink: Send + 'static {
    fn on_read(&mut self, msg: PipelineMessage) -> Result<(), PipelineError>;

    fn on_exception(&mut self, error: PipelineError) -> Result<(), PipelineError> {
        tracing::warn!(
            error = %error,
            code = error.code(),
            "exception reached the tail of the pipeline without being handled"
        );
        Ok(())
    }

    fn on_channel_active(&mut self) {}

    fn on_read_complete(&mut self) {}

    fn on_channel_inactive(&mut self) {}
}

/// 默认末端：释放抵达末端的消息并记录调试日志。
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardingSink;

impl InboundSink for DiscardingSink {
    fn on_read(&mut self, msg: PipelineMessage) -> Result<(), PipelineError> {
        tracing::debug!(
            kind = msg.kind(),
            "discarded inbound message that reached the tail of the pipeline"
        );
        msg.release()?;
        Ok(())
    }
}

struct Entry {
    name: String,
    inbound: bool,
    outbound: bool,
    /// 处理器被调用期间暂时取出，调用结束后放回。
    handler: Option<Handler>,
}

pub(crate) struct PipelineCore {
    entries: Vec<Entry>,
    transport: Box<dyn Transport>,
    sink: Box<dyn InboundSink>,
    allocator: Arc<dyn ByteBufAllocator>,
    closed: bool,
}

impl PipelineCore {
    pub(crate) fn name(&self, index: usize) -> &str {
        self.entries.get(index).map_or("", |entry| entry.name.as_str())
    }

    pub(crate) fn allocator(&self) -> &dyn ByteBufAllocator {
        self.allocator.as_ref()
    }

    fn next_inbound(&self, from: usize) -> Option<usize> {
        (from..self.entries.len()).find(|&index| self.entries[index].inbound)
    }

    fn prev_outbound(&self, before: usize) -> Option<usize> {
        (0..before.min(self.entries.len()))
            .rev()
            .find(|&index| self.entries[index].outbound)
    }

    fn is_busy(&self, index: usize) -> bool {
        self.entries[index].handler.is_none()
    }

    fn reentrant(&self, index: usize) -> PipelineError {
        PipelineError::ReentrantCall(self.entries[index].name.clone())
    }

    fn invoke_inbound<F>(&mut self, index: usize, call: F) -> Result<(), PipelineError>
    where
        F: FnOnce(&mut dyn InboundHandler, &mut HandlerContext<'_>) -> Result<(), PipelineError>,
    {
        let Some(mut handler) = self.entries[index].handler.take() else {
            return Err(self.reentrant(index));
        };
        let result = match handler.as_inbound() {
            Some(inbound) => call(inbound, &mut HandlerContext::new(self, index)),
            None => Ok(()),
        };
        self.entries[index].handler = Some(handler);
        result
    }

    fn invoke_outbound<F>(&mut self, index: usize, call: F) -> Result<(), PipelineError>
    where
        F: FnOnce(&mut dyn OutboundHandler, &mut HandlerContext<'_>) -> Result<(), PipelineError>,
    {
        let Some(mut handler) = self.entries[index].handler.take() else {
            return Err(self.reentrant(index));
        };
        let result = match handler.as_outbound() {
            Some(outbound) => call(outbound, &mut HandlerContext::new(self, index)),
            None => Ok(()),
        };
        self.entries[index].handler = Some(handler);
        result
    }

    pub(crate) fn fire_channel_active(&mut self, from: usize) -> Result<(), PipelineError> {
        match self.next_inbound(from) {
            Some(index) => self.invoke_inbound(index, |h, ctx| h.on_channel_active(ctx)),
            None => {
                self.sink.on_channel_active();
                Ok(())
            }
        }
    }

    pub(crate) fn fire_channel_read(
        &mut self,
        from: usize,
        msg: PipelineMessage,
    ) -> Result<(), PipelineError> {
        match self.next_inbound(from) {
            Some(index) if self.is_busy(index) => {
                msg.release()?;
                Err(self.reentrant(index))
            }
            Some(index) => self.invoke_inbound(index, |h, ctx| h.on_read(ctx, msg)),
            None => self.sink.on_read(msg),
        }
    }

    pub(crate) fn fire_channel_read_complete(&mut self, from: usize) -> Result<(), PipelineError> {
        match self.next_inbound(from) {
            Some(index) => self.invoke_inbound(index, |h, ctx| h.on_read_complete(ctx)),
            None => {
                self.sink.on_read_complete();
                Ok(())
            }
        }
    }

    pub(crate) fn fire_exception_caught(
        &mut self,
        from: usize,
        error: PipelineError,
    ) -> Result<(), PipelineError> {
        match self.next_inbound(from) {
            Some(index) if self.is_busy(index) => Err(error),
            Some(index) => self.invoke_inbound(index, |h, ctx| h.on_exception_caught(ctx, error)),
            None => self.sink.on_exception(error),
        }
    }

    pub(crate) fn fire_channel_inactive(&mut self, from: usize) -> Result<(), PipelineError> {
        match self.next_inbound(from) {
            Some(index) => self.invoke_inbound(index, |h, ctx| h.on_channel_inactive(ctx)),
            None => {
                self.sink.on_channel_inactive();
                Ok(())
            }
        }
    }

    pub(crate) fn write(&mut self, before: usize, msg: PipelineMessage) -> Result<(), PipelineError> {
        if self.closed {
            msg.release()?;
            return Err(PipelineError::Closed);
        }
        match self.prev_outbound(before) {
            Some(index) if self.is_busy(index) => {
                msg.release()?;
                Err(self.reentrant(index))
            }
            Some(index) => self.invoke_outbound(index, |h, ctx| h.on_write(ctx, msg)),
            None => self.transport.write(msg),
        }
    }

    pub(crate) fn flush(&mut self, before: usize) -> Result<(), PipelineError> {
        match self.prev_outbound(before) {
            Some(index) => self.invoke_outbound(index, |h, ctx| h.on_flush(ctx)),
            None => self.transport.flush(),
        }
    }

    pub(crate) fn close(&mut self, before: usize) -> Result<(), PipelineError> {
        match self.prev_outbound(before) {
            Some(index) => self.invoke_outbound(index, |h, ctx| h.on_close(ctx)),
            None => {
                self.closed = true;
                self.transport.close()
            }
        }
    }

    fn handler_added(&mut self, index: usize) -> Result<(), PipelineError> {
        let Some(mut handler) = self.entries[index].handler.take() else {
            return Err(self.reentrant(index));
        };
        let result = handler
            .as_channel_handler()
            .on_handler_added(&mut HandlerContext::new(self, index));
        self.entries[index].handler = Some(handler);
        result
    }

    fn handler_removed(&mut self, index: usize) -> (Option<Handler>, Result<(), PipelineError>) {
        let Some(mut handler) = self.entries[index].handler.take() else {
            return (None, Err(self.reentrant(index)));
        };
        let result = handler
            .as_channel_handler()
            .on_handler_removed(&mut HandlerContext::new(self, index));
        self.entries.remove(index);
        (Some(handler), result)
    }
}

/// `Pipeline` 是一条连接上有序的处理器链。
///
/// # 设计背景（Why）
/// - 入站事件自前向后、出站事件自后向前穿过处理器，前端是传输层，末端是业务侧的 [`InboundSink`]；
/// - 处理器以命名条目登记，可在事件之间增删，移除时触发 `on_handler_removed` 以释放其持有的缓冲。
///
/// # 核心机制（How）
/// - 条目保存 `Option<Handler>`：调用某个处理器时把它从槽位中取出，借出整条链的可变引用构造
///   [`HandlerContext`]，调用结束后放回，使处理器可以同步地向前后继续转发而无需加锁；
/// - 事件再次抵达仍在执行中的处理器时返回 [`PipelineError::ReentrantCall`]，携带的消息会被释放。
///
/// # 契约说明（What）
/// - 所有入口都在连接所属的单一执行上下文中调用；
/// - 入口返回处理器链上产生的第一个错误，连接级策略（关闭、记录）由调用方决定；
/// - `close` 之后写入的消息被释放并返回 [`PipelineError::Closed`]。
pub struct Pipeline {
    core: PipelineCore,
}

impl Pipeline {
    /// 以默认末端（[`DiscardingSink`]）与共享非池化分配器构造空链。
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self::with_parts(transport, Box::new(DiscardingSink), Unpooled::shared_allocator())
    }

    /// 以指定的传输、末端与分配器构造空链。
    pub fn with_parts(
        transport: Box<dyn Transport>,
        sink: Box<dyn InboundSink>,
        allocator: Arc<dyn ByteBufAllocator>,
    ) -> Self {
        Self {
            core: PipelineCore {
                entries: Vec::new(),
                transport,
                sink,
                allocator,
                closed: false,
            },
        }
    }

    pub fn allocator(&self) -> &dyn ByteBufAllocator {
        self.core.allocator()
    }

    pub fn is_closed(&self) -> bool {
        self.core.closed
    }

    /// 按链路顺序返回处理器名称。
    pub fn names(&self) -> Vec<String> {
        self.core.entries.iter().map(|entry| entry.name.clone()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.core.entries.iter().position(|entry| entry.name == name)
    }

    fn insert(&mut self, index: usize, name: &str, handler: Handler) -> Result<(), PipelineError> {
        if self.contains(name) {
            return Err(PipelineError::DuplicateName(name.to_owned()));
        }
        self.core.entries.insert(
            index,
            Entry {
                name: name.to_owned(),
                inbound: handler.is_inbound(),
                outbound: handler.is_outbound(),
                handler: Some(handler),
            },
        );
        self.core.handler_added(index)
    }

    /// 在链路最前端（靠近传输层）插入处理器。
    pub fn add_first(&mut self, name: &str, handler: Handler) -> Result<(), PipelineError> {
        self.insert(0, name, handler)
    }

    /// 在链路最末端（靠近业务侧）插入处理器。
    pub fn add_last(&mut self, name: &str, handler: Handler) -> Result<(), PipelineError> {
        let index = self.core.entries.len();
        self.insert(index, name, handler)
    }

    /// 移除并返回处理器；其 `on_handler_removed` 在离开链路前执行。
    pub fn remove(&mut self, name: &str) -> Result<Handler, PipelineError> {
        let index = self
            .position(name)
            .ok_or_else(|| PipelineError::NoSuchHandler(name.to_owned()))?;
        match self.core.handler_removed(index) {
            (Some(handler), Ok(())) => Ok(handler),
            (_, Err(err)) => Err(err),
            (None, Ok(())) => Err(PipelineError::NoSuchHandler(name.to_owned())),
        }
    }

    pub fn fire_channel_active(&mut self) -> Result<(), PipelineError> {
        self.core.fire_channel_active(0)
    }

    pub fn fire_channel_read(&mut self, msg: PipelineMessage) -> Result<(), PipelineError> {
        if self.core.closed {
            msg.release()?;
            return Err(PipelineError::Closed);
        }
        self.core.fire_channel_read(0, msg)
    }

    pub fn fire_channel_read_complete(&mut self) -> Result<(), PipelineError> {
        self.core.fire_channel_read_complete(0)
    }

    pub fn fire_exception_caught(&mut self, error: PipelineError) -> Result<(), PipelineError> {
        self.core.fire_exception_caught(0, error)
    }

    pub fn fire_channel_inactive(&mut self) -> Result<(), PipelineError> {
        self.core.fire_channel_inactive(0)
    }

    pub fn write(&mut self, msg: PipelineMessage) -> Result<(), PipelineError> {
        let end = self.core.entries.len();
        self.core.write(end, msg)
    }

    pub fn flush(&mut self) -> Result<(), PipelineError> {
        let end = self.core.entries.len();
        self.core.flush(end)
    }

    pub fn write_and_flush(&mut self, msg: PipelineMessage) -> Result<(), PipelineError> {
        self.write(msg)?;
        self.flush()
    }

    /// 关闭连接：出站链路执行 `on_close` 并关闭传输层，随后广播非活跃事件，
    /// 最后自末端向前端逐个移除处理器。
    ///
    /// 所有步骤都会执行，返回遇到的第一个错误。
    pub fn close(&mut self) -> Result<(), PipelineError> {
        if self.core.closed {
            return Ok(());
        }
        let end = self.core.entries.len();
        let mut first_error = self.core.close(end).err();
        self.core.closed = true;

        if let Err(err) = self.core.fire_channel_inactive(0) {
            first_error.get_or_insert(err);
        }
        while let Some(index) = self.core.entries.len().checked_sub(1) {
            let (_, result) = self.core.handler_removed(index);
            if let Err(err) = result {
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("handlers", &self.names())
            .field("closed", &self.core.closed)
            .finish()
    }
}

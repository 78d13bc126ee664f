use std::fmt;

use crate::context::HandlerContext;
use crate::error::PipelineError;
use crate::message::PipelineMessage;

/// 处理器的公共生命周期钩子。
///
/// # 契约说明（What）
/// - `on_handler_added` 在处理器进入链路后立即调用；
/// - `on_handler_removed` 在处理器离开链路前调用，此时上下文仍可向后继转发，
///   持有累积缓冲的处理器须在此释放或转交它们。
pub trait ChannelHandler: Send + 'static {
    fn on_handler_added(&mut self, _ctx: &mut HandlerContext<'_>) -> Result<(), PipelineError> {
        Ok(())
    }

    fn on_handler_removed(&mut self, _ctx: &mut HandlerContext<'_>) -> Result<(), PipelineError> {
        Ok(())
    }
}

/// 入站事件处理合约，面向从传输层到业务层的正向数据流。
///
/// # 设计背景（Why）
/// - 每条连接的处理器只在一个执行上下文中被调用，方法以 `&mut self` 接收，状态无需加锁。
///
/// # 契约说明（What）
/// - 默认实现把事件原样转发给下一个入站处理器；
/// - `on_read` 获得消息的所有权：要么转发，要么自行 `release`；
/// - 返回的错误沿调用栈回到触发事件的入口，由调用方决定关闭连接或记录日志。
pub trait InboundHandler: ChannelHandler {
    fn on_channel_active(&mut self, ctx: &mut HandlerContext<'_>) -> Result<(), PipelineError> {
        ctx.fire_channel_active()
    }

    fn on_read(
        &mut self,
        ctx: &mut HandlerContext<'_>,
        msg: PipelineMessage,
    ) -> Result<(), PipelineError> {
        ctx.fire_channel_read(msg)
    }

    fn on_read_complete(&mut self, ctx: &mut HandlerContext<'_>) -> Result<(), PipelineError> {
        ctx.fire_channel_read_complete()
    }

    fn on_exception_caught(
        &mut self,
        ctx: &mut HandlerContext<'_>,
        error: PipelineError,
    ) -> Result<(), PipelineError> {
        ctx.fire_exception_caught(error)
    }

    fn on_channel_inactive(&mut self, ctx: &mut HandlerContext<'_>) -> Result<(), PipelineError> {
        ctx.fire_channel_inactive()
    }
}

/// 出站事件处理合约，负责从业务层到传输层的逆向数据流。
///
/// # 契约说明（What）
/// - 默认实现把事件转发给前一个出站处理器，最终抵达传输层；
/// - `on_write` 获得消息的所有权，失败路径上同样须保证消息被释放。
pub trait OutboundHandler: ChannelHandler {
    fn on_write(
        &mut self,
        ctx: &mut HandlerContext<'_>,
        msg: PipelineMessage,
    ) -> Result<(), PipelineError> {
        ctx.write(msg)
    }

    fn on_flush(&mut self, ctx: &mut HandlerContext<'_>) -> Result<(), PipelineError> {
        ctx.flush()
    }

    fn on_close(&mut self, ctx: &mut HandlerContext<'_>) -> Result<(), PipelineError> {
        ctx.close()
    }
}

/// 同时处理入站与出站事件的全双工处理器，任何同时实现两者的类型自动满足。
pub trait DuplexHandler: InboundHandler + OutboundHandler {}

impl<T: InboundHandler + OutboundHandler> DuplexHandler for T {}

/// 链路中登记的处理器，按方向区分。
pub enum Handler {
    Inbound(Box<dyn InboundHandler>),
    Outbound(Box<dyn OutboundHandler>),
    Duplex(Box<dyn DuplexHandler>),
}

impl Handler {
    pub fn inbound(handler: impl InboundHandler) -> Self {
        Handler::Inbound(Box::new(handler))
    }

    pub fn outbound(handler: impl OutboundHandler) -> Self {
        Handler::Outbound(Box::new(handler))
    }

    pub fn duplex(handler: impl DuplexHandler) -> Self {
        Handler::Duplex(Box::new(handler))
    }

    pub fn is_inbound(&self) -> bool {
        matches!(self, Handler::Inbound(_) | Handler::Duplex(_))
    }

    pub fn is_outbound(&self) -> bool {
        matches!(self, Handler::Outbound(_) | Handler::Duplex(_))
    }

    pub(crate) fn as_channel_handler(&mut self) -> &mut dyn ChannelHandler {
        match self {
            Handler::Inbound(handler) => handler.as_mut(),
            Handler::Outbound(handler) => handler.as_mut(),
            Handler::Duplex(handler) => handler.as_mut(),
        }
    }

    pub(crate) fn as_inbound(&mut self) -> Option<&mut dyn InboundHandler> {
        match self {
            Handler::Inbound(handler) => Some(handler.as_mut()),
            Handler::Duplex(handler) => {
                let upcast: &mut dyn InboundHandler = handler.as_mut();
                Some(upcast)
            }
            Handler::Outbound(_) => None,
        }
    }

    pub(crate) fn as_outbound(&mut self) -> Option<&mut dyn OutboundHandler> {
        match self {
            Handler::Outbound(handler) => Some(handler.as_mut()),
            Handler::Duplex(handler) => {
                let upcast: &mut dyn OutboundHandler = handler.as_mut();
                Some(upcast)
            }
            Handler::Inbound(_) => None,
        }
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let direction = match self {
            Handler::Inbound(_) => "inbound",
            Handler::Outbound(_) => "outbound",
            Handler::Duplex(_) => "duplex",
        };
        f.debug_tuple("Handler").field(&direction).finish()
    }
}

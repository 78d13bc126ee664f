//! `tidewire-pipeline` 提供连接级的有序处理器链。
//!
//! # 模块定位（Why）
//! - 编解码器与业务逻辑以处理器的形式串联在连接上，入站字节逐级变为业务对象，
//!   业务对象再逆向逐级变回字节；链路本身负责事件转发与消息所有权的交接。
//!
//! # 设计概要（How）
//! - `handler`：[`InboundHandler`] / [`OutboundHandler`] 契约与登记用的 [`Handler`]；
//! - `context`：回调期间借出的 [`HandlerContext`]；
//! - `pipeline`：[`Pipeline`] 以及两端协作方 [`Transport`]、[`InboundSink`]；
//! - `message` / `region`：链上流动的 [`PipelineMessage`] 与零拷贝 [`FileRegion`]；
//! - `embedded`：不依赖套接字的 [`EmbeddedChannel`]，用于驱动处理器测试。

mod context;
mod embedded;
mod error;
mod handler;
mod message;
mod pipeline;
mod region;

pub use context::HandlerContext;
pub use embedded::EmbeddedChannel;
pub use error::{PipelineError, codes};
pub use handler::{ChannelHandler, DuplexHandler, Handler, InboundHandler, OutboundHandler};
pub use message::{Message, MessageMatcher, PipelineMessage, UserMessage};
pub use pipeline::{DiscardingSink, InboundSink, Pipeline, Transport};
pub use region::FileRegion;

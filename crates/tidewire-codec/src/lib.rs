//! `tidewire-codec` 提供编解码适配器与分帧引擎。
//!
//! # 模块定位（Why）
//! - 适配器负责编解码过程中的所有权交接：累积缓冲的生命周期、输入消息的恰好一次释放、
//!   错误路径上的清理；用户步骤只描述“字节如何变为消息”以及反方向的转换。
//!
//! # 设计概要（How）
//! - `byte_to_message`：[`ByteToMessageDecoder`] 与 [`ByteToMessageDecode`] 步骤；
//! - `message_to_byte`：[`MessageToByteEncoder`] 与 [`MessageToByteEncode`] 步骤；
//! - `message_to_message`：消息到消息的双向转换适配器；
//! - `codec`：把解码侧与编码侧组合为全双工处理器；
//! - `length_field` / `fixed_length`：长度字段分帧、长度帧头编码与定长分帧。
//!
//! # 错误语义（What）
//! - 所有错误最终以 [`CodecError`] 表达，经处理器链传播时包装为
//!   `PipelineError::Handler`，调用方可用 `downcast_ref::<CodecError>()` 还原。

mod byte_to_message;
mod codec;
mod context;
mod error;
mod fixed_length;
mod length_field;
mod message_to_byte;
mod message_to_message;
mod output;

pub use byte_to_message::{ByteToMessageDecode, ByteToMessageDecoder, DEFAULT_DISCARD_AFTER_READS};
pub use codec::{ByteToMessageCodec, MessageToMessageCodec};
pub use context::{DecodeContext, EncodeContext};
pub use error::{CodecError, Result, codes};
pub use fixed_length::FixedLengthFrameDecoder;
pub use length_field::{
    LengthFieldBasedFrameDecoder, LengthFieldConfig, LengthFieldPrepender,
    SUPPORTED_LENGTH_FIELD_LENGTHS,
};
pub use message_to_byte::{MessageToByteEncode, MessageToByteEncoder};
pub use message_to_message::{
    MessageToMessageDecode, MessageToMessageDecoder, MessageToMessageEncode,
    MessageToMessageEncoder,
};

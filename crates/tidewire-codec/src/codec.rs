use std::fmt;

use tidewire_pipeline::{
    ChannelHandler, Handler, HandlerContext, InboundHandler, OutboundHandler, PipelineError,
    PipelineMessage,
};

use crate::byte_to_message::{ByteToMessageDecode, ByteToMessageDecoder};
use crate::message_to_byte::{MessageToByteEncode, MessageToByteEncoder};
use crate::message_to_message::{
    MessageToMessageDecode, MessageToMessageDecoder, MessageToMessageEncode,
    MessageToMessageEncoder,
};

/// 把字节解码器与字节编码器组合为一个全双工处理器。
///
/// # 契约说明（What）
/// - 入站事件交给 [`ByteToMessageDecoder`]，出站写入交给 [`MessageToByteEncoder`]；
/// - 两侧状态互不共享，语义与各自单独登记时一致；
/// - 移除时执行解码侧的收尾，剩余累积字节向后转发。
pub struct ByteToMessageCodec<D, E> {
    decoder: ByteToMessageDecoder<D>,
    encoder: MessageToByteEncoder<E>,
}

impl<D: ByteToMessageDecode, E: MessageToByteEncode> ByteToMessageCodec<D, E> {
    pub fn new(decoder: D, encoder: E) -> Self {
        Self::from_parts(ByteToMessageDecoder::new(decoder), MessageToByteEncoder::new(encoder))
    }

    /// 以已配置好的两侧适配器组合。
    pub fn from_parts(decoder: ByteToMessageDecoder<D>, encoder: MessageToByteEncoder<E>) -> Self {
        Self { decoder, encoder }
    }

    pub fn decoder(&self) -> &ByteToMessageDecoder<D> {
        &self.decoder
    }

    pub fn encoder(&self) -> &MessageToByteEncoder<E> {
        &self.encoder
    }

    pub fn into_handler(self) -> Handler {
        Handler::duplex(self)
    }
}

impl<D: ByteToMessageDecode, E: MessageToByteEncode> ChannelHandler for ByteToMessageCodec<D, E> {
    fn on_handler_removed(&mut self, ctx: &mut HandlerContext<'_>) -> Result<(), PipelineError> {
        self.decoder.on_handler_removed(ctx)
    }
}

impl<D: ByteToMessageDecode, E: MessageToByteEncode> InboundHandler for ByteToMessageCodec<D, E> {
    fn on_read(
        &mut self,
        ctx: &mut HandlerContext<'_>,
        msg: PipelineMessage,
    ) -> Result<(), PipelineError> {
        self.decoder.on_read(ctx, msg)
    }

    fn on_read_complete(&mut self, ctx: &mut HandlerContext<'_>) -> Result<(), PipelineError> {
        self.decoder.on_read_complete(ctx)
    }

    fn on_channel_inactive(&mut self, ctx: &mut HandlerContext<'_>) -> Result<(), PipelineError> {
        self.decoder.on_channel_inactive(ctx)
    }
}

impl<D: ByteToMessageDecode, E: MessageToByteEncode> OutboundHandler for ByteToMessageCodec<D, E> {
    fn on_write(
        &mut self,
        ctx: &mut HandlerContext<'_>,
        msg: PipelineMessage,
    ) -> Result<(), PipelineError> {
        self.encoder.on_write(ctx, msg)
    }
}

impl<D: fmt::Debug, E: fmt::Debug> fmt::Debug for ByteToMessageCodec<D, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteToMessageCodec")
            .field("decoder", &self.decoder)
            .field("encoder", &self.encoder)
            .finish()
    }
}

/// 把消息解码器与消息编码器组合为一个全双工处理器。
pub struct MessageToMessageCodec<D, E> {
    decoder: MessageToMessageDecoder<D>,
    encoder: MessageToMessageEncoder<E>,
}

impl<D: MessageToMessageDecode, E: MessageToMessageEncode> MessageToMessageCodec<D, E> {
    pub fn new(decoder: D, encoder: E) -> Self {
        Self::from_parts(
            MessageToMessageDecoder::new(decoder),
            MessageToMessageEncoder::new(encoder),
        )
    }

    pub fn from_parts(
        decoder: MessageToMessageDecoder<D>,
        encoder: MessageToMessageEncoder<E>,
    ) -> Self {
        Self { decoder, encoder }
    }

    pub fn into_handler(self) -> Handler {
        Handler::duplex(self)
    }
}

impl<D: MessageToMessageDecode, E: MessageToMessageEncode> ChannelHandler
    for MessageToMessageCodec<D, E>
{
}

impl<D: MessageToMessageDecode, E: MessageToMessageEncode> InboundHandler
    for MessageToMessageCodec<D, E>
{
    fn on_read(
        &mut self,
        ctx: &mut HandlerContext<'_>,
        msg: PipelineMessage,
    ) -> Result<(), PipelineError> {
        self.decoder.on_read(ctx, msg)
    }
}

impl<D: MessageToMessageDecode, E: MessageToMessageEncode> OutboundHandler
    for MessageToMessageCodec<D, E>
{
    fn on_write(
        &mut self,
        ctx: &mut HandlerContext<'_>,
        msg: PipelineMessage,
    ) -> Result<(), PipelineError> {
        self.encoder.on_write(ctx, msg)
    }
}

impl<D: fmt::Debug, E: fmt::Debug> fmt::Debug for MessageToMessageCodec<D, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageToMessageCodec")
            .field("decoder", &self.decoder)
            .field("encoder", &self.encoder)
            .finish()
    }
}

use std::any::type_name;
use std::fmt;

use tidewire_buffer::ReferenceCounted;
use tidewire_pipeline::{
    ChannelHandler, Handler, HandlerContext, InboundHandler, Message, MessageMatcher,
    OutboundHandler, PipelineError, PipelineMessage,
};

use crate::context::{DecodeContext, EncodeContext};
use crate::error::{CodecError, Result};
use crate::output::{fire_reads, release_quietly, write_all};

/// 把一条入站消息转换为零或多条消息的用户步骤。
pub trait MessageToMessageDecode: Send + 'static {
    type Message: Message;

    fn decode(
        &mut self,
        ctx: &DecodeContext<'_>,
        msg: &Self::Message,
        out: &mut Vec<PipelineMessage>,
    ) -> Result<()>;
}

/// 把一条出站消息转换为一或多条消息的用户步骤。
pub trait MessageToMessageEncode: Send + 'static {
    type Message: Message;

    fn encode(
        &mut self,
        ctx: &EncodeContext<'_>,
        msg: &Self::Message,
        out: &mut Vec<PipelineMessage>,
    ) -> Result<()>;
}

/// 入站方向的消息转换适配器。
///
/// # 契约说明（What）
/// - 被接受的消息在 `decode` 返回后恰好释放一次，产出按顺序向后转发；
/// - 解码失败时已产出的消息仍先转发，随后返回解码族错误；
/// - 未被接受的消息原样向后转发，所有权随之移交，调用方无需额外 `retain`。
pub struct MessageToMessageDecoder<D> {
    decoder: D,
    matcher: MessageMatcher,
}

impl<D: MessageToMessageDecode> MessageToMessageDecoder<D> {
    pub fn new(decoder: D) -> Self {
        Self {
            decoder,
            matcher: MessageMatcher::of::<D::Message>(),
        }
    }

    pub fn with_matcher(mut self, matcher: MessageMatcher) -> Self {
        self.matcher = matcher;
        self
    }

    pub fn decoder(&self) -> &D {
        &self.decoder
    }

    pub fn accepts(&self, msg: &PipelineMessage) -> bool {
        self.matcher.accepts(msg)
    }

    pub fn into_handler(self) -> Handler {
        Handler::inbound(self)
    }
}

impl<D: MessageToMessageDecode> ChannelHandler for MessageToMessageDecoder<D> {}

impl<D: MessageToMessageDecode> InboundHandler for MessageToMessageDecoder<D> {
    fn on_read(
        &mut self,
        ctx: &mut HandlerContext<'_>,
        msg: PipelineMessage,
    ) -> std::result::Result<(), PipelineError> {
        if !self.matcher.accepts(&msg) {
            return ctx.fire_channel_read(msg);
        }
        let typed = match D::Message::from_message(msg) {
            Ok(typed) => typed,
            Err(other) => return ctx.fire_channel_read(other),
        };
        let mut out = Vec::new();
        let decoded = self.decoder.decode(&DecodeContext::of(ctx), &typed, &mut out);
        let released = typed.into_message().release().map_err(CodecError::from);
        let outcome = decoded
            .and(released)
            .map(|_| ())
            .map_err(|err| PipelineError::from(err.wrap_decode()));
        let fired = fire_reads(ctx, &mut out);
        outcome.and(fired)
    }
}

impl<D: fmt::Debug> fmt::Debug for MessageToMessageDecoder<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageToMessageDecoder")
            .field("decoder", &self.decoder)
            .finish()
    }
}

/// 出站方向的消息转换适配器。
///
/// # 契约说明（What）
/// - 被接受的消息在 `encode` 返回后恰好释放一次；
/// - `encode` 必须至少产出一条消息，否则返回编码错误；
/// - 编码失败时释放已产出的消息，不写出残缺的结果；
/// - 未被接受的消息原样向前写出。
pub struct MessageToMessageEncoder<E> {
    encoder: E,
    matcher: MessageMatcher,
}

impl<E: MessageToMessageEncode> MessageToMessageEncoder<E> {
    pub fn new(encoder: E) -> Self {
        Self {
            encoder,
            matcher: MessageMatcher::of::<E::Message>(),
        }
    }

    pub fn with_matcher(mut self, matcher: MessageMatcher) -> Self {
        self.matcher = matcher;
        self
    }

    pub fn encoder(&self) -> &E {
        &self.encoder
    }

    pub fn accepts(&self, msg: &PipelineMessage) -> bool {
        self.matcher.accepts(msg)
    }

    pub fn into_handler(self) -> Handler {
        Handler::outbound(self)
    }
}

impl<E: MessageToMessageEncode> ChannelHandler for MessageToMessageEncoder<E> {}

impl<E: MessageToMessageEncode> OutboundHandler for MessageToMessageEncoder<E> {
    fn on_write(
        &mut self,
        ctx: &mut HandlerContext<'_>,
        msg: PipelineMessage,
    ) -> std::result::Result<(), PipelineError> {
        if !self.matcher.accepts(&msg) {
            return ctx.write(msg);
        }
        let typed = match E::Message::from_message(msg) {
            Ok(typed) => typed,
            Err(other) => return ctx.write(other),
        };
        let mut out = Vec::new();
        let encoded = self.encoder.encode(&EncodeContext::of(ctx), &typed, &mut out);
        let released = typed.into_message().release().map_err(CodecError::from);
        let outcome = encoded.and(released).and_then(|_| {
            if out.is_empty() {
                Err(CodecError::encoder(format!(
                    "{} must produce at least one message",
                    type_name::<E>()
                )))
            } else {
                Ok(())
            }
        });
        if let Err(err) = outcome {
            release_quietly(out.drain(..));
            return Err(err.wrap_encode().into());
        }
        write_all(ctx, &mut out)
    }
}

impl<E: fmt::Debug> fmt::Debug for MessageToMessageEncoder<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageToMessageEncoder")
            .field("encoder", &self.encoder)
            .finish()
    }
}

use std::fmt;

use tidewire_buffer::{ByteBuf, ReferenceCounted, Unpooled};
use tidewire_pipeline::{
    ChannelHandler, Handler, HandlerContext, Message, MessageMatcher, OutboundHandler,
    PipelineError, PipelineMessage,
};

use crate::context::EncodeContext;
use crate::error::{CodecError, Result};
use crate::output::release_quietly;

/// 把出站消息序列化为字节的用户步骤。
///
/// # 契约说明（What）
/// - `encode` 只借用消息，适配器在调用结束后负责释放它；
/// - `allocate_buffer` 决定输出缓冲的来源，默认按 `prefer_direct` 选择直接或堆内存。
pub trait MessageToByteEncode: Send + 'static {
    type Message: Message;

    fn encode(&mut self, ctx: &EncodeContext<'_>, msg: &Self::Message, out: &mut ByteBuf) -> Result<()>;

    fn allocate_buffer(
        &mut self,
        ctx: &EncodeContext<'_>,
        _msg: &Self::Message,
        prefer_direct: bool,
    ) -> Result<ByteBuf> {
        let buf = if prefer_direct {
            ctx.allocator().io_buffer()?
        } else {
            ctx.allocator().heap_buffer()?
        };
        Ok(buf)
    }
}

/// `MessageToByteEncoder` 为匹配的出站消息分配缓冲、调用编码步骤并向前写出结果。
///
/// # 契约说明（What）
/// - 输入消息无论编码成败都恰好释放一次；
/// - 编码失败时释放已分配的输出缓冲，返回编码族错误；
/// - 未写入任何字节时写出一个空缓冲，下游总能收到一条缓冲消息；
/// - 未被匹配器接受的消息原样向前写出，所有权随之移交。
pub struct MessageToByteEncoder<E> {
    encoder: E,
    matcher: MessageMatcher,
    prefer_direct: bool,
}

impl<E: MessageToByteEncode> MessageToByteEncoder<E> {
    pub fn new(encoder: E) -> Self {
        Self {
            encoder,
            matcher: MessageMatcher::of::<E::Message>(),
            prefer_direct: true,
        }
    }

    /// 以显式谓词替换默认的类型匹配。
    pub fn with_matcher(mut self, matcher: MessageMatcher) -> Self {
        self.matcher = matcher;
        self
    }

    pub fn with_prefer_direct(mut self, prefer_direct: bool) -> Self {
        self.prefer_direct = prefer_direct;
        self
    }

    pub fn encoder(&self) -> &E {
        &self.encoder
    }

    pub fn encoder_mut(&mut self) -> &mut E {
        &mut self.encoder
    }

    pub fn accepts(&self, msg: &PipelineMessage) -> bool {
        self.matcher.accepts(msg)
    }

    pub fn into_handler(self) -> Handler {
        Handler::outbound(self)
    }

    /// 编码一条已取出的消息；返回的缓冲归调用方所有。
    fn encode_owned(&mut self, ctx: &EncodeContext<'_>, msg: E::Message) -> Result<ByteBuf> {
        let allocated = self.encoder.allocate_buffer(ctx, &msg, self.prefer_direct);
        let mut buf = match allocated {
            Ok(buf) => buf,
            Err(err) => {
                release_quietly([msg.into_message()]);
                return Err(err.wrap_encode());
            }
        };
        let encoded = self.encoder.encode(ctx, &msg, &mut buf);
        let released = msg.into_message().release().map_err(CodecError::from);
        match encoded.and(released) {
            Ok(_) => Ok(buf),
            Err(err) => {
                release_quietly([buf.into_message()]);
                Err(err.wrap_encode())
            }
        }
    }
}

impl<E: MessageToByteEncode> ChannelHandler for MessageToByteEncoder<E> {}

impl<E: MessageToByteEncode> OutboundHandler for MessageToByteEncoder<E> {
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
        let buf = self.encode_owned(&EncodeContext::of(ctx), typed)?;
        if buf.is_readable() {
            ctx.write(buf.into_message())
        } else {
            buf.release()?;
            ctx.write(Unpooled::empty_buffer().into_message())
        }
    }
}

impl<E: fmt::Debug> fmt::Debug for MessageToByteEncoder<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageToByteEncoder")
            .field("encoder", &self.encoder)
            .field("prefer_direct", &self.prefer_direct)
            .finish()
    }
}

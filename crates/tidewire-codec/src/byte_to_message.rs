use std::any::type_name;
use std::fmt;

use tidewire_buffer::{ByteBuf, ByteBufAllocator, ReferenceCounted, Unpooled};
use tidewire_pipeline::{
    ChannelHandler, Handler, HandlerContext, InboundHandler, Message, PipelineError,
    PipelineMessage,
};

use crate::context::DecodeContext;
use crate::error::{CodecError, Result};
use crate::output::{fire_reads, release_quietly};

/// 累积缓冲被连续读取多少次后压缩一次已读区域。
pub const DEFAULT_DISCARD_AFTER_READS: usize = 16;

/// 把累积字节切分为消息的用户步骤。
///
/// # 契约说明（What）
/// - `decode` 每次至少消费一部分字节或不产出任何消息；字节不足时直接返回 `Ok(())`，
///   不得预先消费超出所需的字节；
/// - 产出的消息由适配器按顺序转发，所有权随之移交；
/// - `decode_last` 在连接转为非活跃时调用一次，默认在仍有可读字节时执行一次 `decode`。
pub trait ByteToMessageDecode: Send + 'static {
    fn decode(
        &mut self,
        ctx: &DecodeContext<'_>,
        input: &mut ByteBuf,
        out: &mut Vec<PipelineMessage>,
    ) -> Result<()>;

    fn decode_last(
        &mut self,
        ctx: &DecodeContext<'_>,
        input: &mut ByteBuf,
        out: &mut Vec<PipelineMessage>,
    ) -> Result<()> {
        if input.is_readable() {
            self.decode(ctx, input, out)
        } else {
            Ok(())
        }
    }
}

/// `ByteToMessageDecoder` 把入站字节块累积起来，反复调用用户步骤切出消息。
///
/// # 设计背景（Why）
/// - 传输层的一次读事件可能只带来半个帧，也可能带来多个帧；累积缓冲屏蔽了分片边界，
///   用户步骤只需面对“当前已到达的全部字节”。
///
/// # 核心机制（How）
/// - 合并累积：新字节追加到累积缓冲；累积缓冲已读尽时直接接管入站缓冲，
///   空间不足或仍被切片共享时按扩容策略换一块新缓冲；
/// - 解码循环：每轮先转发上一轮的产出，再调用 `decode`；没有产出且未消费字节时停止，
///   产出了消息却未消费字节视为实现错误；
/// - 累积缓冲读尽即释放；连续读取达到 `discard_after_reads` 次时压缩已读区域，
///   仅在没有切片引用它时进行。
///
/// # 契约说明（What）
/// - 非缓冲消息原样向后转发；
/// - 解码失败时，本次已产出的消息仍先转发，随后返回错误；
/// - 非活跃事件触发 `decode_last`，之后释放累积缓冲；
/// - 处理器被移除时剩余可读字节作为一条缓冲消息向后转发。
pub struct ByteToMessageDecoder<D> {
    decoder: D,
    cumulation: Option<ByteBuf>,
    single_decode: bool,
    discard_after_reads: usize,
    num_reads: usize,
}

impl<D: ByteToMessageDecode> ByteToMessageDecoder<D> {
    pub fn new(decoder: D) -> Self {
        Self {
            decoder,
            cumulation: None,
            single_decode: false,
            discard_after_reads: DEFAULT_DISCARD_AFTER_READS,
            num_reads: 0,
        }
    }

    /// 每个读事件最多产出一条消息，适用于需要在帧之间切换协议的场景。
    pub fn with_single_decode(mut self, single_decode: bool) -> Self {
        self.single_decode = single_decode;
        self
    }

    pub fn with_discard_after_reads(mut self, discard_after_reads: usize) -> Result<Self> {
        if discard_after_reads == 0 {
            return Err(CodecError::InvalidConfig(
                "discard_after_reads must be greater than 0".to_owned(),
            ));
        }
        self.discard_after_reads = discard_after_reads;
        Ok(self)
    }

    pub fn is_single_decode(&self) -> bool {
        self.single_decode
    }

    pub fn decoder(&self) -> &D {
        &self.decoder
    }

    pub fn decoder_mut(&mut self) -> &mut D {
        &mut self.decoder
    }

    /// 累积缓冲中尚未解码的字节数。
    pub fn actual_readable_bytes(&self) -> usize {
        self.cumulation.as_ref().map_or(0, ByteBuf::readable_bytes)
    }

    pub fn internal_buffer(&self) -> Option<&ByteBuf> {
        self.cumulation.as_ref()
    }

    pub fn into_handler(self) -> Handler {
        Handler::inbound(self)
    }

    fn cumulate(&mut self, allocator: &dyn ByteBufAllocator, input: ByteBuf) -> Result<()> {
        let Some(cumulation) = self.cumulation.take() else {
            self.cumulation = Some(input);
            return Ok(());
        };
        if !cumulation.is_readable() {
            cumulation.release()?;
            self.cumulation = Some(input);
            return Ok(());
        }
        let mut input = input;
        let merged = merge(allocator, cumulation, &mut input);
        let released = input.release();
        self.cumulation = Some(merged?);
        released?;
        Ok(())
    }

    fn call_decode(
        &mut self,
        ctx: &mut HandlerContext<'_>,
        out: &mut Vec<PipelineMessage>,
    ) -> std::result::Result<(), PipelineError> {
        loop {
            if !out.is_empty() {
                fire_reads(ctx, out)?;
            }
            let Some(input) = self.cumulation.as_mut() else {
                return Ok(());
            };
            if !input.is_readable() {
                return Ok(());
            }
            let before = input.readable_bytes();
            self.decoder
                .decode(&DecodeContext::of(ctx), input, out)
                .map_err(CodecError::wrap_decode)?;

            let consumed = before != input.readable_bytes();
            if out.is_empty() {
                if consumed {
                    continue;
                }
                return Ok(());
            }
            if !consumed {
                return Err(CodecError::decoder(format!(
                    "{}.decode() did not read anything but decoded a message",
                    type_name::<D>()
                ))
                .into());
            }
            if self.single_decode {
                return Ok(());
            }
        }
    }

    /// 读事件收尾：读尽即释放累积缓冲，否则按次数压缩已读区域。
    fn after_read(&mut self) -> Result<()> {
        let drained = self
            .cumulation
            .as_ref()
            .is_some_and(|cumulation| !cumulation.is_readable());
        if drained {
            self.num_reads = 0;
            if let Some(cumulation) = self.cumulation.take() {
                cumulation.release()?;
            }
            return Ok(());
        }
        self.num_reads += 1;
        if self.num_reads >= self.discard_after_reads {
            self.num_reads = 0;
            self.discard_some_read_bytes()?;
        }
        Ok(())
    }

    fn discard_some_read_bytes(&mut self) -> Result<()> {
        match self.cumulation.as_mut() {
            // 仍有切片引用累积缓冲时搬移字节会破坏这些切片。
            Some(cumulation) if cumulation.ref_cnt() == 1 => {
                cumulation.discard_read_bytes()?;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn release_cumulation(&mut self) -> Result<()> {
        self.num_reads = 0;
        if let Some(cumulation) = self.cumulation.take() {
            cumulation.release()?;
        }
        Ok(())
    }
}

/// 把 `input` 的可读字节并入 `cumulation`，必要时换一块更大的缓冲。
fn merge(
    allocator: &dyn ByteBufAllocator,
    mut cumulation: ByteBuf,
    input: &mut ByteBuf,
) -> Result<ByteBuf> {
    let required = input.readable_bytes();
    let expand = required > cumulation.max_writable_bytes()
        || (required > cumulation.writable_bytes() && cumulation.ref_cnt() > 1);
    if !expand {
        if let Err(err) = cumulation.write_buf(input) {
            release_quietly([cumulation.into_message()]);
            return Err(err.into());
        }
        return Ok(cumulation);
    }

    let total = cumulation.readable_bytes() + required;
    let expanded = allocator
        .calculate_new_capacity(total, usize::MAX)
        .and_then(|capacity| allocator.buffer_with(capacity, usize::MAX));
    let mut expanded = match expanded {
        Ok(expanded) => expanded,
        Err(err) => {
            release_quietly([cumulation.into_message()]);
            return Err(err.into());
        }
    };
    let copied = expanded
        .write_buf(&mut cumulation)
        .and_then(|()| expanded.write_buf(input));
    let released = cumulation.release();
    match copied.and(released) {
        Ok(_) => Ok(expanded),
        Err(err) => {
            release_quietly([expanded.into_message()]);
            Err(err.into())
        }
    }
}

impl<D: ByteToMessageDecode> ChannelHandler for ByteToMessageDecoder<D> {
    fn on_handler_removed(
        &mut self,
        ctx: &mut HandlerContext<'_>,
    ) -> std::result::Result<(), PipelineError> {
        self.num_reads = 0;
        let Some(cumulation) = self.cumulation.take() else {
            return Ok(());
        };
        if cumulation.is_readable() {
            ctx.fire_channel_read(cumulation.into_message())?;
            ctx.fire_channel_read_complete()
        } else {
            cumulation.release()?;
            Ok(())
        }
    }
}

impl<D: ByteToMessageDecode> InboundHandler for ByteToMessageDecoder<D> {
    fn on_read(
        &mut self,
        ctx: &mut HandlerContext<'_>,
        msg: PipelineMessage,
    ) -> std::result::Result<(), PipelineError> {
        let input = match ByteBuf::from_message(msg) {
            Ok(input) => input,
            Err(other) => return ctx.fire_channel_read(other),
        };
        let mut out = Vec::new();
        let decoded = self
            .cumulate(ctx.allocator(), input)
            .map_err(|err| PipelineError::from(err.wrap_decode()))
            .and_then(|()| self.call_decode(ctx, &mut out));
        let cleaned = self.after_read().map_err(PipelineError::from);
        let fired = fire_reads(ctx, &mut out);
        decoded.and(cleaned).and(fired)
    }

    fn on_read_complete(
        &mut self,
        ctx: &mut HandlerContext<'_>,
    ) -> std::result::Result<(), PipelineError> {
        self.num_reads = 0;
        self.discard_some_read_bytes()?;
        ctx.fire_channel_read_complete()
    }

    fn on_channel_inactive(
        &mut self,
        ctx: &mut HandlerContext<'_>,
    ) -> std::result::Result<(), PipelineError> {
        let mut out = Vec::new();
        let mut decoded = self.call_decode(ctx, &mut out);
        if decoded.is_ok() {
            let last = match self.cumulation.as_mut() {
                Some(cumulation) => {
                    self.decoder
                        .decode_last(&DecodeContext::of(ctx), cumulation, &mut out)
                }
                None => {
                    let mut empty = Unpooled::empty_buffer();
                    self.decoder
                        .decode_last(&DecodeContext::of(ctx), &mut empty, &mut out)
                }
            };
            decoded = last.map_err(|err| PipelineError::from(err.wrap_decode()));
        }
        let released = self.release_cumulation().map_err(PipelineError::from);
        let produced = !out.is_empty();
        let mut fired = fire_reads(ctx, &mut out);
        if produced && fired.is_ok() {
            fired = ctx.fire_channel_read_complete();
        }
        let forwarded = ctx.fire_channel_inactive();
        decoded.and(released).and(fired).and(forwarded)
    }
}

impl<D: fmt::Debug> fmt::Debug for ByteToMessageDecoder<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteToMessageDecoder")
            .field("decoder", &self.decoder)
            .field(
                "cumulated",
                &self.cumulation.as_ref().map_or(0, ByteBuf::readable_bytes),
            )
            .field("single_decode", &self.single_decode)
            .field("discard_after_reads", &self.discard_after_reads)
            .finish()
    }
}

impl<D> Drop for ByteToMessageDecoder<D> {
    fn drop(&mut self) {
        if let Some(cumulation) = self.cumulation.take() {
            release_quietly([cumulation.into_message()]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidewire_pipeline::EmbeddedChannel;

    /// 每次读取 4 字节并以大端 u32 产出。
    #[derive(Debug, Default)]
    struct U32Decoder;

    impl ByteToMessageDecode for U32Decoder {
        fn decode(
            &mut self,
            _ctx: &DecodeContext<'_>,
            input: &mut ByteBuf,
            out: &mut Vec<PipelineMessage>,
        ) -> Result<()> {
            if input.readable_bytes() >= 4 {
                out.push(PipelineMessage::user(input.read_u32()?));
            }
            Ok(())
        }
    }

    /// 产出消息却不消费字节的错误实现。
    struct Stuck;

    impl ByteToMessageDecode for Stuck {
        fn decode(
            &mut self,
            _ctx: &DecodeContext<'_>,
            _input: &mut ByteBuf,
            out: &mut Vec<PipelineMessage>,
        ) -> Result<()> {
            out.push(PipelineMessage::user(()));
            Ok(())
        }
    }

    fn channel<D: ByteToMessageDecode>(decoder: ByteToMessageDecoder<D>) -> EmbeddedChannel {
        EmbeddedChannel::new([("decoder", decoder.into_handler())]).expect("channel")
    }

    fn read_u32s(channel: &EmbeddedChannel) -> Vec<u32> {
        let mut values = Vec::new();
        while let Some(msg) = channel.read_inbound::<PipelineMessage>() {
            values.push(msg.take_user::<u32>().expect("u32"));
        }
        values
    }

    #[test]
    fn accumulates_across_fragments() {
        let mut channel = channel(ByteToMessageDecoder::new(U32Decoder));
        let bytes = [0, 0, 0, 1, 0, 0, 0, 2, 0, 0];
        for chunk in bytes.chunks(3) {
            channel
                .write_inbound(Unpooled::copied_buffer(chunk).expect("chunk"))
                .expect("inbound");
        }
        assert_eq!(read_u32s(&channel), [1, 2]);
        assert!(!channel.finish().expect("finish"));
    }

    #[test]
    fn single_decode_stops_after_one_message() {
        let mut channel = channel(ByteToMessageDecoder::new(U32Decoder).with_single_decode(true));
        let buf = Unpooled::copied_buffer(&[0, 0, 0, 7, 0, 0, 0, 8]).expect("buf");
        channel.write_inbound(buf).expect("inbound");
        assert_eq!(read_u32s(&channel), [7]);
    }

    #[test]
    fn decoding_without_consuming_is_rejected() {
        let mut channel = channel(ByteToMessageDecoder::new(Stuck));
        let buf = Unpooled::copied_buffer(b"x").expect("buf");
        let err = channel.write_inbound(buf).expect_err("stuck");
        let codec = err.downcast_ref::<CodecError>().expect("codec error");
        assert_eq!(codec.code(), crate::codes::DECODER);
        assert!(codec.to_string().contains("did not read anything"));
        assert!(channel.release_inbound().expect("release"));
    }

    #[test]
    fn removal_forwards_remaining_bytes() {
        let mut channel = channel(ByteToMessageDecoder::new(U32Decoder));
        let buf = Unpooled::copied_buffer(&[0, 0, 0, 9, 0xAB]).expect("buf");
        channel.write_inbound(buf).expect("inbound");
        assert_eq!(read_u32s(&channel), [9]);

        channel.pipeline_mut().remove("decoder").expect("remove");
        let rest = channel.read_inbound::<ByteBuf>().expect("remaining bytes");
        assert_eq!(rest.to_vec().expect("bytes"), [0xAB]);
        rest.release().expect("release");
    }

    #[test]
    fn zero_discard_interval_is_invalid() {
        let err = ByteToMessageDecoder::new(U32Decoder)
            .with_discard_after_reads(0)
            .expect_err("invalid");
        assert_eq!(err.code(), crate::codes::INVALID_CONFIG);
    }
}

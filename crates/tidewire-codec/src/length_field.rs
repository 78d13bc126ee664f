use std::fmt;

use serde::{Deserialize, Serialize};
use tidewire_buffer::{ByteBuf, ByteOrder, ReferenceCounted};
use tidewire_pipeline::{Handler, Message, PipelineMessage};

use crate::byte_to_message::{ByteToMessageDecode, ByteToMessageDecoder};
use crate::context::{DecodeContext, EncodeContext};
use crate::error::{CodecError, Result};
use crate::message_to_message::{MessageToMessageEncode, MessageToMessageEncoder};

/// 长度字段允许的字节宽度。
pub const SUPPORTED_LENGTH_FIELD_LENGTHS: [usize; 5] = [1, 2, 3, 4, 8];

fn default_fail_fast() -> bool {
    true
}

/// 长度字段分帧的配置。
///
/// # 契约说明（What）
/// - `length_field_length ∈ {1, 2, 3, 4, 8}`，8 字节时按有符号整数解释；
/// - `length_adjustment` 加到长度字段的值上，用于补偿字段是否包含帧头；
/// - `initial_bytes_to_strip` 为产出帧之前跳过的字节数，通常用于去掉帧头；
/// - `fail_fast` 为 `true` 时在首次发现超长帧时立即报错，否则在丢弃完毕后报错；
/// - 构造解码器时统一校验，非法组合返回 [`CodecError::InvalidConfig`]。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LengthFieldConfig {
    pub max_frame_length: usize,
    pub length_field_offset: usize,
    pub length_field_length: usize,
    #[serde(default)]
    pub length_adjustment: i64,
    #[serde(default)]
    pub initial_bytes_to_strip: usize,
    #[serde(default)]
    pub byte_order: ByteOrder,
    #[serde(default = "default_fail_fast")]
    pub fail_fast: bool,
}

impl LengthFieldConfig {
    /// 以帧上限与长度字段位置构造配置，其余参数取默认值（大端、无补偿、不剥离、`fail_fast`）。
    pub fn new(max_frame_length: usize, length_field_offset: usize, length_field_length: usize) -> Self {
        Self {
            max_frame_length,
            length_field_offset,
            length_field_length,
            length_adjustment: 0,
            initial_bytes_to_strip: 0,
            byte_order: ByteOrder::BigEndian,
            fail_fast: true,
        }
    }

    /// 加到长度字段值上的补偿量，可为负。
    pub fn with_length_adjustment(mut self, length_adjustment: i64) -> Self {
        self.length_adjustment = length_adjustment;
        self
    }

    /// 产出帧前从帧首剥离的字节数。
    pub fn with_initial_bytes_to_strip(mut self, initial_bytes_to_strip: usize) -> Self {
        self.initial_bytes_to_strip = initial_bytes_to_strip;
        self
    }

    /// 长度字段的字节序。
    pub fn with_byte_order(mut self, byte_order: ByteOrder) -> Self {
        self.byte_order = byte_order;
        self
    }

    /// 为 `true` 时在读到超长帧头的当下报错，否则等丢弃完成后再报。
    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    /// 长度字段末端相对帧起点的偏移。
    pub fn length_field_end_offset(&self) -> usize {
        self.length_field_offset + self.length_field_length
    }

    /// 检查帧上限、长度字段宽度与偏移是否合法，失败时返回 [`CodecError::InvalidConfig`]。
    pub fn validate(&self) -> Result<()> {
        if self.max_frame_length == 0 {
            return Err(CodecError::InvalidConfig(
                "max_frame_length must be a positive integer".to_owned(),
            ));
        }
        if !SUPPORTED_LENGTH_FIELD_LENGTHS.contains(&self.length_field_length) {
            return Err(CodecError::InvalidConfig(format!(
                "length_field_length must be one of 1, 2, 3, 4 or 8: {}",
                self.length_field_length
            )));
        }
        if self.length_field_length > self.max_frame_length
            || self.length_field_offset > self.max_frame_length - self.length_field_length
        {
            return Err(CodecError::InvalidConfig(format!(
                "max_frame_length ({}) must be equal to or greater than length_field_offset ({}) + length_field_length ({})",
                self.max_frame_length, self.length_field_offset, self.length_field_length
            )));
        }
        Ok(())
    }
}

/// `LengthFieldBasedFrameDecoder` 依据帧内的长度字段切分字节流。
///
/// # 设计背景（Why）
/// - 二进制协议普遍以“帧头携带长度”的方式定界；长度字段的位置、宽度、字节序与是否包含帧头
///   各不相同，以一组参数覆盖这些变体，避免为每个协议重写分帧逻辑；
/// - 帧长度由对端声明，必须以 `max_frame_length` 约束内存占用。
///
/// # 核心机制（How）
/// 1. 丢弃模式下先跳过 `min(bytes_to_discard, readable)` 字节，丢弃完毕时按策略报告超长；
/// 2. 可读字节不足以覆盖长度字段时返回 `None`；
/// 3. 读取长度字段，8 字节负值报告损坏帧；
/// 4. 加上 `length_adjustment` 与字段末端偏移，小于字段末端偏移时报告损坏帧；
/// 5. 超过上限时：整帧已到达则立即跳过并报错，否则进入丢弃模式并跳过当前全部字节；
/// 6. 整帧未到达时返回 `None`，并记住已解析的长度；
/// 7. 剥离字节数大于帧长时跳过整帧并报告损坏帧；
/// 8. 跳过剥离字节，以 retained 切片产出帧并推进读指针。
///
/// # 契约说明（What）
/// - 所有报错路径都先越过出错的帧头（或整帧），下一次解码从下一个帧开始；
/// - 超长帧之后连接保持可用，是否关闭由调用方依据返回的错误决定；
/// - 产出的帧与累积缓冲共享存储，持有一份计数，由接收方释放。
pub struct LengthFieldBasedFrameDecoder {
    config: LengthFieldConfig,
    length_field_end_offset: usize,
    discarding_too_long_frame: bool,
    too_long_frame_length: u64,
    bytes_to_discard: u64,
    /// 已解析但尚未到齐的帧长度。
    pending_frame_length: Option<usize>,
}

impl LengthFieldBasedFrameDecoder {
    pub fn new(config: LengthFieldConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            length_field_end_offset: config.length_field_end_offset(),
            config,
            discarding_too_long_frame: false,
            too_long_frame_length: 0,
            bytes_to_discard: 0,
            pending_frame_length: None,
        })
    }

    pub fn config(&self) -> &LengthFieldConfig {
        &self.config
    }

    /// 是否处于超长帧丢弃模式。
    pub fn is_discarding(&self) -> bool {
        self.discarding_too_long_frame
    }

    /// 包装为处理器链上的入站适配器。
    pub fn into_handler(self) -> Handler {
        ByteToMessageDecoder::new(self).into_handler()
    }

    /// 从 `input` 中解出至多一帧；字节不足时返回 `Ok(None)`。
    pub fn decode_frame(&mut self, input: &mut ByteBuf) -> Result<Option<ByteBuf>> {
        let frame_length = match self.pending_frame_length {
            Some(frame_length) => frame_length,
            None => {
                if self.discarding_too_long_frame {
                    self.discard_too_long_frame(input)?;
                }
                if input.readable_bytes() < self.length_field_end_offset {
                    return Ok(None);
                }
                let Some(frame_length) = self.read_frame_length(input)? else {
                    return Ok(None);
                };
                self.pending_frame_length = Some(frame_length);
                frame_length
            }
        };

        if input.readable_bytes() < frame_length {
            return Ok(None);
        }
        self.pending_frame_length = None;

        let strip = self.config.initial_bytes_to_strip;
        if strip > frame_length {
            input.skip_bytes(frame_length)?;
            return Err(CodecError::CorruptedFrame(format!(
                "adjusted frame length ({frame_length}) is less than initial_bytes_to_strip: {strip}"
            )));
        }
        input.skip_bytes(strip)?;
        let frame = input.read_retained_slice(frame_length - strip)?;
        Ok(Some(frame))
    }

    /// 解析并校验帧长度；超长时进入丢弃流程并返回 `None`。
    fn read_frame_length(&mut self, input: &mut ByteBuf) -> Result<Option<usize>> {
        let end_offset = self.length_field_end_offset;
        let raw = self.unadjusted_frame_length(
            input,
            input.reader_index() + self.config.length_field_offset,
        )?;
        if raw < 0 {
            input.skip_bytes(end_offset)?;
            return Err(CodecError::CorruptedFrame(format!(
                "negative pre-adjustment length field: {raw}"
            )));
        }

        let end = end_offset as i128;
        let frame_length = i128::from(raw) + i128::from(self.config.length_adjustment) + end;
        if frame_length < end {
            input.skip_bytes(end_offset)?;
            return Err(CodecError::CorruptedFrame(format!(
                "adjusted frame length ({frame_length}) is less than length_field_end_offset: {end_offset}"
            )));
        }
        if frame_length > self.config.max_frame_length as i128 {
            self.exceeded_frame_length(input, u64::try_from(frame_length).unwrap_or(u64::MAX))?;
            return Ok(None);
        }
        // 不超过 max_frame_length，必然落在 usize 范围内。
        Ok(Some(frame_length as usize))
    }

    fn unadjusted_frame_length(&self, input: &ByteBuf, offset: usize) -> Result<i64> {
        let width = self.config.length_field_length;
        let value = input.get_uint(offset, width, self.config.byte_order)?;
        // 8 字节按有符号解释；更窄的无符号值不会越过 i64 的正数范围。
        Ok(value as i64)
    }

    fn exceeded_frame_length(&mut self, input: &mut ByteBuf, frame_length: u64) -> Result<()> {
        let readable = input.readable_bytes() as u64;
        self.too_long_frame_length = frame_length;
        if frame_length < readable {
            input.skip_bytes(frame_length as usize)?;
        } else {
            self.discarding_too_long_frame = true;
            self.bytes_to_discard = frame_length - readable;
            input.skip_bytes(input.readable_bytes())?;
            tracing::debug!(
                frame_length,
                max_frame_length = self.config.max_frame_length,
                bytes_to_discard = self.bytes_to_discard,
                "entered discard mode for a too long frame"
            );
        }
        self.fail_if_necessary(true)
    }

    fn discard_too_long_frame(&mut self, input: &mut ByteBuf) -> Result<()> {
        let local = self.bytes_to_discard.min(input.readable_bytes() as u64);
        input.skip_bytes(local as usize)?;
        self.bytes_to_discard -= local;
        self.fail_if_necessary(false)
    }

    fn fail_if_necessary(&mut self, first_detection: bool) -> Result<()> {
        if self.bytes_to_discard == 0 {
            let too_long_frame_length = std::mem::take(&mut self.too_long_frame_length);
            if self.discarding_too_long_frame {
                tracing::debug!(
                    frame_length = too_long_frame_length,
                    "left discard mode after skipping a too long frame"
                );
            }
            self.discarding_too_long_frame = false;
            if !self.config.fail_fast || first_detection {
                return Err(self.too_long(too_long_frame_length, false));
            }
        } else if self.config.fail_fast && first_detection {
            return Err(self.too_long(self.too_long_frame_length, true));
        }
        Ok(())
    }

    fn too_long(&self, frame_length: u64, discarding: bool) -> CodecError {
        CodecError::TooLongFrame {
            max_frame_length: self.config.max_frame_length,
            frame_length,
            discarding,
        }
    }
}

impl ByteToMessageDecode for LengthFieldBasedFrameDecoder {
    fn decode(
        &mut self,
        _ctx: &DecodeContext<'_>,
        input: &mut ByteBuf,
        out: &mut Vec<PipelineMessage>,
    ) -> Result<()> {
        if let Some(frame) = self.decode_frame(input)? {
            out.push(frame.into_message());
        }
        Ok(())
    }
}

impl fmt::Debug for LengthFieldBasedFrameDecoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LengthFieldBasedFrameDecoder")
            .field("config", &self.config)
            .field("discarding", &self.discarding_too_long_frame)
            .field("bytes_to_discard", &self.bytes_to_discard)
            .finish()
    }
}

/// `LengthFieldPrepender` 为出站缓冲添加长度帧头，是长度字段分帧的编码端。
///
/// # 契约说明（What）
/// - 帧头值为 `readable + length_adjustment`，`includes_length_field_length` 时再加上帧头宽度；
/// - 值为负或超出帧头宽度的表示范围时返回编码错误；
/// - 产出两条消息：新分配的帧头与 retained 的原缓冲，原缓冲的字节不被复制。
#[derive(Debug, Clone, Copy)]
pub struct LengthFieldPrepender {
    byte_order: ByteOrder,
    length_field_length: usize,
    length_adjustment: i64,
    includes_length_field_length: bool,
}

impl LengthFieldPrepender {
    pub fn new(length_field_length: usize) -> Result<Self> {
        if !SUPPORTED_LENGTH_FIELD_LENGTHS.contains(&length_field_length) {
            return Err(CodecError::InvalidConfig(format!(
                "length_field_length must be one of 1, 2, 3, 4 or 8: {length_field_length}"
            )));
        }
        Ok(Self {
            byte_order: ByteOrder::BigEndian,
            length_field_length,
            length_adjustment: 0,
            includes_length_field_length: false,
        })
    }

    pub fn with_byte_order(mut self, byte_order: ByteOrder) -> Self {
        self.byte_order = byte_order;
        self
    }

    pub fn with_length_adjustment(mut self, length_adjustment: i64) -> Self {
        self.length_adjustment = length_adjustment;
        self
    }

    pub fn with_length_field_included(mut self, includes_length_field_length: bool) -> Self {
        self.includes_length_field_length = includes_length_field_length;
        self
    }

    pub fn into_handler(self) -> Handler {
        MessageToMessageEncoder::new(self).into_handler()
    }

    fn header_value(&self, readable: usize) -> Result<u64> {
        let mut length = readable as i128 + i128::from(self.length_adjustment);
        if self.includes_length_field_length {
            length += self.length_field_length as i128;
        }
        if length < 0 {
            return Err(CodecError::encoder(format!(
                "adjusted frame length ({length}) is less than zero"
            )));
        }
        let max: i128 = match self.length_field_length {
            8 => i128::from(i64::MAX),
            width => (1i128 << (width * 8)) - 1,
        };
        if length > max {
            return Err(CodecError::encoder(format!(
                "length does not fit into a {}-byte length field: {length}",
                self.length_field_length
            )));
        }
        Ok(length as u64)
    }
}

impl MessageToMessageEncode for LengthFieldPrepender {
    type Message = ByteBuf;

    fn encode(
        &mut self,
        ctx: &EncodeContext<'_>,
        msg: &ByteBuf,
        out: &mut Vec<PipelineMessage>,
    ) -> Result<()> {
        let length = self.header_value(msg.readable_bytes())?;
        let width = self.length_field_length;
        let mut header = ctx.allocator().buffer_with(width, width)?;
        if let Err(err) = header
            .ensure_writable(width)
            .and_then(|()| header.set_uint(0, width, length, self.byte_order))
            .and_then(|()| header.set_writer_index(width))
        {
            header.release()?;
            return Err(err.into());
        }
        out.push(header.into_message());
        out.push(msg.retained_duplicate()?.into_message());
        Ok(())
    }
}

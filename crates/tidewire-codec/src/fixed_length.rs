use tidewire_buffer::ByteBuf;
use tidewire_pipeline::{Handler, Message, PipelineMessage};

use crate::byte_to_message::{ByteToMessageDecode, ByteToMessageDecoder};
use crate::context::DecodeContext;
use crate::error::{CodecError, Result};

/// 按固定字节数切分字节流，每帧都是累积缓冲的 retained 切片。
#[derive(Debug, Clone, Copy)]
pub struct FixedLengthFrameDecoder {
    frame_length: usize,
}

impl FixedLengthFrameDecoder {
    pub fn new(frame_length: usize) -> Result<Self> {
        if frame_length == 0 {
            return Err(CodecError::InvalidConfig(
                "frame_length must be a positive integer".to_owned(),
            ));
        }
        Ok(Self { frame_length })
    }

    pub fn frame_length(&self) -> usize {
        self.frame_length
    }

    pub fn into_handler(self) -> Handler {
        ByteToMessageDecoder::new(self).into_handler()
    }

    pub fn decode_frame(&self, input: &mut ByteBuf) -> Result<Option<ByteBuf>> {
        if input.readable_bytes() < self.frame_length {
            return Ok(None);
        }
        Ok(Some(input.read_retained_slice(self.frame_length)?))
    }
}

impl ByteToMessageDecode for FixedLengthFrameDecoder {
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

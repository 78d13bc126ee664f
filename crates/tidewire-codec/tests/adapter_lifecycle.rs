//! `adapter_lifecycle`：适配器在正常与错误路径上对缓冲所有权的处理。
//!
//! # 测试目标（Why）
//! - 累积缓冲、编码输出缓冲与输入消息在任何路径上都必须恰好释放一次；
//! - 使用池化分配器与 `Paranoid` 级别的泄漏探测器，让遗漏的释放以租约计数或泄漏报告暴露出来。
//!
//! # 结构安排（How）
//! - `TextDecoder` / `TextEncoder` 组成一个“2 字节长度 + UTF-8 正文”的全双工编解码器；
//! - 每个用例结束时断言池中没有未归还的租约、探测器没有未关闭的追踪句柄。

#![cfg(not(loom))]

use std::sync::{Arc, Mutex};

use tidewire_buffer::{
    ByteBuf, ByteBufAllocator, LeakDetectionLevel, LeakDetectorConfig, LeakReport, LeakReporter,
    PooledAllocator, ReferenceCounted, ResourceLeakDetector, Unpooled,
};
use tidewire_codec::{
    ByteToMessageCodec, ByteToMessageDecode, CodecError, DecodeContext, EncodeContext,
    MessageToByteEncode, Result, codes,
};
use tidewire_pipeline::{EmbeddedChannel, Message, PipelineMessage, user_message};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Text(String);

/// 连接结束时尚未凑齐一帧的残余字节。
#[derive(Debug, PartialEq, Eq)]
struct Truncated(Vec<u8>);

user_message!(Text, Truncated);

#[derive(Debug, Default)]
struct TextDecoder;

impl ByteToMessageDecode for TextDecoder {
    fn decode(
        &mut self,
        _ctx: &DecodeContext<'_>,
        input: &mut ByteBuf,
        out: &mut Vec<PipelineMessage>,
    ) -> Result<()> {
        if input.readable_bytes() < 2 {
            return Ok(());
        }
        let length = usize::from(input.get_u16(input.reader_index())?);
        if input.readable_bytes() < 2 + length {
            return Ok(());
        }
        input.skip_bytes(2)?;
        let mut body = vec![0; length];
        input.read_bytes_into(&mut body)?;
        let text = String::from_utf8(body).map_err(|err| CodecError::decoder(err.to_string()))?;
        out.push(Text(text).into_message());
        Ok(())
    }

    fn decode_last(
        &mut self,
        ctx: &DecodeContext<'_>,
        input: &mut ByteBuf,
        out: &mut Vec<PipelineMessage>,
    ) -> Result<()> {
        self.decode(ctx, input, out)?;
        if input.is_readable() {
            let mut rest = vec![0; input.readable_bytes()];
            input.read_bytes_into(&mut rest)?;
            out.push(Truncated(rest).into_message());
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct TextEncoder;

impl MessageToByteEncode for TextEncoder {
    type Message = Text;

    fn encode(&mut self, _ctx: &EncodeContext<'_>, msg: &Text, out: &mut ByteBuf) -> Result<()> {
        if msg.0.is_empty() {
            return Err(CodecError::encoder("empty text frames are not allowed"));
        }
        let length = u16::try_from(msg.0.len()).map_err(|err| CodecError::encoder(err.to_string()))?;
        out.write_u16(length)?;
        out.write_bytes(msg.0.as_bytes())?;
        Ok(())
    }
}

#[derive(Default)]
struct CollectingReporter {
    reports: Mutex<Vec<LeakReport>>,
}

impl LeakReporter for CollectingReporter {
    fn report(&self, report: &LeakReport) {
        self.reports.lock().expect("reports lock").push(report.clone());
    }
}

struct Harness {
    pool: PooledAllocator,
    detector: Arc<ResourceLeakDetector>,
    reporter: Arc<CollectingReporter>,
    channel: EmbeddedChannel,
}

impl Harness {
    fn new() -> Self {
        let reporter = Arc::new(CollectingReporter::default());
        let detector = ResourceLeakDetector::with_reporter(
            "ByteBuf",
            LeakDetectorConfig::with_level(LeakDetectionLevel::Paranoid),
            reporter.clone(),
        );
        let pool = PooledAllocator::default().with_leak_detector(detector.clone());
        let codec = ByteToMessageCodec::new(TextDecoder, TextEncoder);
        let channel = EmbeddedChannel::with_allocator(
            Arc::new(pool.clone()),
            [("text", codec.into_handler())],
        )
        .expect("channel");
        Self {
            pool,
            detector,
            reporter,
            channel,
        }
    }

    fn pooled(&self, bytes: &[u8]) -> ByteBuf {
        let mut buf = self.pool.buffer_with(bytes.len(), bytes.len()).expect("pooled buffer");
        buf.write_bytes(bytes).expect("fill");
        buf
    }

    fn assert_no_leases(&self) {
        assert_eq!(self.pool.statistics().active_leases, 0);
        assert_eq!(self.detector.outstanding(), 0);
        assert!(self.reporter.reports.lock().expect("reports lock").is_empty());
    }
}

#[test]
fn codec_round_trips_text_frames() {
    let mut harness = Harness::new();

    assert!(harness.channel.write_outbound(Text("tidewire".to_owned())).expect("encode"));
    let encoded = harness.channel.read_outbound::<ByteBuf>().expect("encoded frame");
    assert_eq!(encoded.readable_bytes(), 2 + "tidewire".len());

    assert!(harness.channel.write_inbound(encoded).expect("decode"));
    assert_eq!(
        harness.channel.read_inbound::<Text>(),
        Some(Text("tidewire".to_owned()))
    );
    assert!(!harness.channel.finish().expect("finish"));
    harness.assert_no_leases();
}

#[test]
fn partial_frame_is_flushed_and_released_when_the_channel_closes() {
    let mut harness = Harness::new();

    let first = harness.pooled(&[0x00, 0x05, b'h']);
    let second = harness.pooled(b"el");
    harness.channel.write_inbound(first).expect("first chunk");
    harness.channel.write_inbound(second).expect("second chunk");
    assert_eq!(harness.channel.inbound_len(), 0);
    assert!(harness.pool.statistics().active_leases > 0);

    assert!(harness.channel.finish().expect("finish"));
    assert_eq!(
        harness.channel.read_inbound::<Truncated>(),
        Some(Truncated(vec![0x00, 0x05, b'h', b'e', b'l']))
    );
    harness.assert_no_leases();
}

#[test]
fn decode_failure_releases_the_consumed_cumulation() {
    let mut harness = Harness::new();

    let mut bytes = vec![0x00, 0x02, 0xFF, 0xFE];
    bytes.extend_from_slice(&[0x00, 0x02, b'o', b'k']);
    let input = harness.pooled(&bytes);
    let err = harness.channel.write_inbound(input).expect_err("invalid utf-8");
    let codec = err.downcast_ref::<CodecError>().expect("codec error");
    assert_eq!(codec.code(), codes::DECODER);
    assert_eq!(harness.channel.inbound_len(), 0);

    // 出错帧已被越过，下一次读事件从紧随其后的帧继续。
    harness
        .channel
        .write_inbound(Unpooled::copied_buffer(&[]).expect("empty read"))
        .expect("resume");
    assert_eq!(harness.channel.read_inbound::<Text>(), Some(Text("ok".to_owned())));
    assert!(!harness.channel.finish().expect("finish"));
    harness.assert_no_leases();
}

#[test]
fn encode_failure_releases_the_output_buffer() {
    let mut harness = Harness::new();

    let err = harness
        .channel
        .write_outbound(Text(String::new()))
        .expect_err("empty text");
    let codec = err.downcast_ref::<CodecError>().expect("codec error");
    assert_eq!(codec.code(), codes::ENCODER);
    assert_eq!(harness.channel.outbound_len(), 0);
    harness.assert_no_leases();

    assert!(!harness.channel.finish().expect("finish"));
    harness.assert_no_leases();
}

#[test]
fn unmatched_messages_cross_the_codec_untouched() {
    let mut harness = Harness::new();
    let buf = harness.pooled(b"raw");

    harness.channel.write_outbound(buf).expect("pass through");
    let passed = harness.channel.read_outbound::<ByteBuf>().expect("same buffer");
    assert_eq!(passed.to_vec().expect("bytes"), b"raw");

    harness.channel.write_inbound(PipelineMessage::user(7u32)).expect("inbound pass through");
    let msg = harness.channel.read_inbound::<PipelineMessage>().expect("user message");
    assert_eq!(msg.take_user::<u32>().expect("u32"), 7);

    assert!(!harness.channel.finish().expect("finish"));
    passed.release().expect("release");
    harness.assert_no_leases();
}

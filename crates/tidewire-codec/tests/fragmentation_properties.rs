//! `fragmentation_properties`：分帧结果与字节到达方式无关。
//!
//! # 测试目标（Why）
//! - 同一字节流无论一次到达还是被任意切分，长度字段解码器产出的帧序列都必须一致；
//! - 长度帧头编码端与解码端配对使用时，正文应原样往返。
//!
//! # 结构安排（How）
//! - proptest 随机生成正文序列、长度字段宽度、是否剥离帧头以及切分步长；
//! - 另一组用例直接驱动 `decode_frame`，参数覆盖偏移、长度补偿、较小的帧上限与 `fail_fast`，
//!   输入为任意字节，超长帧与损坏帧以错误码的形式计入产出序列；
//! - 其余用例的帧都经 `EmbeddedChannel` 走完整的处理器链，读出后立即释放。

#![cfg(not(loom))]

use proptest::prelude::*;
use tidewire_buffer::{ByteBuf, ByteOrder, ReferenceCounted, Unpooled};
use tidewire_codec::{
    LengthFieldBasedFrameDecoder, LengthFieldConfig, LengthFieldPrepender,
    SUPPORTED_LENGTH_FIELD_LENGTHS,
};
use tidewire_pipeline::EmbeddedChannel;

const MAX_FRAME: usize = 4096;

fn encode_stream(bodies: &[Vec<u8>], width: usize, order: ByteOrder) -> Vec<u8> {
    let mut header = Unpooled::buffer(8, 8).expect("header");
    let mut stream = Vec::new();
    for body in bodies {
        header.clear();
        header
            .set_uint(0, width, body.len() as u64, order)
            .and_then(|()| header.set_writer_index(width))
            .expect("length field");
        stream.extend(header.to_vec().expect("header bytes"));
        stream.extend_from_slice(body);
    }
    header.release().expect("release header");
    stream
}

fn decoder_channel(width: usize, order: ByteOrder, strip: bool) -> EmbeddedChannel {
    let config = LengthFieldConfig::new(MAX_FRAME, 0, width)
        .with_byte_order(order)
        .with_initial_bytes_to_strip(if strip { width } else { 0 });
    let decoder = LengthFieldBasedFrameDecoder::new(config).expect("decoder");
    EmbeddedChannel::new([("frames", decoder.into_handler())]).expect("channel")
}

fn decode_in_chunks(channel: &mut EmbeddedChannel, stream: &[u8], steps: &[usize]) -> Vec<Vec<u8>> {
    let mut offset = 0;
    let mut step = steps.iter().cycle();
    while offset < stream.len() {
        let size = step.next().copied().unwrap_or(stream.len()).min(stream.len() - offset);
        let chunk = Unpooled::copied_buffer(&stream[offset..offset + size]).expect("chunk");
        channel.write_inbound(chunk).expect("decode");
        offset += size;
    }
    let mut frames = Vec::new();
    while let Some(frame) = channel.read_inbound::<ByteBuf>() {
        frames.push(frame.to_vec().expect("frame"));
        frame.release().expect("release frame");
    }
    frames
}

fn width_strategy() -> impl Strategy<Value = usize> {
    prop::sample::select(SUPPORTED_LENGTH_FIELD_LENGTHS.to_vec())
}

fn order_strategy() -> impl Strategy<Value = ByteOrder> {
    prop_oneof![Just(ByteOrder::BigEndian), Just(ByteOrder::LittleEndian)]
}

/// 一次解码产出：帧内容或错误码。
#[derive(Debug, PartialEq, Eq)]
enum Outcome {
    Frame(Vec<u8>),
    Error(&'static str),
}

/// 以一块持续追加的缓冲模拟累积，逐块投递并在每块之后解码到无帧可出为止。
fn decode_outcomes(config: LengthFieldConfig, data: &[u8], steps: &[usize]) -> Vec<Outcome> {
    let mut decoder = LengthFieldBasedFrameDecoder::new(config).expect("validated config");
    let mut input = Unpooled::buffer(64, usize::MAX).expect("cumulation");
    let mut outcomes = Vec::new();
    let mut offset = 0;
    let mut step = steps.iter().cycle();
    while offset < data.len() {
        let size = step.next().copied().unwrap_or(data.len()).min(data.len() - offset);
        input.write_bytes(&data[offset..offset + size]).expect("append");
        offset += size;
        loop {
            let before = input.reader_index();
            match decoder.decode_frame(&mut input) {
                Ok(Some(frame)) => {
                    outcomes.push(Outcome::Frame(frame.to_vec().expect("frame bytes")));
                    assert!(!frame.release().expect("release frame"));
                }
                Ok(None) => break,
                Err(err) => {
                    outcomes.push(Outcome::Error(err.code()));
                    if input.reader_index() == before {
                        break;
                    }
                }
            }
        }
        assert_eq!(input.ref_cnt(), 1);
        input.discard_read_bytes().expect("compact");
    }
    assert!(input.release().expect("release cumulation"));
    outcomes
}

prop_compose! {
    fn arbitrary_config()(
        width in prop::sample::select(SUPPORTED_LENGTH_FIELD_LENGTHS.to_vec()),
        offset in 0usize..8,
        adjustment in -16i64..16,
        strip in 0usize..16,
        max_frame_length in 1usize..96,
        order in order_strategy(),
        fail_fast in any::<bool>(),
    ) -> LengthFieldConfig {
        LengthFieldConfig::new(max_frame_length, offset, width)
            .with_length_adjustment(adjustment)
            .with_initial_bytes_to_strip(strip)
            .with_byte_order(order)
            .with_fail_fast(fail_fast)
    }
}

proptest! {
    #[test]
    fn chunking_does_not_change_outcomes_for_any_valid_config(
        config in arbitrary_config().prop_filter("valid config", |config| config.validate().is_ok()),
        data in prop::collection::vec(any::<u8>(), 0..512),
        steps in prop::collection::vec(1usize..48, 1..12),
    ) {
        let whole = decode_outcomes(config, &data, &[data.len().max(1)]);
        let chunked = decode_outcomes(config, &data, &steps);
        prop_assert_eq!(whole, chunked);
    }

    #[test]
    fn chunking_does_not_change_the_frames(
        bodies in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..200), 1..12),
        width in width_strategy(),
        order in order_strategy(),
        strip in any::<bool>(),
        steps in prop::collection::vec(1usize..64, 1..16),
    ) {
        // 1 字节长度字段放不下更长的正文。
        let bodies: Vec<Vec<u8>> = bodies
            .into_iter()
            .map(|mut body| {
                body.truncate(255);
                body
            })
            .collect();
        let stream = encode_stream(&bodies, width, order);

        let mut whole = decoder_channel(width, order, strip);
        let at_once = decode_in_chunks(&mut whole, &stream, &[stream.len()]);
        let mut fragmented = decoder_channel(width, order, strip);
        let chunked = decode_in_chunks(&mut fragmented, &stream, &steps);

        prop_assert_eq!(at_once.len(), bodies.len());
        prop_assert_eq!(&at_once, &chunked);
        if strip {
            prop_assert_eq!(&chunked, &bodies);
        }
        prop_assert!(!whole.finish().expect("finish whole"));
        prop_assert!(!fragmented.finish().expect("finish fragmented"));
    }

    #[test]
    fn prepender_output_decodes_to_the_original_bodies(
        bodies in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..300), 1..8),
        width in prop::sample::select(vec![2usize, 3, 4, 8]),
        steps in prop::collection::vec(1usize..32, 1..8),
    ) {
        let prepender = LengthFieldPrepender::new(width).expect("prepender");
        let mut encoder = EmbeddedChannel::new([("prepender", prepender.into_handler())])
            .expect("encoder channel");
        for body in &bodies {
            encoder
                .write_outbound(Unpooled::copied_buffer(body).expect("body"))
                .expect("encode");
        }
        prop_assert_eq!(encoder.outbound_len(), bodies.len() * 2);

        let mut stream = Vec::new();
        while let Some(part) = encoder.read_outbound::<ByteBuf>() {
            stream.extend(part.to_vec().expect("part"));
            prop_assert!(part.release().expect("release part"));
        }

        let mut decoder = decoder_channel(width, ByteOrder::BigEndian, true);
        let frames = decode_in_chunks(&mut decoder, &stream, &steps);
        prop_assert_eq!(frames, bodies);
        prop_assert!(!encoder.finish().expect("finish encoder"));
        prop_assert!(!decoder.finish().expect("finish decoder"));
    }
}

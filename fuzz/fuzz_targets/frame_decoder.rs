#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use tidewire_buffer::{ByteOrder, ReferenceCounted, Unpooled};
use tidewire_codec::{LengthFieldBasedFrameDecoder, LengthFieldConfig, SUPPORTED_LENGTH_FIELD_LENGTHS};

/// Fuzz 输入：一组分帧参数、一段任意字节流与切分方式。
///
/// - **Why**：长度字段由对端控制，任意取值（负数、超长、小于帧头）都不能让解码器崩溃或泄漏，
///   且分帧结果不得依赖字节的到达方式；
/// - **How**：同一字节流分别整体投递与按 `cuts` 切分投递，比较两条路径的产出序列；
/// - **What**：产出序列由帧内容与错误码组成，两条路径必须完全一致。
#[derive(Debug, Arbitrary)]
struct FrameCase {
    width: u8,
    offset: u8,
    adjustment: i8,
    strip: u8,
    max_frame_length: u16,
    little_endian: bool,
    fail_fast: bool,
    cuts: Vec<u8>,
    data: Vec<u8>,
}

#[derive(Debug, PartialEq, Eq)]
enum Outcome {
    Frame(Vec<u8>),
    Error(&'static str),
}

fuzz_target!(|case: FrameCase| {
    let width = SUPPORTED_LENGTH_FIELD_LENGTHS[usize::from(case.width) % SUPPORTED_LENGTH_FIELD_LENGTHS.len()];
    let config = LengthFieldConfig::new(usize::from(case.max_frame_length), usize::from(case.offset % 8), width)
        .with_length_adjustment(i64::from(case.adjustment))
        .with_initial_bytes_to_strip(usize::from(case.strip % 16))
        .with_byte_order(if case.little_endian {
            ByteOrder::LittleEndian
        } else {
            ByteOrder::BigEndian
        })
        .with_fail_fast(case.fail_fast);
    if config.validate().is_err() {
        return;
    }

    let whole = run(config, &case.data, &[]);
    let chunked = run(config, &case.data, &case.cuts);
    assert_eq!(whole, chunked);
});

fn run(config: LengthFieldConfig, data: &[u8], cuts: &[u8]) -> Vec<Outcome> {
    let mut decoder = LengthFieldBasedFrameDecoder::new(config).expect("validated config");
    let mut input = Unpooled::buffer(64, usize::MAX).expect("cumulation");
    let mut outcomes = Vec::new();
    let mut offset = 0;
    let mut cut = cuts.iter().map(|size| usize::from(*size).max(1)).cycle();

    while offset < data.len() {
        let size = if cuts.is_empty() {
            data.len()
        } else {
            cut.next().unwrap_or(data.len())
        }
        .min(data.len() - offset);
        input.write_bytes(&data[offset..offset + size]).expect("append");
        offset += size;

        loop {
            let before = input.reader_index();
            match decoder.decode_frame(&mut input) {
                Ok(Some(frame)) => {
                    outcomes.push(Outcome::Frame(frame.to_vec().expect("frame bytes")));
                    // 帧与累积缓冲共享计数，释放帧不会回收存储。
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

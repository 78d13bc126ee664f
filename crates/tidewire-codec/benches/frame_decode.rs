use criterion::{BatchSize, Criterion, black_box};
use std::{env, time::Duration};
use tidewire_buffer::{ByteBuf, ByteBufAllocator, PooledAllocator, ReferenceCounted, Unpooled};
use tidewire_codec::{LengthFieldBasedFrameDecoder, LengthFieldConfig};
use tidewire_pipeline::EmbeddedChannel;

const FRAMES: usize = 256;
const BODY: usize = 120;

/// 生成 `FRAMES` 个“2 字节大端长度 + 正文”的连续字节流。
fn stream() -> Vec<u8> {
    let mut bytes = Vec::with_capacity(FRAMES * (BODY + 2));
    for index in 0..FRAMES {
        bytes.extend_from_slice(&(BODY as u16).to_be_bytes());
        bytes.extend(std::iter::repeat_n(index as u8, BODY));
    }
    bytes
}

/// 直接驱动分帧状态机，衡量不经过处理器链时的切分成本。
///
/// # 逻辑解析（How）
/// - 每轮把整段字节流装入一块缓冲，循环 `decode_frame` 直到返回 `None`；
/// - 产出的 retained 切片立即释放，保证基准本身不泄漏。
fn bench_decode_frame(c: &mut Criterion) {
    let bytes = stream();
    c.bench_function("length_field/decode_frame", |b| {
        b.iter_batched(
            || Unpooled::copied_buffer(&bytes).expect("input"),
            |mut input: ByteBuf| {
                let mut decoder =
                    LengthFieldBasedFrameDecoder::new(LengthFieldConfig::new(1024, 0, 2))
                        .expect("decoder");
                let mut frames = 0usize;
                while let Some(frame) = decoder.decode_frame(&mut input).expect("decode") {
                    frames += 1;
                    frame.release().expect("release frame");
                }
                input.release().expect("release input");
                black_box(frames)
            },
            BatchSize::SmallInput,
        );
    });
}

/// 经 `EmbeddedChannel` 以 64 字节分片投递，覆盖累积合并与池化扩容路径。
fn bench_fragmented_pipeline(c: &mut Criterion) {
    let bytes = stream();
    let pool = PooledAllocator::default();
    c.bench_function("length_field/pipeline_64b_chunks", |b| {
        b.iter(|| {
            let decoder = LengthFieldBasedFrameDecoder::new(
                LengthFieldConfig::new(1024, 0, 2).with_initial_bytes_to_strip(2),
            )
            .expect("decoder");
            let mut channel = EmbeddedChannel::with_allocator(
                std::sync::Arc::new(pool.clone()),
                [("frames", decoder.into_handler())],
            )
            .expect("channel");
            for chunk in bytes.chunks(64) {
                let mut buf = pool.buffer_with(chunk.len(), chunk.len()).expect("chunk");
                buf.write_bytes(chunk).expect("fill");
                channel.write_inbound(buf).expect("decode");
            }
            let mut frames = 0usize;
            while let Some(frame) = channel.read_inbound::<ByteBuf>() {
                frames += 1;
                frame.release().expect("release frame");
            }
            channel.finish().expect("finish");
            black_box(frames)
        });
    });
}

fn main() {
    let mut quick_mode = false;
    for arg in env::args().skip(1) {
        if arg == "--quick" {
            quick_mode = true;
        }
    }

    let mut criterion = Criterion::default();
    if quick_mode {
        criterion = criterion
            .sample_size(10)
            .warm_up_time(Duration::from_millis(100))
            .measurement_time(Duration::from_millis(250));
    }

    bench_decode_frame(&mut criterion);
    bench_fragmented_pipeline(&mut criterion);
    criterion.final_summary();
}

//! `tidewire-buffer` 提供显式引用计数的传输缓冲、分配器与泄漏探测。
//!
//! # 模块定位（Why）
//! - 传输缓冲的生命周期由 `retain`/`release` 显式驱动，而不是依赖析构时机，
//!   使缓冲可以在处理器、解码器与后台任务之间以所有权转移的方式流转；
//! - 解码出的帧以零拷贝切片引用累积缓冲，池化存储在计数归零时确定性地回到池中。
//!
//! # 设计概要（How）
//! - `refcnt`：基于 CAS 循环的计数单元与 [`ReferenceCounted`] 契约；
//! - `storage`：堆 / 直接内存存储与 [`BufferRecycler`] 回收钩子；
//! - `buf`：[`ByteBuf`] 句柄，含切片、复制、整数读写与扩容；
//! - `allocator` / `pool`：[`ByteBufAllocator`] 契约、非池化与按档位池化的实现；
//! - `composite`：[`CompositeByteBuf`]；
//! - `leak` / `config`：采样式泄漏探测及其进程级配置。
//!
//! # 命名约定（Consistency）
//! - 术语沿用业界网络框架的惯例：`reader_index`/`writer_index`、`retained_slice`、`io_buffer`，
//!   便于熟悉这些框架的读者直接对照。

mod allocator;
mod buf;
mod composite;
pub mod config;
mod error;
mod leak;
mod pool;
mod refcnt;
mod storage;

pub use allocator::{
    ByteBufAllocator, CALCULATE_THRESHOLD, DEFAULT_INITIAL_CAPACITY, DEFAULT_MAX_CAPACITY,
    DEFAULT_MAX_COMPONENTS, Unpooled, UnpooledAllocator, calculate_new_capacity,
};
pub use buf::{ByteBuf, ByteOrder};
pub use composite::CompositeByteBuf;
pub use config::{LeakDetectionLevel, LeakDetectorConfig};
pub use error::{BufferError, Result, codes};
pub use leak::{
    AccessKind, AccessRecord, LeakReport, LeakReporter, LeakTracker, ResourceLeakDetector,
    TracingLeakReporter,
};
pub use pool::{PoolStats, PooledAllocator, PooledAllocatorConfig};
pub use refcnt::{RefCnt, ReferenceCounted};
pub use storage::{BufferRecycler, DIRECT_ALIGNMENT, DropRecycler, Storage};

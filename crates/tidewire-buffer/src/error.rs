use thiserror::Error;

/// 稳定错误码，命名遵循 `<域>.<语义>` 约定，供日志与指标做机读分类。
pub mod codes {
    /// 引用计数违规：复活已归零的缓冲、释放次数超过持有次数或计数溢出。
    pub const ILLEGAL_REF_COUNT: &str = "buffer.illegal_ref_count";
    /// 分配器容量请求非法。
    pub const CAPACITY: &str = "buffer.capacity";
    /// 读写指针或索引越界。
    pub const INDEX_OUT_OF_BOUNDS: &str = "buffer.index_out_of_bounds";
    /// 调用参数不满足前置条件（例如增量为 0）。
    pub const INVALID_ARGUMENT: &str = "buffer.invalid_argument";
}

/// `BufferError` 汇总缓冲层可能出现的全部故障。
///
/// # 设计背景（Why）
/// - 引用计数错误意味着内存安全风险，必须以独立变体呈现，调用方不得静默吞掉；
/// - 容量与索引错误只影响单次调用，调用方可据此关闭连接或丢弃当前帧。
///
/// # 契约说明（What）
/// - `IllegalReferenceCount`：`count` 为操作发生时观测到的计数，`delta` 为本次尝试的增减量；
/// - `Capacity`：`requested` 超过 `maximum`，或初始容量大于最大容量；
/// - `IndexOutOfBounds`：访问区间 `[index, index + length)` 超出 `capacity`；
/// - [`code`](Self::code) 返回稳定错误码，永不随文案调整而变化。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BufferError {
    #[error("illegal reference count {count}, delta {delta}")]
    IllegalReferenceCount { count: usize, delta: isize },

    #[error("requested capacity {requested} exceeds maximum capacity {maximum}")]
    Capacity { requested: usize, maximum: usize },

    #[error("index {index} with length {length} exceeds capacity {capacity}")]
    IndexOutOfBounds {
        index: usize,
        length: usize,
        capacity: usize,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}

impl BufferError {
    /// 返回稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            BufferError::IllegalReferenceCount { .. } => codes::ILLEGAL_REF_COUNT,
            BufferError::Capacity { .. } => codes::CAPACITY,
            BufferError::IndexOutOfBounds { .. } => codes::INDEX_OUT_OF_BOUNDS,
            BufferError::InvalidArgument(_) => codes::INVALID_ARGUMENT,
        }
    }

    /// 是否属于引用计数纪律被破坏的致命错误。
    pub fn is_ref_count_violation(&self) -> bool {
        matches!(self, BufferError::IllegalReferenceCount { .. })
    }

    pub(crate) fn released(delta: isize) -> Self {
        BufferError::IllegalReferenceCount { count: 0, delta }
    }

    pub(crate) fn out_of_bounds(index: usize, length: usize, capacity: usize) -> Self {
        BufferError::IndexOutOfBounds {
            index,
            length,
            capacity,
        }
    }
}

/// 缓冲层统一的结果别名。
pub type Result<T, E = BufferError> = core::result::Result<T, E>;

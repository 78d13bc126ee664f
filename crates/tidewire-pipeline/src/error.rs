use std::error::Error as StdError;

use thiserror::Error;
use tidewire_buffer::BufferError;

/// 稳定错误码。
pub mod codes {
    pub const NO_SUCH_HANDLER: &str = "pipeline.no_such_handler";
    pub const DUPLICATE_NAME: &str = "pipeline.duplicate_name";
    pub const CLOSED: &str = "pipeline.closed";
    pub const REENTRANT_CALL: &str = "pipeline.reentrant_call";
    pub const UNSUPPORTED_MESSAGE: &str = "pipeline.unsupported_message";
    pub const HANDLER: &str = "pipeline.handler";
}

/// `PipelineError` 描述处理器链上的故障。
///
/// # 契约说明（What）
/// - `Buffer`：缓冲层错误原样透传，错误码沿用缓冲层的码值；
/// - `Handler`：处理器自身的错误（例如编解码错误），以装箱形式携带，
///   调用方可通过 [`downcast_ref`](Self::downcast_ref) 取回具体类型；
/// - `ReentrantCall`：事件在同一处理器尚未返回时再次抵达它。
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Buffer(#[from] BufferError),

    #[error("no handler named `{0}`")]
    NoSuchHandler(String),

    #[error("duplicate handler name `{0}`")]
    DuplicateName(String),

    #[error("channel is closed")]
    Closed,

    #[error("handler `{0}` re-entered while still running")]
    ReentrantCall(String),

    #[error("transport cannot write {0} messages")]
    UnsupportedMessage(&'static str),

    #[error("{source}")]
    Handler {
        code: &'static str,
        source: Box<dyn StdError + Send + Sync>,
    },
}

impl PipelineError {
    /// 包装处理器错误并指定其稳定错误码。
    pub fn handler<E>(code: &'static str, error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        PipelineError::Handler {
            code,
            source: Box::new(error),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::Buffer(err) => err.code(),
            PipelineError::NoSuchHandler(_) => codes::NO_SUCH_HANDLER,
            PipelineError::DuplicateName(_) => codes::DUPLICATE_NAME,
            PipelineError::Closed => codes::CLOSED,
            PipelineError::ReentrantCall(_) => codes::REENTRANT_CALL,
            PipelineError::UnsupportedMessage(_) => codes::UNSUPPORTED_MESSAGE,
            PipelineError::Handler { code, .. } => *code,
        }
    }

    /// 取回处理器错误的具体类型。
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: StdError + 'static,
    {
        match self {
            PipelineError::Handler { source, .. } => source.downcast_ref::<E>(),
            _ => None,
        }
    }

    /// 是否为缓冲引用计数违规。
    pub fn is_ref_count_violation(&self) -> bool {
        matches!(self, PipelineError::Buffer(err) if err.is_ref_count_violation())
    }
}

use std::error::Error as StdError;

use thiserror::Error;
use tidewire_buffer::BufferError;
use tidewire_pipeline::PipelineError;

/// 稳定错误码。
pub mod codes {
    /// 长度字段为负、调整后长度小于字段末端或小于剥离字节数。
    pub const CORRUPTED_FRAME: &str = "codec.corrupted_frame";
    /// 帧长度超过配置上限。
    pub const TOO_LONG_FRAME: &str = "codec.too_long_frame";
    /// 解码步骤失败。
    pub const DECODER: &str = "codec.decoder";
    /// 编码步骤失败。
    pub const ENCODER: &str = "codec.encoder";
    /// 构造参数非法。
    pub const INVALID_CONFIG: &str = "codec.invalid_config";
}

/// `CodecError` 描述编解码适配器与分帧引擎的故障。
///
/// # 设计背景（Why）
/// - 分帧错误（`CorruptedFrame`、`TooLongFrame`）只影响当前帧：抛出前输入已越过出错的帧头，
///   调用方可以继续读取后续帧，也可以关闭连接；
/// - 用户步骤的其他失败统一包装为 `Decoder` / `Encoder`，便于连接级策略按方向区分。
///
/// # 契约说明（What）
/// - [`wrap_decode`](Self::wrap_decode) 不会二次包装已属于解码族的错误，
///   [`wrap_encode`](Self::wrap_encode) 同理；
/// - `Buffer` 变体透传缓冲层错误，其中引用计数违规须作为致命错误向上传播；
/// - 经过处理器链时转换为 [`PipelineError::Handler`]，调用方以
///   `PipelineError::downcast_ref::<CodecError>()` 取回。
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("corrupted frame: {0}")]
    CorruptedFrame(String),

    #[error(
        "adjusted frame length exceeds {max_frame_length}: {frame_length} - {}",
        if *.discarding { "discarding" } else { "discarded" }
    )]
    TooLongFrame {
        max_frame_length: usize,
        /// 帧头声明并经补偿后的帧总长度。
        frame_length: u64,
        /// 报告时超长帧的剩余字节是否仍在丢弃中（`fail_fast` 的首次报告）。
        discarding: bool,
    },

    #[error("decoder failure: {0}")]
    Decoder(#[source] Box<dyn StdError + Send + Sync>),

    #[error("encoder failure: {0}")]
    Encoder(#[source] Box<dyn StdError + Send + Sync>),

    #[error(transparent)]
    Buffer(#[from] BufferError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl CodecError {
    pub fn code(&self) -> &'static str {
        match self {
            CodecError::CorruptedFrame(_) => codes::CORRUPTED_FRAME,
            CodecError::TooLongFrame { .. } => codes::TOO_LONG_FRAME,
            CodecError::Decoder(_) => codes::DECODER,
            CodecError::Encoder(_) => codes::ENCODER,
            CodecError::Buffer(err) => err.code(),
            CodecError::InvalidConfig(_) => codes::INVALID_CONFIG,
        }
    }

    /// 以文案构造解码错误。
    pub fn decoder(message: impl Into<String>) -> Self {
        let message: String = message.into();
        CodecError::Decoder(message.into())
    }

    /// 以文案构造编码错误。
    pub fn encoder(message: impl Into<String>) -> Self {
        let message: String = message.into();
        CodecError::Encoder(message.into())
    }

    /// 是否属于解码族（分帧错误与解码错误）。
    pub fn is_decode_failure(&self) -> bool {
        matches!(
            self,
            CodecError::CorruptedFrame(_) | CodecError::TooLongFrame { .. } | CodecError::Decoder(_)
        )
    }

    pub fn is_ref_count_violation(&self) -> bool {
        matches!(self, CodecError::Buffer(err) if err.is_ref_count_violation())
    }

    /// 把解码路径上的错误归入解码族；引用计数违规与已属于解码族的错误保持原样。
    pub fn wrap_decode(self) -> Self {
        if self.is_decode_failure() || self.is_ref_count_violation() {
            self
        } else {
            CodecError::Decoder(Box::new(self))
        }
    }

    /// 把编码路径上的错误归入编码族；引用计数违规与已是编码错误的保持原样。
    pub fn wrap_encode(self) -> Self {
        if matches!(self, CodecError::Encoder(_)) || self.is_ref_count_violation() {
            self
        } else {
            CodecError::Encoder(Box::new(self))
        }
    }
}

impl From<CodecError> for PipelineError {
    fn from(error: CodecError) -> Self {
        match error {
            CodecError::Buffer(err) => PipelineError::Buffer(err),
            other => PipelineError::handler(other.code(), other),
        }
    }
}

/// 编解码层统一的结果别名。
pub type Result<T, E = CodecError> = core::result::Result<T, E>;

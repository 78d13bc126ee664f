use tidewire_buffer::ReferenceCounted;
use tidewire_pipeline::{HandlerContext, PipelineError, PipelineMessage};

/// 按顺序向后转发全部产出；某条转发失败时释放剩余产出并返回该错误。
pub(crate) fn fire_reads(
    ctx: &mut HandlerContext<'_>,
    out: &mut Vec<PipelineMessage>,
) -> Result<(), PipelineError> {
    let mut pending = out.drain(..);
    while let Some(msg) = pending.next() {
        if let Err(err) = ctx.fire_channel_read(msg) {
            release_quietly(pending);
            return Err(err);
        }
    }
    Ok(())
}

/// 按顺序向前写出全部产出，失败语义同 [`fire_reads`]。
pub(crate) fn write_all(
    ctx: &mut HandlerContext<'_>,
    out: &mut Vec<PipelineMessage>,
) -> Result<(), PipelineError> {
    let mut pending = out.drain(..);
    while let Some(msg) = pending.next() {
        if let Err(err) = ctx.write(msg) {
            release_quietly(pending);
            return Err(err);
        }
    }
    Ok(())
}

/// 错误路径上释放尚未交出的消息；释放失败只记录日志，不覆盖原始错误。
pub(crate) fn release_quietly(messages: impl IntoIterator<Item = PipelineMessage>) {
    for msg in messages {
        if let Err(err) = msg.release() {
            tracing::warn!(
                error = %err,
                kind = msg.kind(),
                "failed to release a message on the error path"
            );
        }
    }
}

use std::collections::VecDeque;
use std::sync::Arc;

use spin::Mutex;
use tidewire_buffer::{ByteBufAllocator, ReferenceCounted, Unpooled};

use crate::error::PipelineError;
use crate::handler::Handler;
use crate::message::{Message, PipelineMessage};
use crate::pipeline::{InboundSink, Pipeline, Transport};

type Queue = Arc<Mutex<VecDeque<PipelineMessage>>>;

struct MemoryTransport {
    pending: Vec<PipelineMessage>,
    outbound: Queue,
    closed: bool,
}

impl Transport for MemoryTransport {
    fn write(&mut self, msg: PipelineMessage) -> Result<(), PipelineError> {
        if self.closed {
            msg.release()?;
            return Err(PipelineError::Closed);
        }
        self.pending.push(msg);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), PipelineError> {
        self.outbound.lock().extend(self.pending.drain(..));
        Ok(())
    }

    fn close(&mut self) -> Result<(), PipelineError> {
        self.closed = true;
        for msg in self.pending.drain(..) {
            msg.release()?;
        }
        Ok(())
    }
}

struct CollectingSink {
    inbound: Queue,
    exceptions: Arc<Mutex<VecDeque<PipelineError>>>,
}

impl InboundSink for CollectingSink {
    fn on_read(&mut self, msg: PipelineMessage) -> Result<(), PipelineError> {
        self.inbound.lock().push_back(msg);
        Ok(())
    }

    fn on_exception(&mut self, error: PipelineError) -> Result<(), PipelineError> {
        self.exceptions.lock().push_back(error);
        Ok(())
    }
}

/// `EmbeddedChannel` 是完全位于内存中的测试通道。
///
/// # 设计背景（Why）
/// - 编解码器与适配器的行为只依赖处理器链，无需真实套接字即可验证；
///   内存通道把入站末端与出站传输层替换为两个队列，测试直接读取两端的产出。
///
/// # 契约说明（What）
/// - 构造时按顺序登记处理器并广播 `channel_active`；
/// - 出站消息写入后暂存，`flush` 时才进入出站队列；
/// - 抵达末端的异常被收集，由 [`check_exception`](Self::check_exception) 取出；
/// - 队列中剩余的消息由测试负责读取或通过 `release_*` 释放。
pub struct EmbeddedChannel {
    pipeline: Pipeline,
    inbound: Queue,
    outbound: Queue,
    exceptions: Arc<Mutex<VecDeque<PipelineError>>>,
}

impl EmbeddedChannel {
    pub fn new<I>(handlers: I) -> Result<Self, PipelineError>
    where
        I: IntoIterator<Item = (&'static str, Handler)>,
    {
        Self::with_allocator(Unpooled::shared_allocator(), handlers)
    }

    pub fn with_allocator<I>(
        allocator: Arc<dyn ByteBufAllocator>,
        handlers: I,
    ) -> Result<Self, PipelineError>
    where
        I: IntoIterator<Item = (&'static str, Handler)>,
    {
        let inbound: Queue = Arc::default();
        let outbound: Queue = Arc::default();
        let exceptions = Arc::new(Mutex::new(VecDeque::new()));
        let transport = MemoryTransport {
            pending: Vec::new(),
            outbound: Arc::clone(&outbound),
            closed: false,
        };
        let sink = CollectingSink {
            inbound: Arc::clone(&inbound),
            exceptions: Arc::clone(&exceptions),
        };
        let mut pipeline = Pipeline::with_parts(Box::new(transport), Box::new(sink), allocator);
        for (name, handler) in handlers {
            pipeline.add_last(name, handler)?;
        }
        pipeline.fire_channel_active()?;
        Ok(Self {
            pipeline,
            inbound,
            outbound,
            exceptions,
        })
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn pipeline_mut(&mut self) -> &mut Pipeline {
        &mut self.pipeline
    }

    /// 投递一条入站消息并触发 `read_complete`，返回入站队列是否非空。
    pub fn write_inbound(&mut self, msg: impl Message) -> Result<bool, PipelineError> {
        self.pipeline.fire_channel_read(msg.into_message())?;
        self.pipeline.fire_channel_read_complete()?;
        Ok(!self.inbound.lock().is_empty())
    }

    /// 写出并刷新一条出站消息，返回出站队列是否非空。
    pub fn write_outbound(&mut self, msg: impl Message) -> Result<bool, PipelineError> {
        self.pipeline.write_and_flush(msg.into_message())?;
        Ok(!self.outbound.lock().is_empty())
    }

    /// 取出队首的入站消息；类型不符时消息留在队首并返回 `None`。
    pub fn read_inbound<T: Message>(&self) -> Option<T> {
        pop_as(&self.inbound)
    }

    /// 取出队首的出站消息；类型不符时消息留在队首并返回 `None`。
    pub fn read_outbound<T: Message>(&self) -> Option<T> {
        pop_as(&self.outbound)
    }

    pub fn inbound_len(&self) -> usize {
        self.inbound.lock().len()
    }

    pub fn outbound_len(&self) -> usize {
        self.outbound.lock().len()
    }

    /// 取出最早抵达末端的异常。
    pub fn check_exception(&self) -> Result<(), PipelineError> {
        match self.exceptions.lock().pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// 释放入站队列中的所有消息，返回队列此前是否非空。
    pub fn release_inbound(&self) -> Result<bool, PipelineError> {
        release_all(&self.inbound)
    }

    /// 释放出站队列中的所有消息，返回队列此前是否非空。
    pub fn release_outbound(&self) -> Result<bool, PipelineError> {
        release_all(&self.outbound)
    }

    /// 关闭通道，返回两端队列中是否仍有待读取的消息。
    pub fn finish(&mut self) -> Result<bool, PipelineError> {
        self.pipeline.close()?;
        Ok(self.inbound_len() + self.outbound_len() > 0)
    }

    /// 关闭通道并释放两端队列。
    pub fn finish_and_release_all(&mut self) -> Result<bool, PipelineError> {
        let closed = self.pipeline.close();
        let inbound = self.release_inbound()?;
        let outbound = self.release_outbound()?;
        closed?;
        Ok(inbound || outbound)
    }
}

fn pop_as<T: Message>(queue: &Queue) -> Option<T> {
    let mut queue = queue.lock();
    let msg = queue.pop_front()?;
    match T::from_message(msg) {
        Ok(value) => Some(value),
        Err(msg) => {
            queue.push_front(msg);
            None
        }
    }
}

fn release_all(queue: &Queue) -> Result<bool, PipelineError> {
    let drained: Vec<PipelineMessage> = queue.lock().drain(..).collect();
    let had_messages = !drained.is_empty();
    for msg in drained {
        msg.release()?;
    }
    Ok(had_messages)
}

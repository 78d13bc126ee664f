//! 处理器链的事件顺序、增删生命周期与关闭语义。

#![cfg(not(loom))]

use std::sync::{Arc, Mutex};

use tidewire_buffer::{ByteBuf, CompositeByteBuf, ReferenceCounted, Unpooled};
use tidewire_pipeline::{
    ChannelHandler, EmbeddedChannel, Handler, HandlerContext, InboundHandler, Message,
    OutboundHandler, PipelineError, PipelineMessage, codes, user_message,
};

#[derive(Debug, PartialEq)]
struct Greeting(String);

user_message!(Greeting);

type Journal = Arc<Mutex<Vec<String>>>;

struct Recorder {
    label: &'static str,
    journal: Journal,
}

impl Recorder {
    fn note(&self, event: &str) {
        self.journal
            .lock()
            .expect("journal lock")
            .push(format!("{}:{event}", self.label));
    }
}

impl ChannelHandler for Recorder {
    fn on_handler_removed(&mut self, _ctx: &mut HandlerContext<'_>) -> Result<(), PipelineError> {
        self.note("removed");
        Ok(())
    }
}

impl InboundHandler for Recorder {
    fn on_read(
        &mut self,
        ctx: &mut HandlerContext<'_>,
        msg: PipelineMessage,
    ) -> Result<(), PipelineError> {
        self.note("read");
        ctx.fire_channel_read(msg)
    }
}

impl OutboundHandler for Recorder {
    fn on_write(
        &mut self,
        ctx: &mut HandlerContext<'_>,
        msg: PipelineMessage,
    ) -> Result<(), PipelineError> {
        self.note("write");
        ctx.write(msg)
    }
}

fn recorder(label: &'static str, journal: &Journal) -> Handler {
    Handler::duplex(Recorder {
        label,
        journal: Arc::clone(journal),
    })
}

fn bare_channel() -> EmbeddedChannel {
    EmbeddedChannel::new(Vec::<(&'static str, Handler)>::new()).expect("channel")
}

fn entries(journal: &Journal) -> Vec<String> {
    journal.lock().expect("journal lock").clone()
}

/// 把字节缓冲解释为 UTF-8 文本并转换为 `Greeting`。
struct GreetingDecoder;

impl ChannelHandler for GreetingDecoder {}

impl InboundHandler for GreetingDecoder {
    fn on_read(
        &mut self,
        ctx: &mut HandlerContext<'_>,
        msg: PipelineMessage,
    ) -> Result<(), PipelineError> {
        match ByteBuf::from_message(msg) {
            Ok(buf) => {
                let text = buf.to_vec();
                buf.release()?;
                let text = String::from_utf8_lossy(&text?).into_owned();
                ctx.fire_channel_read(Greeting(text).into_message())
            }
            Err(other) => ctx.fire_channel_read(other),
        }
    }
}

/// 缓存所有入站消息，移除时整体转发。
#[derive(Default)]
struct Holding {
    held: Vec<PipelineMessage>,
}

impl ChannelHandler for Holding {
    fn on_handler_removed(&mut self, ctx: &mut HandlerContext<'_>) -> Result<(), PipelineError> {
        for msg in self.held.drain(..) {
            ctx.fire_channel_read(msg)?;
        }
        Ok(())
    }
}

impl InboundHandler for Holding {
    fn on_read(
        &mut self,
        _ctx: &mut HandlerContext<'_>,
        msg: PipelineMessage,
    ) -> Result<(), PipelineError> {
        self.held.push(msg);
        Ok(())
    }
}

#[test]
fn inbound_runs_front_to_back_and_outbound_back_to_front() {
    let journal = Journal::default();
    let mut channel = EmbeddedChannel::new([
        ("a", recorder("a", &journal)),
        ("b", recorder("b", &journal)),
    ])
    .expect("channel");

    channel
        .write_inbound(Greeting("in".into()))
        .expect("inbound");
    channel
        .write_outbound(Greeting("out".into()))
        .expect("outbound");

    assert_eq!(entries(&journal), ["a:read", "b:read", "b:write", "a:write"]);
    assert_eq!(channel.read_inbound::<Greeting>(), Some(Greeting("in".into())));
    assert_eq!(channel.read_outbound::<Greeting>(), Some(Greeting("out".into())));
}

#[test]
fn handlers_transform_messages_and_release_inputs() {
    let mut channel =
        EmbeddedChannel::new([("greeting", Handler::inbound(GreetingDecoder))]).expect("channel");
    let buf = Unpooled::copied_buffer(b"hello").expect("buffer");
    let observer = buf.duplicate().expect("duplicate");

    assert!(channel.write_inbound(buf).expect("inbound"));
    assert_eq!(channel.read_inbound::<Greeting>(), Some(Greeting("hello".into())));
    assert_eq!(observer.ref_cnt(), 0);
}

#[test]
fn mismatched_read_leaves_the_message_queued() {
    let mut channel = bare_channel();
    channel
        .write_inbound(Greeting("stay".into()))
        .expect("inbound");

    assert!(channel.read_inbound::<ByteBuf>().is_none());
    assert_eq!(channel.inbound_len(), 1);
    assert_eq!(channel.read_inbound::<Greeting>(), Some(Greeting("stay".into())));
}

#[test]
fn duplicate_and_unknown_names_are_rejected() {
    let journal = Journal::default();
    let mut channel = EmbeddedChannel::new([("a", recorder("a", &journal))]).expect("channel");
    let pipeline = channel.pipeline_mut();

    let err = pipeline
        .add_last("a", recorder("again", &journal))
        .expect_err("duplicate");
    assert_eq!(err.code(), codes::DUPLICATE_NAME);

    let err = pipeline.remove("missing").expect_err("unknown");
    assert_eq!(err.code(), codes::NO_SUCH_HANDLER);
    assert_eq!(pipeline.names(), ["a"]);
}

#[test]
fn removal_hook_can_forward_held_messages() {
    let mut channel =
        EmbeddedChannel::new([("holding", Handler::inbound(Holding::default()))]).expect("channel");

    assert!(!channel.write_inbound(Greeting("later".into())).expect("inbound"));
    let removed = channel.pipeline_mut().remove("holding").expect("remove");
    assert!(removed.is_inbound());
    assert_eq!(channel.read_inbound::<Greeting>(), Some(Greeting("later".into())));
    assert!(channel.pipeline().names().is_empty());
}

#[test]
fn close_removes_handlers_in_reverse_order_and_rejects_writes() {
    let journal = Journal::default();
    let mut channel = EmbeddedChannel::new([
        ("a", recorder("a", &journal)),
        ("b", recorder("b", &journal)),
    ])
    .expect("channel");

    assert!(!channel.finish().expect("finish"));
    assert_eq!(entries(&journal), ["b:removed", "a:removed"]);
    assert!(channel.pipeline().is_closed());

    let buf = Unpooled::copied_buffer(b"late").expect("buffer");
    let observer = buf.duplicate().expect("duplicate");
    let err = channel.write_outbound(buf).expect_err("closed");
    assert_eq!(err.code(), codes::CLOSED);
    assert_eq!(observer.ref_cnt(), 0);
}

#[test]
fn unhandled_exceptions_reach_the_tail() {
    let mut channel = bare_channel();
    channel
        .pipeline_mut()
        .fire_exception_caught(PipelineError::UnsupportedMessage("greeting"))
        .expect("fire");

    let err = channel.check_exception().expect_err("recorded");
    assert_eq!(err.code(), codes::UNSUPPORTED_MESSAGE);
    assert!(channel.check_exception().is_ok());
}

#[test]
fn release_helpers_drain_both_queues() {
    let mut channel = bare_channel();
    let inbound = Unpooled::copied_buffer(b"in").expect("buffer");
    let outbound = Unpooled::copied_buffer(b"out").expect("buffer");
    let (in_view, out_view) = (
        inbound.duplicate().expect("duplicate"),
        outbound.duplicate().expect("duplicate"),
    );

    channel.write_inbound(inbound).expect("inbound");
    channel.write_outbound(outbound).expect("outbound");
    assert!(channel.finish_and_release_all().expect("finish"));
    assert_eq!(in_view.ref_cnt(), 0);
    assert_eq!(out_view.ref_cnt(), 0);
}

#[test]
fn composite_buffers_travel_as_counted_user_messages() {
    let mut channel = bare_channel();
    let head = Unpooled::copied_buffer(b"head").expect("head");
    let body = Unpooled::copied_buffer(b"body").expect("body");
    let views = (
        head.duplicate().expect("duplicate"),
        body.duplicate().expect("duplicate"),
    );
    let mut composite = CompositeByteBuf::new(4);
    composite.add_component(head).expect("head component");
    composite.add_component(body).expect("body component");

    channel
        .write_inbound(PipelineMessage::counted(composite))
        .expect("inbound");
    let msg = channel.read_inbound::<PipelineMessage>().expect("queued");
    assert!(msg.is_user::<CompositeByteBuf>());
    let Ok(composite) = msg.take_user::<CompositeByteBuf>() else {
        panic!("composite message expected");
    };
    assert_eq!(composite.to_vec().expect("bytes"), b"headbody");
    assert_eq!(views.0.ref_cnt(), 1);

    assert!(composite.release().expect("release composite"));
    assert_eq!(views.0.ref_cnt(), 0);
    assert_eq!(views.1.ref_cnt(), 0);

    let tail = Unpooled::copied_buffer(b"tail").expect("tail");
    let tail_view = tail.duplicate().expect("duplicate");
    let mut pending = CompositeByteBuf::new(4);
    pending.add_component(tail).expect("tail component");
    channel
        .write_inbound(PipelineMessage::counted(pending))
        .expect("inbound");
    assert!(channel.finish_and_release_all().expect("finish"));
    assert_eq!(tail_view.ref_cnt(), 0);
}

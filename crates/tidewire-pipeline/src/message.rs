use std::any::{Any, type_name};
use std::fmt;
use std::sync::Arc;

use tidewire_buffer::{BufferError, ByteBuf, ReferenceCounted};

use crate::region::FileRegion;

/// `PipelineMessage` 统一承载处理器链上流动的字节与业务对象。
///
/// # 设计背景（Why）
/// - 传输层只理解字节缓冲与文件区段，业务层则传递任意类型；
///   以带标签的联合体呈现两者，处理器按变体分派，而非依赖运行时反射。
///
/// # 契约说明（What）
/// - `Buffer` 与 `Region` 变体总是引用计数对象；`User` 变体可以是计数对象（`counted`），也可以是普通值（`plain`）；
/// - [`ReferenceCounted`] 对普通值的 `retain`/`release` 是无操作，`release` 返回 `false`；
/// - 消息的所有权随值移动，丢弃一个计数消息而不 `release` 会被泄漏探测记录。
pub enum PipelineMessage {
    Buffer(ByteBuf),
    Region(FileRegion),
    User(UserMessage),
}

impl PipelineMessage {
    /// 以普通值构造业务消息。
    pub fn user<T: Any + Send>(value: T) -> Self {
        PipelineMessage::User(UserMessage::plain(value))
    }

    /// 以计数对象构造业务消息，释放消息即释放该对象。
    pub fn counted<T: ReferenceCounted + Any + Send>(value: T) -> Self {
        PipelineMessage::User(UserMessage::counted(value))
    }

    /// 变体名称，用于日志与错误文案。
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineMessage::Buffer(_) => "buffer",
            PipelineMessage::Region(_) => "file-region",
            PipelineMessage::User(user) => user.type_name(),
        }
    }

    /// 是否为指定类型的业务消息。
    pub fn is_user<T: Any>(&self) -> bool {
        matches!(self, PipelineMessage::User(user) if user.is::<T>())
    }

    /// 取出指定类型的业务消息；类型不符时原样退回。
    pub fn take_user<T: Any>(self) -> Result<T, Self> {
        match self {
            PipelineMessage::User(user) => user.take::<T>().map_err(PipelineMessage::User),
            other => Err(other),
        }
    }

    pub fn into_buffer(self) -> Result<ByteBuf, Self> {
        match self {
            PipelineMessage::Buffer(buf) => Ok(buf),
            other => Err(other),
        }
    }
}

impl ReferenceCounted for PipelineMessage {
    fn ref_cnt(&self) -> usize {
        match self {
            PipelineMessage::Buffer(buf) => buf.ref_cnt(),
            PipelineMessage::Region(region) => region.ref_cnt(),
            PipelineMessage::User(user) => user.ref_cnt(),
        }
    }

    fn retain_n(&self, increment: usize) -> tidewire_buffer::Result<()> {
        match self {
            PipelineMessage::Buffer(buf) => buf.retain_n(increment),
            PipelineMessage::Region(region) => region.retain_n(increment),
            PipelineMessage::User(user) => user.retain_n(increment),
        }
    }

    fn release_n(&self, decrement: usize) -> tidewire_buffer::Result<bool> {
        match self {
            PipelineMessage::Buffer(buf) => buf.release_n(decrement),
            PipelineMessage::Region(region) => region.release_n(decrement),
            PipelineMessage::User(user) => user.release_n(decrement),
        }
    }

    fn touch(&self, hint: Option<&str>) {
        match self {
            PipelineMessage::Buffer(buf) => buf.touch(hint),
            PipelineMessage::Region(region) => region.touch(hint),
            PipelineMessage::User(user) => user.touch(hint),
        }
    }
}

impl fmt::Debug for PipelineMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineMessage::Buffer(buf) => f.debug_tuple("Buffer").field(buf).finish(),
            PipelineMessage::Region(region) => f.debug_tuple("Region").field(region).finish(),
            PipelineMessage::User(user) => f.debug_tuple("User").field(&user.type_name()).finish(),
        }
    }
}

/// 计数业务对象的单态化操作表。
#[derive(Clone, Copy)]
struct CountedOps {
    ref_cnt: fn(&dyn Any) -> usize,
    retain: fn(&dyn Any, usize) -> tidewire_buffer::Result<()>,
    release: fn(&dyn Any, usize) -> tidewire_buffer::Result<bool>,
    touch: fn(&dyn Any, Option<&str>),
}

impl CountedOps {
    fn of<T: ReferenceCounted + Any>() -> Self {
        Self {
            ref_cnt: |value| value.downcast_ref::<T>().map_or(0, T::ref_cnt),
            retain: |value, n| match value.downcast_ref::<T>() {
                Some(inner) => inner.retain_n(n),
                None => Err(mismatch()),
            },
            release: |value, n| match value.downcast_ref::<T>() {
                Some(inner) => inner.release_n(n),
                None => Err(mismatch()),
            },
            touch: |value, hint| {
                if let Some(inner) = value.downcast_ref::<T>() {
                    inner.touch(hint);
                }
            },
        }
    }
}

fn mismatch() -> BufferError {
    BufferError::InvalidArgument("counted message type mismatch")
}

/// 类型擦除后的业务消息。
pub struct UserMessage {
    value: Box<dyn Any + Send>,
    type_name: &'static str,
    counted: Option<CountedOps>,
}

impl UserMessage {
    pub fn plain<T: Any + Send>(value: T) -> Self {
        Self {
            value: Box::new(value),
            type_name: type_name::<T>(),
            counted: None,
        }
    }

    pub fn counted<T: ReferenceCounted + Any + Send>(value: T) -> Self {
        Self {
            value: Box::new(value),
            type_name: type_name::<T>(),
            counted: Some(CountedOps::of::<T>()),
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn is<T: Any>(&self) -> bool {
        self.value.is::<T>()
    }

    pub fn is_counted(&self) -> bool {
        self.counted.is_some()
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }

    /// 取出具体值；类型不符时原样退回。
    pub fn take<T: Any>(self) -> Result<T, Self> {
        let Self {
            value,
            type_name,
            counted,
        } = self;
        match value.downcast::<T>() {
            Ok(inner) => Ok(*inner),
            Err(value) => Err(Self {
                value,
                type_name,
                counted,
            }),
        }
    }
}

impl ReferenceCounted for UserMessage {
    fn ref_cnt(&self) -> usize {
        match &self.counted {
            Some(ops) => (ops.ref_cnt)(self.value.as_ref()),
            None => 1,
        }
    }

    fn retain_n(&self, increment: usize) -> tidewire_buffer::Result<()> {
        match &self.counted {
            Some(ops) => (ops.retain)(self.value.as_ref(), increment),
            None => Ok(()),
        }
    }

    fn release_n(&self, decrement: usize) -> tidewire_buffer::Result<bool> {
        match &self.counted {
            Some(ops) => (ops.release)(self.value.as_ref(), decrement),
            None => Ok(false),
        }
    }

    fn touch(&self, hint: Option<&str>) {
        if let Some(ops) = &self.counted {
            (ops.touch)(self.value.as_ref(), hint);
        }
    }
}

/// 能以具体类型在处理器链上收发的消息。
///
/// # 契约说明（What）
/// - `matches` 只检查、不消费；
/// - `from_message` 类型不符时必须原样退回消息，不得释放；
/// - 业务类型可借助 [`user_message!`](crate::user_message) / [`counted_message!`](crate::counted_message) 生成实现。
pub trait Message: Send + 'static + Sized {
    fn matches(msg: &PipelineMessage) -> bool;

    fn into_message(self) -> PipelineMessage;

    fn from_message(msg: PipelineMessage) -> Result<Self, PipelineMessage>;
}

impl Message for ByteBuf {
    fn matches(msg: &PipelineMessage) -> bool {
        matches!(msg, PipelineMessage::Buffer(_))
    }

    fn into_message(self) -> PipelineMessage {
        PipelineMessage::Buffer(self)
    }

    fn from_message(msg: PipelineMessage) -> Result<Self, PipelineMessage> {
        msg.into_buffer()
    }
}

impl Message for FileRegion {
    fn matches(msg: &PipelineMessage) -> bool {
        matches!(msg, PipelineMessage::Region(_))
    }

    fn into_message(self) -> PipelineMessage {
        PipelineMessage::Region(self)
    }

    fn from_message(msg: PipelineMessage) -> Result<Self, PipelineMessage> {
        match msg {
            PipelineMessage::Region(region) => Ok(region),
            other => Err(other),
        }
    }
}

impl Message for PipelineMessage {
    fn matches(_msg: &PipelineMessage) -> bool {
        true
    }

    fn into_message(self) -> PipelineMessage {
        self
    }

    fn from_message(msg: PipelineMessage) -> Result<Self, PipelineMessage> {
        Ok(msg)
    }
}

/// 为普通业务类型实现 [`Message`]。
#[macro_export]
macro_rules! user_message {
    ($($ty:ty),+ $(,)?) => {$(
        impl $crate::Message for $ty {
            fn matches(msg: &$crate::PipelineMessage) -> bool {
                msg.is_user::<$ty>()
            }

            fn into_message(self) -> $crate::PipelineMessage {
                $crate::PipelineMessage::user(self)
            }

            fn from_message(msg: $crate::PipelineMessage) -> ::core::result::Result<Self, $crate::PipelineMessage> {
                msg.take_user::<$ty>()
            }
        }
    )+};
}

/// 为实现了 `ReferenceCounted` 的业务类型实现 [`Message`]。
#[macro_export]
macro_rules! counted_message {
    ($($ty:ty),+ $(,)?) => {$(
        impl $crate::Message for $ty {
            fn matches(msg: &$crate::PipelineMessage) -> bool {
                msg.is_user::<$ty>()
            }

            fn into_message(self) -> $crate::PipelineMessage {
                $crate::PipelineMessage::counted(self)
            }

            fn from_message(msg: $crate::PipelineMessage) -> ::core::result::Result<Self, $crate::PipelineMessage> {
                msg.take_user::<$ty>()
            }
        }
    )+};
}

/// `MessageMatcher` 是适配器在构造时提供的显式接收谓词。
///
/// # 契约说明（What）
/// - 默认谓词 [`of`](Self::of) 等价于“消息能转换为 `T`”；
/// - 自定义谓词返回 `true` 时，适配器仍会通过 `T::from_message` 取值，
///   转换失败的消息按未匹配处理并原样转发。
#[derive(Clone)]
pub struct MessageMatcher {
    predicate: Arc<dyn Fn(&PipelineMessage) -> bool + Send + Sync>,
}

impl MessageMatcher {
    pub fn of<T: Message>() -> Self {
        Self::new(T::matches)
    }

    pub fn new(predicate: impl Fn(&PipelineMessage) -> bool + Send + Sync + 'static) -> Self {
        Self {
            predicate: Arc::new(predicate),
        }
    }

    pub fn accepts(&self, msg: &PipelineMessage) -> bool {
        (self.predicate)(msg)
    }
}

impl fmt::Debug for MessageMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MessageMatcher")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidewire_buffer::{RefCnt, Unpooled};

    #[derive(Debug, PartialEq)]
    struct Greeting(&'static str);

    struct Counted(RefCnt);

    impl ReferenceCounted for Counted {
        fn ref_cnt(&self) -> usize {
            self.0.get()
        }

        fn retain_n(&self, increment: usize) -> tidewire_buffer::Result<()> {
            self.0.retain(increment).map(|_| ())
        }

        fn release_n(&self, decrement: usize) -> tidewire_buffer::Result<bool> {
            self.0.release(decrement)
        }

        fn touch(&self, _hint: Option<&str>) {}
    }

    crate::user_message!(Greeting);

    #[test]
    fn user_messages_round_trip_through_the_union() {
        let msg = Greeting("hi").into_message();
        assert!(Greeting::matches(&msg));
        assert!(!ByteBuf::matches(&msg));
        let back = ByteBuf::from_message(msg).expect_err("not a buffer");
        assert_eq!(Greeting::from_message(back).expect("greeting"), Greeting("hi"));
    }

    #[test]
    fn plain_messages_ignore_reference_counting() {
        let msg = PipelineMessage::user(5u32);
        msg.retain().expect("noop retain");
        assert_eq!(msg.ref_cnt(), 1);
        assert!(!msg.release().expect("noop release"));
    }

    #[test]
    fn counted_user_messages_forward_to_the_value() {
        let msg = PipelineMessage::counted(Counted(RefCnt::new()));
        msg.retain().expect("retain");
        assert_eq!(msg.ref_cnt(), 2);
        assert!(!msg.release().expect("release"));
        assert!(msg.release().expect("final release"));
        assert!(msg.release().unwrap_err().is_ref_count_violation());
    }

    #[test]
    fn matcher_uses_explicit_predicate() {
        let small = MessageMatcher::new(|msg| match msg {
            PipelineMessage::Buffer(buf) => buf.readable_bytes() < 4,
            _ => false,
        });
        let msg = PipelineMessage::Buffer(Unpooled::copied_buffer(b"ab").expect("buf"));
        assert!(small.accepts(&msg));
        assert!(MessageMatcher::of::<ByteBuf>().accepts(&msg));
        assert!(!MessageMatcher::of::<Greeting>().accepts(&msg));
        msg.release().expect("release");
    }
}

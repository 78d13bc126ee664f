//! 引用计数单元与 `ReferenceCounted` 契约。
//!
//! # 模块定位（Why）
//! - 传输缓冲的生命周期不交给析构时机决定，而是由显式的 `retain`/`release` 驱动：
//!   `retain` 表示出现新的所有者，`release` 表示当前所有者放弃所有权，
//!   计数由 1 归零的那一次调用负责触发回收钩子。
//! - 计数是缓冲唯一允许被多个线程同时触碰的状态，因此只通过 CAS 循环更新。
//!
//! # 实现要点（How）
//! - 读取当前值、计算新值、`compare_exchange_weak`，冲突时以观测值重试；
//! - 成功的归零转换只会发生一次，调用方据此保证回收钩子恰好执行一次；
//! - `cfg(loom)` 下切换为 Loom 原子类型，以便穷举调度交错。

#[cfg(loom)]
use loom::sync::atomic::{AtomicUsize, Ordering};
#[cfg(not(loom))]
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{BufferError, Result};

/// 无锁引用计数单元。
///
/// # 契约说明（What）
/// - 新建时计数为 1，代表创建者即唯一所有者；
/// - 计数一旦归零就不可复活，任何针对 0 的 `retain`/`release` 都返回
///   [`BufferError::IllegalReferenceCount`]；
/// - `release` 返回 `true` 当且仅当本次调用把计数推到 0。
#[derive(Debug)]
pub struct RefCnt {
    count: AtomicUsize,
}

impl RefCnt {
    /// 创建计数为 1 的单元。
    pub fn new() -> Self {
        Self {
            count: AtomicUsize::new(1),
        }
    }

    /// 读取当前计数快照。
    pub fn get(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// 将计数增加 `increment`，返回增加后的值。
    pub fn retain(&self, increment: usize) -> Result<usize> {
        if increment == 0 {
            return Err(BufferError::InvalidArgument("retain increment must be positive"));
        }
        let delta = to_delta(increment);
        let mut current = self.count.load(Ordering::Relaxed);
        loop {
            if current == 0 {
                return Err(BufferError::released(delta));
            }
            let next = current
                .checked_add(increment)
                .ok_or(BufferError::IllegalReferenceCount {
                    count: current,
                    delta,
                })?;
            match self.count.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(next),
                Err(observed) => current = observed,
            }
        }
    }

    /// 将计数减少 `decrement`；若本次调用使计数归零则返回 `true`。
    pub fn release(&self, decrement: usize) -> Result<bool> {
        if decrement == 0 {
            return Err(BufferError::InvalidArgument("release decrement must be positive"));
        }
        let delta = -to_delta(decrement);
        let mut current = self.count.load(Ordering::Relaxed);
        loop {
            if decrement > current {
                return Err(BufferError::IllegalReferenceCount {
                    count: current,
                    delta,
                });
            }
            let next = current - decrement;
            match self.count.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(next == 0),
                Err(observed) => current = observed,
            }
        }
    }
}

impl Default for RefCnt {
    fn default() -> Self {
        Self::new()
    }
}

fn to_delta(amount: usize) -> isize {
    isize::try_from(amount).unwrap_or(isize::MAX)
}

/// 显式引用计数对象的统一契约。
///
/// # 设计背景（Why）
/// - 缓冲、复合缓冲、文件区段与业务自定义消息都需要同一套所有权转移语义，
///   流水线在释放消息时只依赖本 trait，而不关心具体类型。
///
/// # 契约说明（What）
/// - `retain_n`/`release_n` 的前置条件：增减量大于 0；
/// - `release_n` 使计数归零时，实现必须同步执行一次回收钩子并返回 `Ok(true)`；
/// - `touch` 不改变计数，只在泄漏探测开启时记录访问点；
/// - 将对象交给其它组件而不 `retain`，即视为转移所有权。
pub trait ReferenceCounted {
    /// 当前计数；为 0 表示对象已被回收。
    fn ref_cnt(&self) -> usize;

    /// 计数增加 `increment`。
    fn retain_n(&self, increment: usize) -> Result<()>;

    /// 计数减少 `decrement`，归零时回收并返回 `true`。
    fn release_n(&self, decrement: usize) -> Result<bool>;

    /// 记录一次访问点，供泄漏报告还原调用轨迹。
    fn touch(&self, hint: Option<&str>);

    /// 计数加一并返回自身，便于链式调用。
    fn retain(&self) -> Result<&Self>
    where
        Self: Sized,
    {
        self.retain_n(1).map(|_| self)
    }

    /// 计数减一。
    fn release(&self) -> Result<bool> {
        self.release_n(1)
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn retain_then_release_restores_count() {
        let cnt = RefCnt::new();
        assert_eq!(cnt.retain(3).expect("retain"), 4);
        assert!(!cnt.release(3).expect("release"));
        assert_eq!(cnt.get(), 1);
        assert!(cnt.release(1).expect("final release"));
        assert_eq!(cnt.get(), 0);
    }

    #[test]
    fn resurrection_is_rejected() {
        let cnt = RefCnt::new();
        assert!(cnt.release(1).expect("release"));
        let err = cnt.retain(1).expect_err("复活必须失败");
        assert_eq!(err, BufferError::IllegalReferenceCount { count: 0, delta: 1 });
    }

    #[test]
    fn over_release_keeps_count_untouched() {
        let cnt = RefCnt::new();
        cnt.retain(1).expect("retain");
        let err = cnt.release(3).expect_err("超额释放必须失败");
        assert_eq!(err, BufferError::IllegalReferenceCount { count: 2, delta: -3 });
        assert_eq!(cnt.get(), 2);
    }

    #[test]
    fn overflow_is_rejected() {
        let cnt = RefCnt::new();
        let err = cnt.retain(usize::MAX).expect_err("溢出必须失败");
        assert!(err.is_ref_count_violation());
        assert_eq!(cnt.get(), 1);
    }

    #[test]
    fn zero_delta_is_invalid() {
        let cnt = RefCnt::new();
        assert!(matches!(cnt.retain(0), Err(BufferError::InvalidArgument(_))));
        assert!(matches!(cnt.release(0), Err(BufferError::InvalidArgument(_))));
    }
}

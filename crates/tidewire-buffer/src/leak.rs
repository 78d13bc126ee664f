//! 缓冲泄漏探测。
//!
//! # 模块定位（Why）
//! - 显式引用计数把“何时释放”交给调用方，一旦某条路径忘记 `release`，
//!   存储就再也回不到池中，且不会有任何错误提示；
//! - 探测器以采样方式追踪新分配的缓冲，在最后一个句柄被丢弃而计数仍未归零时报告泄漏，
//!   并尽可能附带创建点与最近的访问轨迹。
//!
//! # 实现要点（How）
//! - 活跃追踪项存放在以标识为键的 `DashMap` 侧表中，显式释放（计数归零）时移除；
//! - 移除操作本身是原子的：计数归零与句柄丢弃即便在不同线程竞争，也只会有一方拿到条目，
//!   因而不会重复报告；
//! - 报告按渲染后的签名去重，同一泄漏点只输出一次；
//! - `simple` 级别按采样间隔随机追踪且不记录轨迹，`advanced` 及以上全部追踪并抓取调用栈。

use std::backtrace::Backtrace;
use std::collections::VecDeque;
use std::fmt::{self, Write as _};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use dashmap::{DashMap, DashSet};
use rand::Rng;

use crate::config::{LeakDetectionLevel, LeakDetectorConfig};

/// 访问记录的类别。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessKind {
    Created,
    Touch,
    Retain,
    Release,
    /// 创建共享计数的派生视图（切片、复制）。
    Derive,
}

impl fmt::Display for AccessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AccessKind::Created => "created",
            AccessKind::Touch => "touch",
            AccessKind::Retain => "retain",
            AccessKind::Release => "release",
            AccessKind::Derive => "derive",
        };
        f.write_str(name)
    }
}

/// 一次访问的快照。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessRecord {
    pub kind: AccessKind,
    pub hint: Option<String>,
    /// 仅在记录访问轨迹的级别下抓取。
    pub trace: Option<String>,
}

impl AccessRecord {
    fn capture(kind: AccessKind, hint: Option<&str>, level: LeakDetectionLevel) -> Self {
        let trace = level
            .records_access()
            .then(|| Backtrace::force_capture().to_string());
        Self {
            kind,
            hint: hint.map(str::to_owned),
            trace,
        }
    }

    fn render_into(&self, out: &mut String) {
        let _ = write!(out, "{}", self.kind);
        if let Some(hint) = &self.hint {
            let _ = write!(out, " (hint: {hint})");
        }
        out.push('\n');
        if let Some(trace) = &self.trace {
            for line in trace.lines() {
                let _ = writeln!(out, "\t{line}");
            }
        }
    }
}

/// 一次泄漏的完整报告。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeakReport {
    pub resource_type: &'static str,
    pub level: LeakDetectionLevel,
    pub created: AccessRecord,
    /// 最近的访问记录，最新的在前。
    pub records: Vec<AccessRecord>,
    /// 因超出记录上限而被淘汰的旧记录数量。
    pub dropped_records: usize,
}

impl LeakReport {
    /// 是否包含访问轨迹。
    pub fn is_traced(&self) -> bool {
        self.created.trace.is_some()
    }

    /// 渲染为日志文本；渲染结果同时作为去重签名，不含任何实例标识。
    pub fn render(&self) -> String {
        let mut out = format!(
            "LEAK: {}.release() was not called before it was dropped.",
            self.resource_type
        );
        if !self.is_traced() {
            out.push_str(
                " Enable advanced leak reporting to find out where the leak occurred. \
                 To enable advanced leak reporting, set TIDEWIRE_LEAK_DETECTION_LEVEL=advanced.",
            );
            return out;
        }
        out.push_str("\nRecent access records:\n");
        for (index, record) in self.records.iter().enumerate() {
            let _ = write!(out, "#{}: ", index + 1);
            record.render_into(&mut out);
        }
        out.push_str("Created at: ");
        self.created.render_into(&mut out);
        if self.dropped_records > 0 {
            let _ = write!(
                out,
                "{} leak records were discarded because the record limit was reached.",
                self.dropped_records
            );
        }
        out
    }
}

/// 泄漏报告的输出端。
pub trait LeakReporter: Send + Sync + 'static {
    fn report(&self, report: &LeakReport);
}

/// 默认输出端：通过 `tracing::error!` 写入日志。
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLeakReporter;

impl LeakReporter for TracingLeakReporter {
    fn report(&self, report: &LeakReport) {
        tracing::error!(
            target: "tidewire::leak",
            resource = report.resource_type,
            level = %report.level,
            traced = report.is_traced(),
            "{}",
            report.render()
        );
    }
}

struct TrackedEntry {
    level: LeakDetectionLevel,
    created: AccessRecord,
    records: VecDeque<AccessRecord>,
    dropped: usize,
}

/// `ResourceLeakDetector` 管理一类资源的泄漏追踪。
///
/// # 契约说明（What）
/// - [`track`](Self::track) 在新资源分配时调用，返回 `None` 表示本次未被采样；
/// - 追踪句柄 [`LeakTracker`] 随资源一起存活，资源被显式释放时调用 [`LeakTracker::close`]；
/// - 追踪句柄在 `close` 之前被丢弃即视为泄漏，报告交给 [`LeakReporter`]。
pub struct ResourceLeakDetector {
    resource_type: &'static str,
    config: LeakDetectorConfig,
    live: DashMap<u64, TrackedEntry>,
    reported: DashSet<String>,
    reporter: Arc<dyn LeakReporter>,
    next_id: AtomicU64,
}

impl fmt::Debug for ResourceLeakDetector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceLeakDetector")
            .field("resource_type", &self.resource_type)
            .field("config", &self.config)
            .field("outstanding", &self.live.len())
            .finish()
    }
}

static GLOBAL: OnceLock<Arc<ResourceLeakDetector>> = OnceLock::new();

impl ResourceLeakDetector {
    /// 创建输出到 `tracing` 的私有探测器。
    pub fn new(resource_type: &'static str, config: LeakDetectorConfig) -> Arc<Self> {
        Self::with_reporter(resource_type, config, Arc::new(TracingLeakReporter))
    }

    /// 创建带自定义输出端的私有探测器。
    pub fn with_reporter(
        resource_type: &'static str,
        config: LeakDetectorConfig,
        reporter: Arc<dyn LeakReporter>,
    ) -> Arc<Self> {
        Arc::new(Self {
            resource_type,
            config,
            live: DashMap::new(),
            reported: DashSet::new(),
            reporter,
            next_id: AtomicU64::new(1),
        })
    }

    /// 进程级缓冲探测器，所有设置跟随 [`crate::config`] 中的进程级值。
    pub fn global() -> Arc<Self> {
        Arc::clone(GLOBAL.get_or_init(|| Self::new("ByteBuf", LeakDetectorConfig::default())))
    }

    /// 当前生效的探测级别。
    pub fn level(&self) -> LeakDetectionLevel {
        self.config.effective_level()
    }

    /// 仍在追踪中的资源数量。
    pub fn outstanding(&self) -> usize {
        self.live.len()
    }

    /// 为新分配的资源决定是否追踪。
    pub fn track(self: &Arc<Self>) -> Option<LeakTracker> {
        let level = self.level();
        if level == LeakDetectionLevel::Disabled {
            return None;
        }
        if !level.tracks_every_allocation() {
            let interval = self.config.effective_sampling_interval();
            if interval > 1 && rand::thread_rng().gen_range(0..interval) != 0 {
                return None;
            }
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.live.insert(
            id,
            TrackedEntry {
                level,
                created: AccessRecord::capture(AccessKind::Created, None, level),
                records: VecDeque::new(),
                dropped: 0,
            },
        );
        Some(LeakTracker {
            detector: Arc::clone(self),
            id,
        })
    }

    fn record(&self, id: u64, kind: AccessKind, hint: Option<&str>) {
        let Some(mut entry) = self.live.get_mut(&id) else {
            return;
        };
        if !entry.level.records_access() {
            return;
        }
        if kind == AccessKind::Derive && entry.level != LeakDetectionLevel::Paranoid {
            return;
        }
        let limit = self.config.effective_target_records();
        let record = AccessRecord::capture(kind, hint, entry.level);
        while entry.records.len() >= limit {
            entry.records.pop_front();
            entry.dropped += 1;
        }
        entry.records.push_back(record);
    }

    fn close(&self, id: u64) -> bool {
        self.live.remove(&id).is_some()
    }

    fn report_if_live(&self, id: u64) {
        let Some((_, entry)) = self.live.remove(&id) else {
            return;
        };
        let report = LeakReport {
            resource_type: self.resource_type,
            level: entry.level,
            created: entry.created,
            records: entry.records.into_iter().rev().collect(),
            dropped_records: entry.dropped,
        };
        if self.reported.insert(report.render()) {
            self.reporter.report(&report);
        }
    }
}

/// 单个资源的追踪句柄。
///
/// # 契约说明（What）
/// - 由资源独占持有，随资源一同被丢弃；
/// - `close` 幂等，只有第一次调用返回 `true`；
/// - 在 `close` 之前被丢弃时向探测器报告泄漏。
pub struct LeakTracker {
    detector: Arc<ResourceLeakDetector>,
    id: u64,
}

impl LeakTracker {
    /// 追踪标识，在同一探测器内唯一。
    pub fn id(&self) -> u64 {
        self.id
    }

    /// 记录一次访问。
    pub fn record(&self, kind: AccessKind, hint: Option<&str>) {
        self.detector.record(self.id, kind, hint);
    }

    /// 资源已被显式释放，停止追踪。
    pub fn close(&self) -> bool {
        self.detector.close(self.id)
    }
}

impl fmt::Debug for LeakTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeakTracker").field("id", &self.id).finish()
    }
}

impl Drop for LeakTracker {
    fn drop(&mut self) {
        self.detector.report_if_live(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Collect(Mutex<Vec<LeakReport>>);

    impl LeakReporter for Collect {
        fn report(&self, report: &LeakReport) {
            self.0.lock().expect("lock").push(report.clone());
        }
    }

    fn detector(level: LeakDetectionLevel, records: usize) -> (Arc<ResourceLeakDetector>, Arc<Collect>) {
        let sink = Arc::new(Collect::default());
        let config = LeakDetectorConfig::with_level(level).with_target_records(records);
        let detector = ResourceLeakDetector::with_reporter("TestResource", config, sink.clone());
        (detector, sink)
    }

    #[test]
    fn closed_tracker_does_not_report() {
        let (detector, sink) = detector(LeakDetectionLevel::Advanced, 4);
        let tracker = detector.track().expect("advanced always tracks");
        assert!(tracker.close());
        assert!(!tracker.close());
        drop(tracker);
        assert!(sink.0.lock().expect("lock").is_empty());
        assert_eq!(detector.outstanding(), 0);
    }

    #[test]
    fn records_are_bounded_and_newest_first() {
        let (detector, sink) = detector(LeakDetectionLevel::Advanced, 2);
        let tracker = detector.track().expect("tracked");
        tracker.record(AccessKind::Touch, Some("a"));
        tracker.record(AccessKind::Touch, Some("b"));
        tracker.record(AccessKind::Touch, Some("c"));
        drop(tracker);

        let reports = sink.0.lock().expect("lock");
        assert_eq!(reports.len(), 1);
        let hints: Vec<_> = reports[0].records.iter().map(|r| r.hint.as_deref()).collect();
        assert_eq!(hints, vec![Some("c"), Some("b")]);
        assert_eq!(reports[0].dropped_records, 1);
        assert!(reports[0].render().contains("1 leak records were discarded"));
    }

    #[test]
    fn disabled_level_never_tracks() {
        let (detector, _) = detector(LeakDetectionLevel::Disabled, 4);
        assert!(detector.track().is_none());
    }

    #[test]
    fn identical_untraced_leaks_are_reported_once() {
        let sink = Arc::new(Collect::default());
        let config = LeakDetectorConfig::with_level(LeakDetectionLevel::Simple).with_sampling_interval(1);
        let detector = ResourceLeakDetector::with_reporter("TestResource", config, sink.clone());
        drop(detector.track().expect("interval 1 samples everything"));
        drop(detector.track().expect("interval 1 samples everything"));
        let reports = sink.0.lock().expect("lock");
        assert_eq!(reports.len(), 1);
        assert!(!reports[0].is_traced());
    }
}

//! 泄漏探测的进程级配置。
//!
//! # 配置来源（How）
//! 1. 首次读取时从环境变量初始化：
//!    - `TIDEWIRE_LEAK_DETECTION_LEVEL`：`disabled` / `simple` / `advanced` / `paranoid`，大小写不敏感；
//!    - `TIDEWIRE_LEAK_DETECTION_TARGET_RECORDS`：每个缓冲最多保留的访问记录数；
//!    - `TIDEWIRE_LEAK_DETECTION_SAMPLING_INTERVAL`：`simple` 级别下的采样间隔；
//! 2. 运行期可通过 `set_*` 覆盖，覆盖值优先于环境变量；
//! 3. 隔离场景（测试、嵌入式组件）使用 [`LeakDetectorConfig`] 构造私有探测器，不触碰进程级状态。

use std::fmt;
use std::str::FromStr;
use std::sync::Once;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

/// 环境变量：探测级别。
pub const ENV_LEVEL: &str = "TIDEWIRE_LEAK_DETECTION_LEVEL";
/// 环境变量：保留的访问记录上限。
pub const ENV_TARGET_RECORDS: &str = "TIDEWIRE_LEAK_DETECTION_TARGET_RECORDS";
/// 环境变量：采样间隔。
pub const ENV_SAMPLING_INTERVAL: &str = "TIDEWIRE_LEAK_DETECTION_SAMPLING_INTERVAL";

/// 默认保留的访问记录数。
pub const DEFAULT_TARGET_RECORDS: usize = 4;
/// 默认采样间隔：约每 128 次分配追踪一次。
pub const DEFAULT_SAMPLING_INTERVAL: usize = 128;

/// 泄漏探测级别，按开销递增排序。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeakDetectionLevel {
    /// 不追踪任何缓冲。
    Disabled,
    /// 按采样间隔追踪，报告不含访问轨迹。
    Simple,
    /// 追踪全部缓冲并记录访问轨迹。
    Advanced,
    /// 与 `Advanced` 相同，额外在每次创建派生视图时记录。
    Paranoid,
}

impl LeakDetectionLevel {
    const fn to_u8(self) -> u8 {
        match self {
            LeakDetectionLevel::Disabled => 0,
            LeakDetectionLevel::Simple => 1,
            LeakDetectionLevel::Advanced => 2,
            LeakDetectionLevel::Paranoid => 3,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => LeakDetectionLevel::Disabled,
            2 => LeakDetectionLevel::Advanced,
            3 => LeakDetectionLevel::Paranoid,
            _ => LeakDetectionLevel::Simple,
        }
    }

    /// 该级别下新分配的缓冲是否无需采样、必然追踪。
    pub fn tracks_every_allocation(self) -> bool {
        self >= LeakDetectionLevel::Advanced
    }

    /// 该级别下是否保留访问轨迹。
    pub fn records_access(self) -> bool {
        self >= LeakDetectionLevel::Advanced
    }
}

impl fmt::Display for LeakDetectionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LeakDetectionLevel::Disabled => "disabled",
            LeakDetectionLevel::Simple => "simple",
            LeakDetectionLevel::Advanced => "advanced",
            LeakDetectionLevel::Paranoid => "paranoid",
        };
        f.write_str(name)
    }
}

/// 无法识别的级别字符串。
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown leak detection level `{0}`")]
pub struct ParseLevelError(pub String);

impl FromStr for LeakDetectionLevel {
    type Err = ParseLevelError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "disabled" | "off" => Ok(LeakDetectionLevel::Disabled),
            "simple" => Ok(LeakDetectionLevel::Simple),
            "advanced" => Ok(LeakDetectionLevel::Advanced),
            "paranoid" => Ok(LeakDetectionLevel::Paranoid),
            _ => Err(ParseLevelError(raw.to_owned())),
        }
    }
}

/// 从键值来源解析出的设置，未给出或非法的键保持 `None`。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnvSettings {
    pub level: Option<LeakDetectionLevel>,
    pub target_records: Option<usize>,
    pub sampling_interval: Option<usize>,
}

impl EnvSettings {
    /// 通过查找函数解析设置，便于在测试中替换环境变量来源。
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let level = lookup(ENV_LEVEL).and_then(|raw| match raw.parse() {
            Ok(level) => Some(level),
            Err(err) => {
                tracing::warn!(%err, "ignoring {ENV_LEVEL}");
                None
            }
        });
        Self {
            level,
            target_records: parse_positive(&lookup, ENV_TARGET_RECORDS),
            sampling_interval: parse_positive(&lookup, ENV_SAMPLING_INTERVAL),
        }
    }

    /// 读取真实进程环境。
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }
}

fn parse_positive<F>(lookup: &F, key: &str) -> Option<usize>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse::<usize>() {
        Ok(value) if value > 0 => Some(value),
        _ => {
            tracing::warn!(value = %raw, "ignoring {key}: expected a positive integer");
            None
        }
    }
}

const UNSET: u8 = u8::MAX;

static LEVEL: AtomicU8 = AtomicU8::new(UNSET);
static TARGET_RECORDS: AtomicUsize = AtomicUsize::new(0);
static SAMPLING_INTERVAL: AtomicUsize = AtomicUsize::new(0);
static ENV_INIT: Once = Once::new();

fn ensure_initialized() {
    ENV_INIT.call_once(|| {
        let env = EnvSettings::from_env();
        let level = env.level.unwrap_or(LeakDetectionLevel::Simple);
        // 运行期覆盖先于首次读取发生时，保留覆盖值。
        let _ = LEVEL.compare_exchange(UNSET, level.to_u8(), Ordering::AcqRel, Ordering::Acquire);
        let _ = TARGET_RECORDS.compare_exchange(
            0,
            env.target_records.unwrap_or(DEFAULT_TARGET_RECORDS),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        let _ = SAMPLING_INTERVAL.compare_exchange(
            0,
            env.sampling_interval.unwrap_or(DEFAULT_SAMPLING_INTERVAL),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    });
}

/// 当前进程级探测级别。
pub fn level() -> LeakDetectionLevel {
    ensure_initialized();
    LeakDetectionLevel::from_u8(LEVEL.load(Ordering::Acquire))
}

/// 覆盖进程级探测级别。
pub fn set_level(level: LeakDetectionLevel) {
    LEVEL.store(level.to_u8(), Ordering::Release);
}

/// 当前进程级访问记录上限。
pub fn target_records() -> usize {
    ensure_initialized();
    TARGET_RECORDS.load(Ordering::Acquire).max(1)
}

/// 覆盖访问记录上限；0 按 1 处理。
pub fn set_target_records(records: usize) {
    TARGET_RECORDS.store(records.max(1), Ordering::Release);
}

/// 当前进程级采样间隔。
pub fn sampling_interval() -> usize {
    ensure_initialized();
    SAMPLING_INTERVAL.load(Ordering::Acquire).max(1)
}

/// 覆盖采样间隔；0 按 1 处理。
pub fn set_sampling_interval(interval: usize) {
    SAMPLING_INTERVAL.store(interval.max(1), Ordering::Release);
}

/// 私有探测器的配置；`None` 字段在每次读取时跟随进程级设置。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeakDetectorConfig {
    pub level: Option<LeakDetectionLevel>,
    pub target_records: Option<usize>,
    pub sampling_interval: Option<usize>,
}

impl LeakDetectorConfig {
    /// 固定级别、其余跟随进程级设置的配置。
    pub fn with_level(level: LeakDetectionLevel) -> Self {
        Self {
            level: Some(level),
            ..Self::default()
        }
    }

    pub fn with_target_records(mut self, records: usize) -> Self {
        self.target_records = Some(records.max(1));
        self
    }

    pub fn with_sampling_interval(mut self, interval: usize) -> Self {
        self.sampling_interval = Some(interval.max(1));
        self
    }

    pub(crate) fn effective_level(&self) -> LeakDetectionLevel {
        self.level.unwrap_or_else(level)
    }

    pub(crate) fn effective_target_records(&self) -> usize {
        self.target_records.unwrap_or_else(target_records).max(1)
    }

    pub(crate) fn effective_sampling_interval(&self) -> usize {
        self.sampling_interval.unwrap_or_else(sampling_interval).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn env_settings_parse_all_keys() {
        let settings = EnvSettings::from_lookup(lookup(&[
            (ENV_LEVEL, "PARANOID"),
            (ENV_TARGET_RECORDS, "8"),
            (ENV_SAMPLING_INTERVAL, "16"),
        ]));
        assert_eq!(settings.level, Some(LeakDetectionLevel::Paranoid));
        assert_eq!(settings.target_records, Some(8));
        assert_eq!(settings.sampling_interval, Some(16));
    }

    #[test]
    fn env_settings_ignore_invalid_values() {
        let settings = EnvSettings::from_lookup(lookup(&[
            (ENV_LEVEL, "verbose"),
            (ENV_TARGET_RECORDS, "0"),
            (ENV_SAMPLING_INTERVAL, "many"),
        ]));
        assert_eq!(settings, EnvSettings::default());
    }

    #[test]
    fn levels_are_ordered_by_cost() {
        assert!(LeakDetectionLevel::Disabled < LeakDetectionLevel::Simple);
        assert!(!LeakDetectionLevel::Simple.tracks_every_allocation());
        assert!(LeakDetectionLevel::Advanced.tracks_every_allocation());
        assert!(LeakDetectionLevel::Paranoid.records_access());
    }

    #[test]
    fn detector_config_deserializes_from_json() {
        let config: LeakDetectorConfig =
            serde_json::from_str(r#"{"level":"advanced","target_records":2}"#).expect("json");
        assert_eq!(config.level, Some(LeakDetectionLevel::Advanced));
        assert_eq!(config.effective_target_records(), 2);
        assert_eq!(config.sampling_interval, None);
    }
}

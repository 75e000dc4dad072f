//! 内存压力监视（MemoryMonitor）
//!
//! 周期采样进程常驻内存，超过阈值时记录告警并计数。
//! 只提供统计与日志，不对发射做任何节流。
//!
use crate::task::PeriodicTask;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

const PROC_STATUS_PATH: &str = "/proc/self/status";

/// 内存监视配置
#[derive(Debug, Clone)]
pub struct MemoryMonitorConfig {
    pub enabled: bool,
    pub interval: Duration,
    /// 常驻内存告警阈值（字节），`None` 表示只采样不告警
    pub threshold_bytes: Option<u64>,
}

impl Default for MemoryMonitorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: Duration::from_secs(30),
            threshold_bytes: None,
        }
    }
}

/// 内存统计
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MemoryStats {
    pub current_rss_bytes: Option<u64>,
    pub peak_rss_bytes: u64,
    pub samples: u64,
    pub pressure_events: u64,
    pub under_pressure: bool,
    pub last_sample_at: Option<DateTime<Utc>>,
}

pub struct MemoryMonitor {
    config: MemoryMonitorConfig,
    stats: Mutex<MemoryStats>,
    task: Mutex<Option<PeriodicTask>>,
}

impl MemoryMonitor {
    pub fn new(config: MemoryMonitorConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            stats: Mutex::new(MemoryStats::default()),
            task: Mutex::new(None),
        })
    }

    fn stats_mut(&self) -> MutexGuard<'_, MemoryStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 启动周期采样（未启用或已启动时为空操作）
    pub fn start(self: &Arc<Self>) {
        if !self.config.enabled {
            return;
        }

        let mut slot = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return;
        }

        let weak: Weak<Self> = Arc::downgrade(self);
        *slot = Some(PeriodicTask::spawn(self.config.interval, move || {
            let weak = weak.clone();
            async move {
                if let Some(monitor) = weak.upgrade() {
                    monitor.sample();
                }
            }
        }));
        info!(interval_ms = self.config.interval.as_millis() as u64, "memory monitor started");
    }

    pub async fn stop(&self) {
        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task {
            task.stop().await;
            debug!("memory monitor stopped");
        }
    }

    /// 立即采样一次，返回当前常驻内存
    pub fn sample(&self) -> Option<u64> {
        let rss = read_rss_bytes();
        self.record(rss);
        rss
    }

    fn record(&self, rss: Option<u64>) {
        let mut stats = self.stats_mut();
        stats.samples += 1;
        stats.last_sample_at = Some(Utc::now());
        stats.current_rss_bytes = rss;

        let Some(rss) = rss else {
            return;
        };
        stats.peak_rss_bytes = stats.peak_rss_bytes.max(rss);

        let over = self.config.threshold_bytes.is_some_and(|t| rss > t);
        if over {
            stats.pressure_events += 1;
            if !stats.under_pressure {
                warn!(
                    rss_bytes = rss,
                    threshold_bytes = self.config.threshold_bytes,
                    "memory pressure detected"
                );
            }
        } else if stats.under_pressure {
            info!(rss_bytes = rss, "memory pressure relieved");
        }
        stats.under_pressure = over;
    }

    pub fn stats(&self) -> MemoryStats {
        self.stats_mut().clone()
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }
}

fn read_rss_bytes() -> Option<u64> {
    let status = fs::read_to_string(PROC_STATUS_PATH).ok()?;
    let rss = parse_vm_rss(&status);
    if rss.is_none() {
        debug!("Could not read VmRSS from {PROC_STATUS_PATH}");
    }
    rss
}

/// 解析形如 `VmRSS:     1234 kB` 的行
fn parse_vm_rss(status: &str) -> Option<u64> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("VmRSS:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb * 1024)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    fn parses_vm_rss_line() {
        let status = "Name:\tpulse\nVmPeak:\t  9000 kB\nVmRSS:\t    2048 kB\nThreads:\t4\n";
        assert_eq!(parse_vm_rss(status), Some(2048 * 1024));
        assert_eq!(parse_vm_rss("Name:\tpulse\n"), None);
    }

    #[test]
    fn pressure_is_counted_per_sample_over_threshold() {
        let monitor = MemoryMonitor::new(MemoryMonitorConfig {
            enabled: true,
            threshold_bytes: Some(1_000),
            ..Default::default()
        });

        monitor.record(Some(500));
        monitor.record(Some(1_500));
        monitor.record(Some(2_000));
        monitor.record(Some(800));

        let stats = monitor.stats();
        assert_eq!(stats.samples, 4);
        assert_eq!(stats.pressure_events, 2);
        assert_eq!(stats.peak_rss_bytes, 2_000);
        assert_eq!(stats.current_rss_bytes, Some(800));
        assert!(!stats.under_pressure);
    }

    #[test]
    #[traced_test]
    fn entering_pressure_warns_once() {
        let monitor = MemoryMonitor::new(MemoryMonitorConfig {
            enabled: true,
            threshold_bytes: Some(1_000),
            ..Default::default()
        });

        monitor.record(Some(1_500));
        monitor.record(Some(1_800));
        monitor.record(Some(900));

        logs_assert(|lines: &[&str]| {
            match lines.iter().filter(|l| l.contains("memory pressure detected")).count() {
                1 => Ok(()),
                n => Err(format!("expected one pressure warning, got {n}")),
            }
        });
        assert!(logs_contain("memory pressure relieved"));
    }

    #[tokio::test]
    async fn disabled_monitor_never_starts() {
        let monitor = MemoryMonitor::new(MemoryMonitorConfig::default());
        monitor.start();
        monitor.stop().await;
        assert_eq!(monitor.stats().samples, 0);
    }
}

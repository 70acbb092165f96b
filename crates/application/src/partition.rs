//! 分区生命周期管理
//!
//! 消息存储按月分区，这里负责两件事：轮转（保证当前周期的分区
//! 存在）和清理（删除超出保留窗口的分区）。一轮维护 = 先轮转后
//! 清理；轮转失败不阻止清理，各分区的删除相互独立，错误收集后
//! 一并上报。同一实例内通过 try_lock 保证任意时刻至多一轮在跑，
//! 撞上的那次直接跳过，等下一个定时触发。

use crate::clock::Clock;
use crate::store::StoreError;
use domain::{retention_cutoff, PartitionPeriod};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// 存储中一个物理分区
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionInfo {
    /// 物理表名，如 `messages_2025_01`
    pub name: String,
    pub period: PartitionPeriod,
}

/// 分区存储的管理面
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait PartitionStore: Send + Sync {
    /// 当前存在的全部分区
    async fn list_partitions(&self) -> Result<Vec<PartitionInfo>, StoreError>;

    /// 幂等创建：分区已存在时也成功，返回物理表名
    async fn create_partition_if_needed(
        &self,
        period: &PartitionPeriod,
    ) -> Result<String, StoreError>;

    async fn drop_partition(&self, period: &PartitionPeriod) -> Result<(), StoreError>;

    /// 分区占用的字节数，删除前记录用
    async fn table_size(&self, name: &str) -> Result<i64, StoreError>;
}

#[derive(Debug, Error)]
pub enum CycleError {
    #[error("rotate failed for period {period}: {source}")]
    Rotate {
        period: String,
        source: StoreError,
    },
    #[error("drop failed for partition {name}: {source}")]
    Drop { name: String, source: StoreError },
    #[error("partition listing failed: {0}")]
    List(StoreError),
}

/// 一轮维护的结果
#[derive(Debug, Default)]
pub struct CycleReport {
    /// 轮转和清理全部成功
    pub success: bool,
    /// 本轮保证存在的当前分区表名
    pub rotated: Option<String>,
    /// 本轮删除的分区表名
    pub dropped: Vec<String>,
    pub errors: Vec<CycleError>,
    /// 撞上了正在进行的一轮，本次未执行
    pub skipped: bool,
}

/// 分区维护器
pub struct PartitionMaintenance {
    store: Arc<dyn PartitionStore>,
    clock: Arc<dyn Clock>,
    retention_days: u32,
    running: tokio::sync::Mutex<()>,
}

impl PartitionMaintenance {
    pub fn new(store: Arc<dyn PartitionStore>, clock: Arc<dyn Clock>, retention_days: u32) -> Self {
        Self {
            store,
            clock,
            retention_days,
            running: tokio::sync::Mutex::new(()),
        }
    }

    /// 执行一轮维护：轮转 + 清理
    pub async fn run_cycle(&self) -> CycleReport {
        let Ok(_guard) = self.running.try_lock() else {
            warn!("上一轮分区维护尚未结束，本次跳过");
            return CycleReport {
                skipped: true,
                ..Default::default()
            };
        };

        let now = self.clock.now();
        let mut report = CycleReport::default();

        // 轮转：保证当前周期的分区存在
        let current = PartitionPeriod::containing(now);
        match self.store.create_partition_if_needed(&current).await {
            Ok(name) => {
                info!(partition = %name, "当前周期分区已就绪");
                report.rotated = Some(name);
            }
            Err(source) => {
                error!(period = %current.key(), error = %source, "分区轮转失败");
                report.errors.push(CycleError::Rotate {
                    period: current.key(),
                    source,
                });
            }
        }

        // 清理：删除严格早于截止周期的分区，各自独立
        let cutoff = retention_cutoff(now, self.retention_days);
        match self.store.list_partitions().await {
            Ok(partitions) => {
                for partition in partitions {
                    if partition.period >= cutoff {
                        continue;
                    }
                    let size = match self.store.table_size(&partition.name).await {
                        Ok(bytes) => bytes,
                        Err(err) => {
                            warn!(partition = %partition.name, error = %err, "分区大小查询失败");
                            -1
                        }
                    };
                    match self.store.drop_partition(&partition.period).await {
                        Ok(()) => {
                            info!(partition = %partition.name, bytes = size, "过期分区已删除");
                            report.dropped.push(partition.name);
                        }
                        Err(source) => {
                            error!(partition = %partition.name, error = %source, "分区删除失败");
                            report.errors.push(CycleError::Drop {
                                name: partition.name,
                                source,
                            });
                        }
                    }
                }
            }
            Err(source) => {
                error!(error = %source, "分区列表查询失败，本轮清理未执行");
                report.errors.push(CycleError::List(source));
            }
        }

        report.success = report.errors.is_empty();
        report
    }
}

/// 按固定周期驱动维护循环；第一轮立即执行。
/// 配置关闭时不派生任务。
pub fn spawn_partition_scheduler(
    maintenance: Arc<PartitionMaintenance>,
    interval_hours: u64,
    enabled: bool,
) -> Option<JoinHandle<()>> {
    if !enabled {
        info!("分区维护已关闭");
        return None;
    }
    let period = Duration::from_secs(interval_hours * 3600);
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            let report = maintenance.run_cycle().await;
            if report.skipped {
                continue;
            }
            info!(
                success = report.success,
                dropped = report.dropped.len(),
                errors = report.errors.len(),
                "分区维护一轮结束"
            );
        }
    }))
}

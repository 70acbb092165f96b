//! PostgreSQL 分区管理面
//!
//! 分区 DDL 封装在数据库端的 plpgsql 函数里（见迁移），这里只做
//! 调用和结果映射。物理表名形如 `messages_2025_01`，周期从表名
//! 后缀解析。

use crate::db::map_sqlx_err;
use application::{PartitionInfo, PartitionStore, StoreError};
use async_trait::async_trait;
use domain::PartitionPeriod;
use sqlx::PgPool;
use tracing::warn;

const PARTITION_NAME_PREFIX: &str = "messages_";

#[derive(Clone)]
pub struct PgPartitionStore {
    pool: PgPool,
}

impl PgPartitionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn period_from_name(name: &str) -> Option<PartitionPeriod> {
    let suffix = name.strip_prefix(PARTITION_NAME_PREFIX)?;
    PartitionPeriod::parse(suffix).ok()
}

#[async_trait]
impl PartitionStore for PgPartitionStore {
    async fn list_partitions(&self) -> Result<Vec<PartitionInfo>, StoreError> {
        let names: Vec<String> = sqlx::query_scalar("SELECT list_message_partitions()")
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_err)?;

        let mut partitions = Vec::with_capacity(names.len());
        for name in names {
            match period_from_name(&name) {
                Some(period) => partitions.push(PartitionInfo { name, period }),
                // 手工建的表可能不符合命名约定，跳过而不是失败
                None => warn!(partition = %name, "分区表名无法解析周期，跳过"),
            }
        }
        Ok(partitions)
    }

    async fn create_partition_if_needed(
        &self,
        period: &PartitionPeriod,
    ) -> Result<String, StoreError> {
        sqlx::query_scalar("SELECT ensure_message_partition($1)")
            .bind(period.key())
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_err)
    }

    async fn drop_partition(&self, period: &PartitionPeriod) -> Result<(), StoreError> {
        sqlx::query("SELECT drop_message_partition($1)")
            .bind(period.key())
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        Ok(())
    }

    async fn table_size(&self, name: &str) -> Result<i64, StoreError> {
        sqlx::query_scalar("SELECT message_table_size($1)")
            .bind(name)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_err)
    }
}

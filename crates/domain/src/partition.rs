//! 分区周期
//!
//! 消息表按月分区，周期键格式为 `YYYY_MM`。键的字典序与时间序
//! 一致，保留窗口的比较直接用 `Ord` 完成。

use chrono::{DateTime, Datelike, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid period key {key:?}: {reason}")]
pub struct PeriodParseError {
    pub key: String,
    pub reason: &'static str,
}

/// 时间分区周期（年+月）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionPeriod {
    year: i32,
    month: u32,
}

impl PartitionPeriod {
    pub fn new(year: i32, month: u32) -> Result<Self, PeriodParseError> {
        if !(1..=12).contains(&month) {
            return Err(PeriodParseError {
                key: format!("{year}_{month}"),
                reason: "month out of range",
            });
        }
        Ok(Self { year, month })
    }

    /// 包含给定时刻的周期
    pub fn containing(at: DateTime<Utc>) -> Self {
        Self {
            year: at.year(),
            month: at.month(),
        }
    }

    /// 周期键，如 `2025_01`
    pub fn key(&self) -> String {
        format!("{:04}_{:02}", self.year, self.month)
    }

    /// 解析 `YYYY_MM` 格式的周期键
    pub fn parse(key: &str) -> Result<Self, PeriodParseError> {
        let invalid = |reason| PeriodParseError {
            key: key.to_string(),
            reason,
        };
        let (year, month) = key.split_once('_').ok_or_else(|| invalid("missing '_'"))?;
        if year.len() != 4 || month.len() != 2 {
            return Err(invalid("expected YYYY_MM"));
        }
        let year: i32 = year.parse().map_err(|_| invalid("year not numeric"))?;
        let month: u32 = month.parse().map_err(|_| invalid("month not numeric"))?;
        Self::new(year, month)
    }

    /// 下一个周期（跨年进位）
    pub fn next(&self) -> Self {
        if self.month == 12 {
            Self {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Self {
                year: self.year,
                month: self.month + 1,
            }
        }
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u32 {
        self.month
    }
}

impl fmt::Display for PartitionPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// 保留截止周期：包含 `now - retention_days` 的周期。
/// 严格早于该周期的分区在清理时被删除；截止周期本身保留。
pub fn retention_cutoff(now: DateTime<Utc>, retention_days: u32) -> PartitionPeriod {
    PartitionPeriod::containing(now - Duration::days(i64::from(retention_days)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn key_is_zero_padded() {
        let period = PartitionPeriod::new(2025, 1).unwrap();
        assert_eq!(period.key(), "2025_01");
    }

    #[test]
    fn parse_round_trips() {
        let period = PartitionPeriod::parse("2024_11").unwrap();
        assert_eq!(period, PartitionPeriod::new(2024, 11).unwrap());
        assert_eq!(period.key(), "2024_11");
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(PartitionPeriod::parse("2024-11").is_err());
        assert!(PartitionPeriod::parse("202411").is_err());
        assert!(PartitionPeriod::parse("2024_13").is_err());
        assert!(PartitionPeriod::parse("24_01").is_err());
    }

    #[test]
    fn ordering_matches_chronology() {
        let a = PartitionPeriod::parse("2024_11").unwrap();
        let b = PartitionPeriod::parse("2024_12").unwrap();
        let c = PartitionPeriod::parse("2025_01").unwrap();
        assert!(a < b && b < c);
        // 键的字典序与 Ord 一致
        assert!(a.key() < b.key() && b.key() < c.key());
    }

    #[test]
    fn next_carries_over_year() {
        let dec = PartitionPeriod::new(2024, 12).unwrap();
        assert_eq!(dec.next(), PartitionPeriod::new(2025, 1).unwrap());
    }

    #[test]
    fn cutoff_keeps_current_period_across_month_boundary() {
        // 2025-01-20，保留7天 → 截止周期 2025_01
        let now = Utc.with_ymd_and_hms(2025, 1, 20, 12, 0, 0).unwrap();
        let cutoff = retention_cutoff(now, 7);
        assert_eq!(cutoff.key(), "2025_01");

        // 月初时截止落回上个月
        let early = Utc.with_ymd_and_hms(2025, 1, 3, 0, 0, 0).unwrap();
        assert_eq!(retention_cutoff(early, 7).key(), "2024_12");
    }
}

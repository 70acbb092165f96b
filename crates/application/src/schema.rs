//! 信封模式清单
//!
//! 编解码器在模式清单加载完成之前拒绝所有输入（`SchemaUnavailable`）。
//! 清单在进程启动时由受监督的后台任务异步加载一次；加载失败不致命，
//! 任务带退避重试并通过日志上报，编解码器保持拒绝状态直到成功。

use domain::EnvelopeKind;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// 内置清单，`ENVELOPE_SCHEMA_PATH` 未设置时使用
const DEFAULT_MANIFEST: &str = include_str!("../schema/envelope.json");

/// 模式清单：支持的版本、启用的判别器、负载上限
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaManifest {
    pub schema: String,
    pub versions: Vec<u32>,
    pub kinds: Vec<String>,
    pub max_payload_bytes: usize,
}

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("failed to read schema manifest: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse schema manifest: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("schema manifest invalid: {0}")]
    Invalid(&'static str),
}

impl SchemaManifest {
    /// 解析并校验一份清单
    pub fn from_json(raw: &str) -> Result<Self, SchemaError> {
        let manifest: SchemaManifest = serde_json::from_str(raw)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// 内置清单，测试和本地运行用
    pub fn builtin() -> Self {
        Self::from_json(DEFAULT_MANIFEST).expect("builtin schema manifest must be valid")
    }

    fn validate(&self) -> Result<(), SchemaError> {
        if self.versions.is_empty() {
            return Err(SchemaError::Invalid("no supported versions"));
        }
        if self.kinds.is_empty() {
            return Err(SchemaError::Invalid("no enabled kinds"));
        }
        if self.max_payload_bytes == 0 {
            return Err(SchemaError::Invalid("max_payload_bytes must be non-zero"));
        }
        // 清单里的判别器必须是封闭枚举的成员
        for kind in &self.kinds {
            if EnvelopeKind::from_wire(kind).is_none() {
                return Err(SchemaError::Invalid("manifest enables an unknown kind"));
            }
        }
        Ok(())
    }

    pub fn supports_version(&self, version: u32) -> bool {
        self.versions.contains(&version)
    }

    pub fn kind_enabled(&self, kind: &str) -> bool {
        self.kinds.iter().any(|k| k == kind)
    }
}

/// 模式加载器：受监督的一次性后台加载任务
pub struct SchemaLoader {
    cell: Arc<OnceCell<SchemaManifest>>,
    path: Option<PathBuf>,
}

impl SchemaLoader {
    pub fn new(cell: Arc<OnceCell<SchemaManifest>>, path: Option<PathBuf>) -> Self {
        Self { cell, path }
    }

    /// 启动加载任务。失败时按退避重试（1s 起，封顶 30s），
    /// 每次失败都记录日志，成功后任务退出。
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut backoff = Duration::from_secs(1);
            loop {
                match self.load_once().await {
                    Ok(manifest) => {
                        let schema = manifest.schema.clone();
                        if self.cell.set(manifest).is_err() {
                            warn!("schema manifest already loaded, keeping the existing one");
                        } else {
                            info!(schema = %schema, "信封模式清单加载完成");
                        }
                        return;
                    }
                    Err(err) => {
                        error!(error = %err, retry_in = ?backoff, "信封模式清单加载失败，稍后重试");
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(Duration::from_secs(30));
                    }
                }
            }
        })
    }

    async fn load_once(&self) -> Result<SchemaManifest, SchemaError> {
        let raw = match &self.path {
            Some(path) => tokio::fs::read_to_string(path).await?,
            None => DEFAULT_MANIFEST.to_string(),
        };
        SchemaManifest::from_json(&raw)
    }
}

//! CodeSandbox port - 呼び出し側が渡したコードの隔離実行
//!
//! # 実装
//! - **QuickJsSandbox**: ジョブごとに新しい QuickJS runtime を作る

use async_trait::async_trait;

use crate::domain::ExecutionError;

/// Evaluates caller-supplied code against a job's input.
///
/// Synchronous throws and asynchronous rejections come back through the same
/// `ExecutionError`. User code is never retried.
#[async_trait]
pub trait CodeSandbox: Send + Sync {
    async fn evaluate(
        &self,
        source_lines: &[String],
        input: &[serde_json::Value],
    ) -> Result<serde_json::Value, ExecutionError>;
}

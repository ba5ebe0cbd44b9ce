//! DecisionPolicy port - コードを持たないジョブの結果を決める
//!
//! # 実装
//! - **ThresholdPolicy**: 先頭入力としきい値の比較
//! - **RandomPolicy**: 乱数で結果と成否を決める（負荷試験用）
//!
//! テストでは決定的な fake を差し込みます。

use crate::domain::{ExecutionError, Job};

/// Decides the computed value (or failure) for a job without embedded code.
pub trait DecisionPolicy: Send + Sync {
    fn decide(&self, job: &Job) -> Result<serde_json::Value, ExecutionError>;
}

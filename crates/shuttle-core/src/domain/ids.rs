//! Domain identifiers (strongly-typed IDs).
//!
//! ジョブ ID とタスク ID はブローカーから文字列として届くため、
//! 中身は `String` のまま保持し、Phantom type で型だけを分けます。
//!
//! ## Phantom Type パターン
//! `Id<T>` というジェネリック型で共通実装を提供しつつ、
//! `T` は実行時には使わない（PhantomData）マーカー型として、
//! コンパイル時に JobId と TaskId の取り違えを防ぎます。

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::marker::PhantomData;
use ulid::Ulid;

/// IdMarker は各 ID 型のマーカー trait
///
/// `generate()` で使うプレフィックス（"job-", "task-"）を提供します。
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// ジェネリック ID 型
///
/// ```ignore
/// let job_id = JobId::new("job-1");
/// let task_id = TaskId::new("task-1");
/// // job_id と task_id は異なる型なので、混同できない
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Id<T: IdMarker> {
    value: String,
    _marker: PhantomData<T>,
}

// 手書き: derive だとマーカー型に余計な bound が付く
impl<T: IdMarker> Serialize for Id<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.value)
    }
}

impl<'de, T: IdMarker> Deserialize<'de> for Id<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self::new)
    }
}

impl<T: IdMarker> Id<T> {
    /// Wrap an identifier received from the outside (broker payload, store key).
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            _marker: PhantomData,
        }
    }

    /// 新しい ID を ULID から生成（テストやローカル投入用）
    pub fn generate() -> Self {
        Self::new(format!("{}{}", T::prefix(), Ulid::new().to_string().to_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }
}

impl<T: IdMarker> From<&str> for Id<T> {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl<T: IdMarker> From<String> for Id<T> {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

// ========================================
// マーカー型の定義
// ========================================

/// Job のマーカー型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Job {}

impl IdMarker for Job {
    fn prefix() -> &'static str {
        "job-"
    }
}

/// Task のマーカー型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Task {}

impl IdMarker for Task {
    fn prefix() -> &'static str {
        "task-"
    }
}

/// Identifier of a pipeline run; the key that stop requests are watched on.
pub type JobId = Id<Job>;

/// Identifier of one delivered unit of work inside a job.
pub type TaskId = Id<Task>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_carry_their_prefix() {
        let job = JobId::generate();
        let task = TaskId::generate();

        assert!(job.as_str().starts_with("job-"));
        assert!(task.as_str().starts_with("task-"));
        assert_ne!(JobId::generate(), job);

        // let _: JobId = task; // <- does not compile
    }

    #[test]
    fn ids_serialize_as_plain_strings() {
        let job_id = JobId::new("main-pipeline-1");

        let serialized = serde_json::to_string(&job_id).unwrap();
        assert_eq!(serialized, "\"main-pipeline-1\"");

        let back: JobId = serde_json::from_str(&serialized).unwrap();
        assert_eq!(back, job_id);
    }

    #[test]
    fn phantom_data_does_not_consume_memory() {
        use std::mem::size_of;
        assert_eq!(size_of::<JobId>(), size_of::<String>());
        assert_eq!(size_of::<TaskId>(), size_of::<String>());
    }
}

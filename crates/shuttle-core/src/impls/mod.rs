//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **InMemoryStateStore**: 開発・テスト用の協調ストア（呼び出し記録と障害注入つき）
//! - **InMemoryJobQueue**: 開発・テスト用のキュー（lock 更新と stalled 検知つき）
//! - **EtcdStateStore**: etcd v3 JSON gateway
//! - **QuickJsSandbox**: caller code の隔離実行
//! - **ThresholdPolicy / RandomPolicy**: コードを持たないジョブの結果決定

pub mod etcd;
pub mod inmem_queue;
pub mod inmem_store;
pub mod policy;
pub mod quickjs;

// 主要な型を再エクスポート
pub use self::etcd::EtcdStateStore;
pub use self::inmem_queue::{InMemoryJobQueue, QueueCounts};
pub use self::inmem_store::{InMemoryStateStore, StoreCall};
pub use self::policy::{RandomPolicy, ThresholdPolicy};
pub use self::quickjs::QuickJsSandbox;

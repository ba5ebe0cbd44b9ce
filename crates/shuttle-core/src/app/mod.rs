//! App - アプリケーション層
//!
//! このモジュールは、ports を組み合わせてアプリケーションロジックを実装します。
//!
//! # 主要コンポーネント
//! - **WorkerBuilder**: ワーカーの構築とワイヤリング
//! - **JobLifecycle**: 1 ジョブの状態機械（start → resolve）
//! - **CompletionGuard**: timer と停止通知の競合を 1 回に絞る
//! - **WatchCoordinator**: ジョブごとの停止 watch の登録・解除
//! - **DiscoveryReporter**: 生存・担当ジョブの公開
//! - **WorkerLoop**: キューからの取り出しと同時実行数の制御

pub mod builder;
pub mod discovery;
pub mod guard;
pub mod lifecycle;
pub mod watch;
pub mod worker_loop;

// 主要な型を再エクスポート
pub use self::builder::{BuildError, Worker, WorkerBuilder};
pub use self::discovery::DiscoveryReporter;
pub use self::guard::CompletionGuard;
pub use self::lifecycle::{JobHandle, JobLifecycle};
pub use self::watch::{EventCallback, WatchCoordinator};
pub use self::worker_loop::{RunSummary, WorkerLoop};

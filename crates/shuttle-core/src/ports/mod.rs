//! Ports - 抽象化レイヤー
//!
//! このモジュールは Hexagonal Architecture の「ポート」を定義します。
//! 各 trait は外部システム（協調ストア、キューブローカー、sandbox）への
//! インターフェースを提供し、実装の詳細を隠蔽します。

pub mod decision;
pub mod job_queue;
pub mod sandbox;
pub mod state_store;

pub use self::decision::DecisionPolicy;
pub use self::job_queue::{JobLease, JobQueue, JobResult};
pub use self::sandbox::CodeSandbox;
pub use self::state_store::{JobWatch, StateStore};

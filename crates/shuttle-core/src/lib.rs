//! shuttle-core
//!
//! Worker-side job execution: pull a job from the queue, run it (optionally
//! evaluating caller-supplied code), report the outcome to the coordination
//! store, and resolve it exactly once even when a remote stop races the
//! local completion.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, job, state, outcome, discovery, errors）
//! - **ports**: 抽象化レイヤー（StateStore, JobQueue, CodeSandbox, DecisionPolicy）
//! - **app**: アプリケーションロジック（lifecycle, watch, discovery, worker_loop, builder）
//! - **impls**: 実装（in-memory store / queue, etcd, QuickJS, policies）
//! - **config**: ワーカー設定

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod ports;

pub use app::{BuildError, JobHandle, JobLifecycle, RunSummary, Worker, WorkerBuilder};
pub use config::WorkerConfig;
pub use domain::{Job, JobId, JobState, TaskId, WorkerError};

//! QuickJsSandbox - caller code を QuickJS で評価する
//!
//! # 隔離
//! - 評価ごとに新しい `rquickjs::Runtime` / `Context` を作る（ジョブ間で状態を共有しない）
//! - QuickJS 本体には I/O がないので、コードが触れるのは入力値だけ
//! - memory limit と interrupt handler で暴走を止める
//!
//! # コードの形
//! ソース行を改行で連結したものが「関数として評価される式」であること。
//! ```text
//! ["async (input) => {", "  return input[0] * 2;", "}"]
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rquickjs::{CatchResultExt, CaughtError, Context, Ctx, Runtime, Value};

use crate::config::SandboxConfig;
use crate::domain::ExecutionError;
use crate::ports::CodeSandbox;

pub struct QuickJsSandbox {
    config: SandboxConfig,
}

impl QuickJsSandbox {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }
}

impl Default for QuickJsSandbox {
    fn default() -> Self {
        Self::new(SandboxConfig::default())
    }
}

/// Sets the abort flag when the evaluating future is dropped.
///
/// The blocking evaluation keeps running on its thread after the future is
/// gone (for example when the job was stopped); the interrupt handler sees
/// the flag and unwinds the script.
struct AbortOnDrop(Arc<AtomicBool>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl CodeSandbox for QuickJsSandbox {
    async fn evaluate(
        &self,
        source_lines: &[String],
        input: &[serde_json::Value],
    ) -> Result<serde_json::Value, ExecutionError> {
        let source = source_lines.join("\n");
        let input = serde_json::to_string(input)
            .map_err(|e| ExecutionError::new(format!("input is not serializable: {e}")))?;

        let aborted = Arc::new(AtomicBool::new(false));
        let _guard = AbortOnDrop(Arc::clone(&aborted));
        let config = self.config.clone();

        tokio::task::spawn_blocking(move || run_isolated(&config, &source, &input, aborted))
            .await
            .map_err(|e| ExecutionError::new(format!("sandbox thread failed: {e}")))?
    }
}

fn run_isolated(
    config: &SandboxConfig,
    source: &str,
    input_json: &str,
    aborted: Arc<AtomicBool>,
) -> Result<serde_json::Value, ExecutionError> {
    let runtime =
        Runtime::new().map_err(|e| ExecutionError::new(format!("failed to create JS runtime: {e}")))?;
    if let Some(limit) = config.memory_limit {
        runtime.set_memory_limit(limit);
    }

    let deadline = config.timeout.map(|timeout| Instant::now() + timeout);
    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let aborted = Arc::clone(&aborted);
        let interrupted = Arc::clone(&interrupted);
        runtime.set_interrupt_handler(Some(Box::new(move || {
            let stop = aborted.load(Ordering::SeqCst)
                || deadline.is_some_and(|deadline| Instant::now() >= deadline);
            if stop {
                interrupted.store(true, Ordering::SeqCst);
            }
            stop
        })));
    }

    let context = Context::full(&runtime)
        .map_err(|e| ExecutionError::new(format!("failed to create JS context: {e}")))?;

    let result = context.with(|ctx| call_user_code(&ctx, source, input_json));

    // Interrupts surface as a generic "interrupted" exception; say why instead.
    match result {
        Err(_) if interrupted.load(Ordering::SeqCst) => {
            if aborted.load(Ordering::SeqCst) {
                Err(ExecutionError::new("evaluation aborted"))
            } else {
                Err(ExecutionError::new(format!(
                    "evaluation timed out after {:?}",
                    config.timeout.unwrap_or(Duration::ZERO)
                )))
            }
        }
        other => other,
    }
}

fn call_user_code<'js>(
    ctx: &Ctx<'js>,
    source: &str,
    input_json: &str,
) -> Result<serde_json::Value, ExecutionError> {
    let value: Value<'js> = ctx
        .eval(format!("({source}\n)"))
        .catch(ctx)
        .map_err(convert_caught_error)?;
    let function = value
        .into_function()
        .ok_or_else(|| ExecutionError::new("code does not evaluate to a function"))?;

    let input: Value = ctx
        .json_parse(input_json)
        .catch(ctx)
        .map_err(convert_caught_error)?;

    let returned: Value = function
        .call((input,))
        .catch(ctx)
        .map_err(convert_caught_error)?;

    let settled = match returned.clone().into_promise() {
        Some(promise) => promise
            .finish::<Value>()
            .catch(ctx)
            .map_err(convert_caught_error)?,
        None => returned,
    };

    to_json(ctx, settled)
}

fn to_json<'js>(ctx: &Ctx<'js>, value: Value<'js>) -> Result<serde_json::Value, ExecutionError> {
    let encoded = ctx
        .json_stringify(value)
        .catch(ctx)
        .map_err(convert_caught_error)?;
    let Some(encoded) = encoded else {
        // undefined / functions have no JSON form
        return Ok(serde_json::Value::Null);
    };
    let text = encoded
        .to_string()
        .map_err(|e| ExecutionError::new(format!("result is not a valid string: {e}")))?;
    serde_json::from_str(&text)
        .map_err(|e| ExecutionError::new(format!("result is not valid JSON: {e}")))
}

fn convert_caught_error(caught: CaughtError<'_>) -> ExecutionError {
    match caught {
        CaughtError::Exception(exc) => {
            ExecutionError::new(exc.message().unwrap_or_else(|| "unknown exception".to_string()))
        }
        CaughtError::Value(val) => match val.as_string().and_then(|s| s.to_string().ok()) {
            Some(message) => ExecutionError::new(message),
            None => ExecutionError::new(format!("JS threw value: {val:?}")),
        },
        CaughtError::Error(err) => ExecutionError::new(err.to_string()),
    }
}

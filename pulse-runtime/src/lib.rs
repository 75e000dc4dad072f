//! 事件驱动执行运行时
//!
//! 在 `pulse-core` 的基础组件之上组装出运行时门面 [`Runtime`]：
//! - 发射：同步发射立即返回，异步发射等待入队结果；可选批量缓冲
//! - 处理：按优先级出队，调度到匹配的处理器，成功确认、失败否认
//! - 确认跟踪：超时只记录告警并丢弃，不做重试
//! - 多租户：`for_tenant` 派生配置独立的运行时
//!
//! # 示例
//! ```no_run
//! use pulse_core::handler::handler_fn;
//! use pulse_runtime::{EmitOptions, Runtime, RuntimeConfig};
//! use serde_json::json;
//!
//! # async fn demo() -> pulse_core::error::RuntimeResult<()> {
//! let runtime = Runtime::new(RuntimeConfig::default());
//! runtime.on("order.placed", handler_fn("audit", |event| async move {
//!     tracing::info!(event_id = event.id(), "order placed");
//!     Ok(())
//! }));
//!
//! runtime.emit_async("order.placed", json!({ "id": 1 }), EmitOptions::default()).await;
//! let stats = runtime.process().await?;
//! assert_eq!(stats.processed, 1);
//! runtime.cleanup().await;
//! # Ok(())
//! # }
//! ```

pub mod ack;
pub mod batch;
pub mod config;
pub mod context;
pub mod dispatcher;
mod enqueue;
pub mod middleware;
pub mod options;
pub mod runtime;
pub mod stats;

pub use batch::BatchOptions;
pub use config::{BatchingConfig, RuntimeConfig};
pub use context::ExecutionContext;
pub use dispatcher::{DispatchOutcome, DispatchRecord, WILDCARD};
pub use middleware::{Middleware, TimeoutMiddleware, TracingMiddleware};
pub use options::{EmitFailure, EmitOptions, EmitResult};
pub use runtime::Runtime;
pub use stats::{ProcessStats, RuntimeStats};

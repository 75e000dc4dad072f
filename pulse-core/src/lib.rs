//! 事件运行时核心库（pulse-core）
//!
//! 提供事件驱动执行运行时所依赖的模型与协作方协议：
//! - 事件模型（`event`）：不可变事件、元数据、因果链与强类型载荷
//! - 持久化优先级队列（`queue`）与可插拔持久化后端（`persist`）
//! - 追加式事件存储与重放（`store`）
//! - 事件处理器协议（`handler`）
//! - 惰性事件流（`stream`）与内存监视（`memory`）
//! - 统一错误类型（`error`）
//!
//! 本 crate 仅提供协议与内存参考实现，确认跟踪、批量与运行时门面
//! 位于 `pulse-runtime`。
//!
pub mod error;
pub mod event;
pub mod handler;
pub mod memory;
pub mod persist;
pub mod queue;
pub mod store;
pub mod stream;
pub mod task;

// 允许在本 crate 内部通过 ::pulse_core 进行自引用，
// 以便过程宏在本 crate 的单元测试中也能解析到 ::pulse_core 路径。
extern crate self as pulse_core;

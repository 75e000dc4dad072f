//! 事件处理器（EventHandler）
//!
//! 定义消费某一类型事件的处理逻辑；处理器以 `Arc` 注册，
//! 注销时按 `Arc` 指向的实例比较身份。
//!
use crate::event::Event;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;

/// 事件处理器
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// 处理器名称（用于日志与失败归因）
    fn handler_name(&self) -> &str;

    async fn handle(&self, event: &Event) -> anyhow::Result<()>;
}

/// 判断两个处理器引用是否指向同一实例
pub fn same_handler(a: &Arc<dyn EventHandler>, b: &Arc<dyn EventHandler>) -> bool {
    // 只比较数据指针，忽略 vtable
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// 以闭包实现的处理器
pub struct FnHandler<F> {
    name: String,
    f: F,
}

/// 由闭包构建处理器，闭包接收事件的克隆
pub fn handler_fn<F, Fut>(name: impl Into<String>, f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnHandler {
        name: name.into(),
        f,
    })
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    fn handler_name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        (self.f)(event.clone()).await
    }
}

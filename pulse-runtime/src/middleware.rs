//! 处理器中间件
//!
//! 中间件在注册时包装处理器，列表中的第一个位于最外层。
//!
use async_trait::async_trait;
use pulse_core::event::Event;
use pulse_core::handler::EventHandler;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub trait Middleware: Send + Sync {
    fn name(&self) -> &str;

    fn wrap(&self, handler: Arc<dyn EventHandler>) -> Arc<dyn EventHandler>;
}

/// 按顺序套用中间件，第一个位于最外层
pub fn apply(
    middleware: &[Arc<dyn Middleware>],
    handler: Arc<dyn EventHandler>,
) -> Arc<dyn EventHandler> {
    middleware.iter().rev().fold(handler, |inner, m| m.wrap(inner))
}

/// 记录每次处理的耗时与结果
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMiddleware;

impl Middleware for TracingMiddleware {
    fn name(&self) -> &str {
        "tracing"
    }

    fn wrap(&self, handler: Arc<dyn EventHandler>) -> Arc<dyn EventHandler> {
        Arc::new(Traced { inner: handler })
    }
}

struct Traced {
    inner: Arc<dyn EventHandler>,
}

#[async_trait]
impl EventHandler for Traced {
    fn handler_name(&self) -> &str {
        self.inner.handler_name()
    }

    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        let started = Instant::now();
        let result = self.inner.handle(event).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(()) => debug!(
                handler = self.inner.handler_name(),
                event_id = event.id(),
                event_type = event.event_type(),
                elapsed_ms,
                "handler finished"
            ),
            Err(err) => warn!(
                handler = self.inner.handler_name(),
                event_id = event.id(),
                event_type = event.event_type(),
                elapsed_ms,
                error = %err,
                "handler failed"
            ),
        }
        result
    }
}

/// 为每次处理设置超时，超时视为处理失败
#[derive(Debug, Clone, Copy)]
pub struct TimeoutMiddleware {
    timeout: Duration,
}

impl TimeoutMiddleware {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Middleware for TimeoutMiddleware {
    fn name(&self) -> &str {
        "timeout"
    }

    fn wrap(&self, handler: Arc<dyn EventHandler>) -> Arc<dyn EventHandler> {
        Arc::new(TimeBound {
            inner: handler,
            timeout: self.timeout,
        })
    }
}

struct TimeBound {
    inner: Arc<dyn EventHandler>,
    timeout: Duration,
}

#[async_trait]
impl EventHandler for TimeBound {
    fn handler_name(&self) -> &str {
        self.inner.handler_name()
    }

    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        match tokio::time::timeout(self.timeout, self.inner.handle(event)).await {
            Ok(result) => result,
            Err(_) => anyhow::bail!(
                "handler {} timed out after {}ms",
                self.inner.handler_name(),
                self.timeout.as_millis()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_core::handler::handler_fn;
    use serde_json::json;
    use std::sync::Mutex;

    struct Recording {
        label: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    struct Recorded {
        label: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        inner: Arc<dyn EventHandler>,
    }

    impl Middleware for Recording {
        fn name(&self) -> &str {
            self.label
        }

        fn wrap(&self, handler: Arc<dyn EventHandler>) -> Arc<dyn EventHandler> {
            Arc::new(Recorded {
                label: self.label,
                log: self.log.clone(),
                inner: handler,
            })
        }
    }

    #[async_trait]
    impl EventHandler for Recorded {
        fn handler_name(&self) -> &str {
            self.inner.handler_name()
        }

        async fn handle(&self, event: &Event) -> anyhow::Result<()> {
            self.log.lock().unwrap().push(format!("{}:before", self.label));
            let result = self.inner.handle(event).await;
            self.log.lock().unwrap().push(format!("{}:after", self.label));
            result
        }
    }

    #[tokio::test]
    async fn first_middleware_is_outermost() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain: Vec<Arc<dyn Middleware>> = vec![
            Arc::new(Recording {
                label: "outer",
                log: log.clone(),
            }),
            Arc::new(Recording {
                label: "inner",
                log: log.clone(),
            }),
        ];
        let handler = apply(&chain, handler_fn("noop", |_| async { Ok(()) }));

        handler.handle(&Event::new("t", json!({}))).await.unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec!["outer:before", "inner:before", "inner:after", "outer:after"]
        );
        assert_eq!(handler.handler_name(), "noop");
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_turns_slow_handler_into_failure() {
        let slow = handler_fn("slow", |_| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        });
        let handler = TimeoutMiddleware::new(Duration::from_millis(100)).wrap(slow);

        let err = handler.handle(&Event::new("t", json!({}))).await.unwrap_err();
        assert!(err.to_string().contains("timed out after 100ms"));
    }

    #[tokio::test]
    async fn tracing_passes_result_through() {
        let failing = handler_fn("failing", |_| async { anyhow::bail!("nope") });
        let handler = TracingMiddleware.wrap(failing);

        let err = handler.handle(&Event::new("t", json!({}))).await.unwrap_err();
        assert_eq!(err.to_string(), "nope");
    }
}

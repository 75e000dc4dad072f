//! 惰性事件流（StreamManager）
//!
//! 将任意 `Stream` 包装为按需拉取的 `EventStream`，独立于队列运行；
//! 管理器清理后，所有由它创建的流在下一次拉取时结束。
//!
use futures_core::Stream;
use futures_core::stream::BoxStream;
use futures_util::StreamExt;
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::task::{Context, Poll};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

/// 流统计
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StreamStats {
    pub created: u64,
    pub active: usize,
    pub closed: bool,
}

#[derive(Default)]
pub struct StreamManager {
    token: CancellationToken,
    created: AtomicU64,
    active: Arc<AtomicUsize>,
}

impl StreamManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 包装一个惰性数据源；数据源只在被拉取时推进
    pub fn create_stream<S>(&self, source: S) -> EventStream<S::Item>
    where
        S: Stream + Send + 'static,
    {
        self.created.fetch_add(1, Ordering::Relaxed);
        self.active.fetch_add(1, Ordering::Relaxed);

        EventStream {
            inner: source.boxed(),
            cancelled: Box::pin(self.token.clone().cancelled_owned()),
            active: Some(self.active.clone()),
        }
    }

    pub fn stats(&self) -> StreamStats {
        StreamStats {
            created: self.created.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
            closed: self.token.is_cancelled(),
        }
    }

    /// 结束所有已创建的流
    pub async fn cleanup(&self) {
        self.token.cancel();
    }
}

/// 由 `StreamManager` 创建的惰性流
pub struct EventStream<T> {
    inner: BoxStream<'static, T>,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
    active: Option<Arc<AtomicUsize>>,
}

impl<T> EventStream<T> {
    fn finish(&mut self) {
        if let Some(active) = self.active.take() {
            active.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

impl<T> Stream for EventStream<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        let this = self.get_mut();
        if this.active.is_none() {
            return Poll::Ready(None);
        }

        if this.cancelled.as_mut().poll(cx).is_ready() {
            this.finish();
            return Poll::Ready(None);
        }

        match this.inner.poll_next_unpin(cx) {
            Poll::Ready(None) => {
                this.finish();
                Poll::Ready(None)
            }
            other => other,
        }
    }
}

impl<T> Drop for EventStream<T> {
    fn drop(&mut self) {
        self.finish();
    }
}

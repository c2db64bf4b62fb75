//! 频道订阅
//!
//! 每个订阅独占一个分区读取流与一个取消信号，在独立的 tokio task 中运行。

use courier_ports::{Close, Handler};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::client::PartitionStream;

/// 一个频道订阅的控制句柄
#[derive(Debug, Clone)]
pub struct Subscription {
    cancel: CancellationToken,
    done: CancellationToken,
}

impl Subscription {
    fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            done: CancellationToken::new(),
        }
    }

    /// 没有关联任何消费循环的句柄
    pub fn inert() -> Self {
        let subscription = Self::new();
        subscription.cancel.cancel();
        subscription.done.cancel();
        subscription
    }

    /// 请求停止消费循环，可重复调用
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// 消费循环是否仍在运行
    pub fn is_active(&self) -> bool {
        !self.done.is_cancelled()
    }

    /// 等待消费循环释放分区流并退出
    pub async fn closed(&self) {
        self.done.cancelled().await;
    }

    /// 转换为宿主框架的取消句柄
    pub fn into_close(self) -> Close {
        if !self.is_active() {
            return Close::noop();
        }
        let cancel = self.cancel;
        Close::new(move || cancel.cancel())
    }

    /// 在 runtime 上启动消费循环
    pub(crate) fn spawn(
        runtime: &tokio::runtime::Handle,
        topic: String,
        stream: Box<dyn PartitionStream>,
        handler: Handler,
    ) -> Self {
        let subscription = Self::new();
        let cancel = subscription.cancel.clone();
        let done = subscription.done.clone();

        runtime.spawn(async move {
            // 回调 panic 时同样标记结束
            let _done = done.drop_guard();
            consume(&topic, stream, handler, cancel).await;
        });

        subscription
    }
}

async fn consume(
    topic: &str,
    mut stream: Box<dyn PartitionStream>,
    handler: Handler,
    cancel: CancellationToken,
) {
    info!(topic = %topic, "Subscription started");

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(topic = %topic, "Subscription cancelled");
                break;
            }
            record = stream.next() => match record {
                Some(record) => {
                    if record.topic != topic || record.payload.is_empty() {
                        debug!(topic = %topic, record_topic = %record.topic, "Skipping record");
                        continue;
                    }
                    handler(&record.payload);
                    metrics::counter!("courier_records_delivered_total").increment(1);
                }
                None => {
                    debug!(topic = %topic, "Partition stream ended");
                    break;
                }
            },
        }
    }

    stream.close();
    info!(topic = %topic, "Subscription stopped");
}

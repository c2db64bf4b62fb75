//! Message Broker trait 定义

use std::sync::Arc;

use async_trait::async_trait;
use courier_errors::BrokerResult;

use crate::Close;

/// 入站消息处理函数，参数为消息负载
pub type Handler = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// 把闭包包装为 [`Handler`]
pub fn handler<F>(f: F) -> Handler
where
    F: Fn(&[u8]) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// 宿主框架使用的消息代理 trait
///
/// 频道名和负载都是不透明的字节序列。只有 `start` 会返回错误，
/// `emit` 与 `listen` 在未启动时是静默的空操作。
#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// 建立 broker 连接
    async fn start(&self) -> BrokerResult<()>;

    /// 关闭生产者与消费者，可重复调用
    async fn stop(&self) -> BrokerResult<()>;

    /// 发送消息，不等待 broker 确认
    fn emit(&self, channel: &[u8], message: &[u8]) -> BrokerResult<()>;

    /// 订阅频道，返回取消句柄
    fn listen(&self, channel: &[u8], handler: Handler) -> Close;

    /// 适配器名称
    fn identify(&self) -> &str;
}

//! Broker 客户端抽象
//!
//! 适配器只依赖这里的 trait：连接、异步生产者、单分区读取流。
//! librdkafka 实现见 `librdkafka` 模块，进程内实现见 `memory` 模块。

use std::sync::Arc;

use async_trait::async_trait;
use courier_errors::BrokerResult;
use thiserror::Error;

use crate::config::KafkaOptions;

/// 出站或入站的一条消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Topic（即频道名）
    pub topic: String,
    /// 消息内容，缺失的负载表示为空
    pub payload: Vec<u8>,
}

impl Record {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// 分区读取的起始位置
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Offset {
    /// 只读取订阅之后写入的消息
    #[default]
    Newest,
    /// 从分区日志的开头读取
    Oldest,
}

/// 非阻塞提交失败的原因
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TrySendError {
    /// 生产者队列已满
    #[error("producer queue is full")]
    Full,
    /// 生产者已关闭
    #[error("producer is closed")]
    Closed,
    /// 客户端拒绝了该消息
    #[error("record rejected: {0}")]
    Rejected(String),
}

/// 打开 broker 连接
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, options: &KafkaOptions) -> BrokerResult<Box<dyn Connection>>;
}

/// 到 broker 集群的连接，生产者与消费者都从这里派生
#[cfg_attr(test, mockall::automock)]
pub trait Connection: Send + Sync {
    fn producer(&self) -> BrokerResult<Box<dyn ProducerHandle>>;

    fn consumer(&self) -> BrokerResult<Arc<dyn ConsumerHandle>>;

    /// 释放连接本身持有的资源
    fn close(&self) -> BrokerResult<()> {
        Ok(())
    }
}

/// 异步生产者
#[cfg_attr(test, mockall::automock)]
pub trait ProducerHandle: Send + Sync {
    /// 提交消息，永不阻塞调用方
    fn try_send(&self, record: Record) -> Result<(), TrySendError>;

    /// 停止接收新消息，剩余消息在后台尽力发送
    fn close(&self);
}

/// 分区读取流的工厂
#[cfg_attr(test, mockall::automock)]
pub trait ConsumerHandle: Send + Sync {
    /// 打开读取流，返回前确定起始位点（rdkafka 实现最多阻塞 `connect_timeout`）
    fn consume_partition(
        &self,
        topic: &str,
        partition: i32,
        offset: Offset,
    ) -> BrokerResult<Box<dyn PartitionStream>>;

    /// 关闭消费者，所有派生出的读取流随之结束
    fn close(&self) -> BrokerResult<()>;
}

/// 单个分区的读取流
#[async_trait]
pub trait PartitionStream: Send {
    /// 下一条消息；消费者关闭后返回 `None`
    async fn next(&mut self) -> Option<Record>;

    /// 释放分区资源
    fn close(&mut self);
}

//! adapter-kafka - Kafka 消息代理适配器
//!
//! 为宿主框架提供 `MessageBroker` 实现：
//! - 生命周期（Start 建立连接，Stop 释放全部资源）
//! - 非阻塞发布（本地队列满时丢弃）
//! - 频道订阅（分区 0，从最新位点开始）
//! - 可替换的客户端实现（librdkafka / 内存）

mod broker;
mod client;
mod config;
#[cfg(feature = "rdkafka")]
mod librdkafka;
mod memory;
mod subscription;

pub use broker::*;
pub use client::*;
pub use config::*;
#[cfg(feature = "rdkafka")]
pub use librdkafka::KafkaConnector;
pub use memory::{MemoryBroker, RETAINED_RECORDS};
pub use subscription::Subscription;

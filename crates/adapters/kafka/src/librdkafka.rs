//! librdkafka 客户端实现
//!
//! - 连接：元数据客户端，`connect` 时确认至少有一个 broker 可达
//! - 生产者：`ThreadedProducer`，本地队列满时 `send` 立即返回 `QueueFull`
//! - 消费者：每个读取流一个 `StreamConsumer`，手动分配 (topic, partition, offset)，
//!   不加入消费者组、不提交位点。起始位点在打开流时通过水位查询确定，
//!   打开之后写入的消息都会被读到

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use courier_errors::{BrokerError, BrokerResult};
use parking_lot::RwLock;
use rdkafka::client::ClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::Message;
use rdkafka::producer::{BaseRecord, DeliveryResult, Producer, ProducerContext, ThreadedProducer};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::util::Timeout;
use rdkafka::{Offset as KafkaOffset, TopicPartitionList};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::{
    Connection, ConsumerHandle, Connector, Offset, PartitionStream, ProducerHandle, Record,
    TrySendError,
};
use crate::config::KafkaOptions;

/// 基于 librdkafka 的连接器
#[derive(Debug, Clone, Copy, Default)]
pub struct KafkaConnector;

fn client_config(options: &KafkaOptions) -> ClientConfig {
    let mut client_config = ClientConfig::new();

    for (key, value) in options.to_client_config_entries() {
        client_config.set(&key, &value);
    }

    client_config
}

#[async_trait]
impl Connector for KafkaConnector {
    async fn connect(&self, options: &KafkaOptions) -> BrokerResult<Box<dyn Connection>> {
        let config = client_config(options);

        let metadata_client: BaseConsumer = config
            .create()
            .map_err(|e| BrokerError::configuration(format!("Failed to create Kafka client: {}", e)))?;

        let timeout = options.connect_timeout;
        let (metadata_client, fetched) = tokio::task::spawn_blocking(move || {
            let fetched = metadata_client
                .fetch_metadata(None, timeout)
                .map(|metadata| metadata.brokers().len());
            (metadata_client, fetched)
        })
        .await
        .map_err(|e| BrokerError::connection(format!("Metadata request aborted: {}", e)))?;

        let broker_count = fetched
            .map_err(|e| BrokerError::connection(format!("Failed to fetch metadata: {}", e)))?;
        if broker_count == 0 {
            return Err(BrokerError::connection("no brokers available"));
        }

        info!(
            brokers = broker_count,
            client_id = %options.client_id,
            "Kafka connection established"
        );

        Ok(Box::new(KafkaConnection {
            config,
            options: options.clone(),
            _metadata_client: metadata_client,
        }))
    }
}

struct KafkaConnection {
    config: ClientConfig,
    options: KafkaOptions,
    _metadata_client: BaseConsumer,
}

impl Connection for KafkaConnection {
    fn producer(&self) -> BrokerResult<Box<dyn ProducerHandle>> {
        let mut config = self.config.clone();
        config.set(
            "queue.buffering.max.messages",
            self.options.queue_capacity.to_string(),
        );

        let producer: ThreadedProducer<DeliveryLogger> = config
            .create_with_context(DeliveryLogger)
            .map_err(|e| BrokerError::producer(format!("Failed to create Kafka producer: {}", e)))?;

        Ok(Box::new(KafkaProducer {
            producer: RwLock::new(Some(Arc::new(producer))),
            close_timeout: self.options.close_timeout,
        }))
    }

    fn consumer(&self) -> BrokerResult<Arc<dyn ConsumerHandle>> {
        Ok(Arc::new(KafkaConsumer {
            config: self.config.clone(),
            client_id: self.options.client_id.clone(),
            watermark_timeout: self.options.connect_timeout,
            closed: CancellationToken::new(),
        }))
    }
}

/// 记录投递失败（投递结果不会返回给 emit 的调用方）
struct DeliveryLogger;

impl ClientContext for DeliveryLogger {}

impl ProducerContext for DeliveryLogger {
    type DeliveryOpaque = ();

    fn delivery(&self, result: &DeliveryResult<'_>, _: Self::DeliveryOpaque) {
        if let Err((e, message)) = result {
            warn!(topic = message.topic(), error = %e, "Kafka delivery failed");
        }
    }
}

struct KafkaProducer {
    producer: RwLock<Option<Arc<ThreadedProducer<DeliveryLogger>>>>,
    close_timeout: Duration,
}

impl ProducerHandle for KafkaProducer {
    fn try_send(&self, record: Record) -> Result<(), TrySendError> {
        let guard = self.producer.read();
        let Some(producer) = guard.as_ref() else {
            return Err(TrySendError::Closed);
        };

        let base: BaseRecord<'_, (), [u8]> =
            BaseRecord::to(record.topic.as_str()).payload(record.payload.as_slice());

        producer.send(base).map_err(|(e, _)| send_error(e))
    }

    fn close(&self) {
        let Some(producer) = self.producer.write().take() else {
            return;
        };

        let timeout = self.close_timeout;
        let flush = move || flush_producer(&producer, timeout);

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn_blocking(flush);
            }
            Err(_) => flush(),
        }
    }
}

fn send_error(e: KafkaError) -> TrySendError {
    match e {
        KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull) => TrySendError::Full,
        e => TrySendError::Rejected(e.to_string()),
    }
}

/// 最多等待 `timeout`，剩余消息丢弃
fn flush_producer(producer: &ThreadedProducer<DeliveryLogger>, timeout: Duration) {
    if let Err(e) = producer.flush(Timeout::After(timeout)) {
        warn!(
            error = %e,
            pending = producer.in_flight_count(),
            "Kafka producer flush incomplete, discarding pending records"
        );
    }
    debug!("Kafka producer closed");
}

struct KafkaConsumer {
    config: ClientConfig,
    client_id: String,
    /// 打开读取流时水位查询的超时
    watermark_timeout: Duration,
    closed: CancellationToken,
}

impl ConsumerHandle for KafkaConsumer {
    fn consume_partition(
        &self,
        topic: &str,
        partition: i32,
        offset: Offset,
    ) -> BrokerResult<Box<dyn PartitionStream>> {
        if self.closed.is_cancelled() {
            return Err(BrokerError::subscription(topic, "consumer is closed"));
        }

        let mut config = self.config.clone();
        config
            .set(
                "group.id",
                format!("{}-{}-{}", self.client_id, topic, partition),
            )
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("enable.partition.eof", "false");

        let consumer: StreamConsumer = config
            .create()
            .map_err(|e| BrokerError::subscription(topic, e.to_string()))?;

        // 起始位点必须在返回前确定；分区不存在或不可达时打开失败
        let (low, high) = consumer
            .fetch_watermarks(topic, partition, self.watermark_timeout)
            .map_err(|e| BrokerError::subscription(topic, e.to_string()))?;
        let start = match offset {
            Offset::Newest => KafkaOffset::Offset(high),
            Offset::Oldest => KafkaOffset::Offset(low),
        };
        let mut assignment = TopicPartitionList::new();
        assignment
            .add_partition_offset(topic, partition, start)
            .map_err(|e| BrokerError::subscription(topic, e.to_string()))?;
        consumer
            .assign(&assignment)
            .map_err(|e| BrokerError::subscription(topic, e.to_string()))?;

        debug!(topic = %topic, partition, low, high, "Partition stream opened");

        Ok(Box::new(KafkaPartitionStream {
            topic: topic.to_string(),
            consumer: Some(consumer),
            closed: self.closed.clone(),
        }))
    }

    fn close(&self) -> BrokerResult<()> {
        self.closed.cancel();
        Ok(())
    }
}

struct KafkaPartitionStream {
    topic: String,
    consumer: Option<StreamConsumer>,
    closed: CancellationToken,
}

#[async_trait]
impl PartitionStream for KafkaPartitionStream {
    async fn next(&mut self) -> Option<Record> {
        loop {
            let consumer = self.consumer.as_ref()?;
            tokio::select! {
                biased;
                _ = self.closed.cancelled() => return None,
                received = consumer.recv() => match received {
                    Ok(message) => {
                        return Some(Record {
                            topic: message.topic().to_string(),
                            payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
                        });
                    }
                    Err(e) => error!(topic = %self.topic, error = %e, "Kafka consume error"),
                },
            }
        }
    }

    fn close(&mut self) {
        if let Some(consumer) = self.consumer.take() {
            if let Err(e) = consumer.unassign() {
                warn!(topic = %self.topic, error = %e, "Failed to release partition");
            }
            debug!(topic = %self.topic, "Partition stream closed");
        }
    }
}

impl Drop for KafkaPartitionStream {
    fn drop(&mut self) {
        PartitionStream::close(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_config_carries_options() {
        let options = KafkaOptions::new()
            .with_addresses(["kafka-1:9092", "kafka-2:9092"])
            .with_client_id("orders");

        let config = client_config(&options);

        assert_eq!(config.get("bootstrap.servers"), Some("kafka-1:9092,kafka-2:9092"));
        assert_eq!(config.get("client.id"), Some("orders"));
        assert_eq!(config.get("security.protocol"), Some("plaintext"));
    }

    /// 127.0.0.1:1 上没有 broker，消息只会停留在本地队列中
    fn unreachable_connection(options: KafkaOptions) -> KafkaConnection {
        let options = options
            .with_address("127.0.0.1:1")
            .with_extra("message.timeout.ms", "60000");
        let config = client_config(&options);
        KafkaConnection {
            _metadata_client: config.create().unwrap(),
            config,
            options,
        }
    }

    #[test]
    fn test_queue_full_maps_to_full() {
        let connection = unreachable_connection(KafkaOptions::new().with_queue_capacity(1));
        let producer = connection.producer().unwrap();

        assert!(producer.try_send(Record::new("orders", "1")).is_ok());
        assert_eq!(
            producer.try_send(Record::new("orders", "2")),
            Err(TrySendError::Full)
        );

        producer.close();
        assert_eq!(
            producer.try_send(Record::new("orders", "3")),
            Err(TrySendError::Closed)
        );
    }

    #[test]
    fn test_send_error_mapping() {
        assert_eq!(
            send_error(KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull)),
            TrySendError::Full
        );
        assert!(matches!(
            send_error(KafkaError::MessageProduction(RDKafkaErrorCode::MessageSizeTooLarge)),
            TrySendError::Rejected(_)
        ));
    }

    #[test]
    fn test_close_flush_is_bounded_by_close_timeout() {
        let connection = unreachable_connection(
            KafkaOptions::new().with_close_timeout(Duration::from_millis(200)),
        );
        let producer = connection.producer().unwrap();
        producer
            .try_send(Record::new("orders", "undeliverable"))
            .unwrap();

        // 没有 runtime 时 flush 在当前线程执行
        let started = std::time::Instant::now();
        producer.close();
        let elapsed = started.elapsed();

        assert!(elapsed >= Duration::from_millis(150), "flushed for {elapsed:?}");
        assert!(elapsed < Duration::from_secs(5), "flushed for {elapsed:?}");
    }

    #[tokio::test]
    async fn test_unreachable_partition_fails_to_open() {
        let connection = unreachable_connection(
            KafkaOptions::new().with_connect_timeout(Duration::from_millis(200)),
        );
        let consumer = connection.consumer().unwrap();

        let err = consumer
            .consume_partition("orders", 0, Offset::Newest)
            .err()
            .expect("watermarks unavailable");

        assert!(matches!(err, BrokerError::Subscription { ref topic, .. } if topic == "orders"));
    }

    #[tokio::test]
    #[ignore] // 需要 Kafka 实例
    async fn test_connect() {
        let options = KafkaOptions::new().with_address("localhost:9092");
        let connection = KafkaConnector.connect(&options).await.unwrap();

        let consumer = connection.consumer().unwrap();
        let mut stream = consumer
            .consume_partition("courier-test", 0, Offset::Newest)
            .unwrap();
        let producer = connection.producer().unwrap();
        producer
            .try_send(Record::new("courier-test", "hello"))
            .unwrap();

        let record = tokio::time::timeout(Duration::from_secs(10), stream.next())
            .await
            .unwrap();
        assert_eq!(record, Some(Record::new("courier-test", "hello")));

        stream.close();
        consumer.close().unwrap();
        producer.close();
    }
}

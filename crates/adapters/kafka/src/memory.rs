//! 进程内 broker
//!
//! 单节点、单分区（分区 0）的内存实现，行为与 Kafka 客户端接口一致：
//! 生产者队列有界并由后台 task 写入日志，读取流默认从最新位置开始。
//! 每个 topic 只保留最近的消息，`Oldest` 从保留窗口的开头读取。
//! 用于测试，也可以在没有 Kafka 的环境中作为替身。

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use courier_errors::{BrokerError, BrokerResult};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::client::{
    Connection, ConsumerHandle, Connector, Offset, PartitionStream, ProducerHandle, Record,
    TrySendError,
};
use crate::config::KafkaOptions;

/// 每个读取流可积压的消息数
const STREAM_BUFFER: usize = 1024;

/// 每个 topic 保留的最近消息数，超出后丢弃最旧的
pub const RETAINED_RECORDS: usize = 1024;

struct TopicLog {
    records: VecDeque<Vec<u8>>,
    tx: broadcast::Sender<Record>,
}

impl TopicLog {
    fn new() -> Self {
        let (tx, _) = broadcast::channel(STREAM_BUFFER);
        Self {
            records: VecDeque::new(),
            tx,
        }
    }

    fn retain(&mut self, payload: Vec<u8>) {
        if self.records.len() == RETAINED_RECORDS {
            self.records.pop_front();
        }
        self.records.push_back(payload);
    }
}

#[derive(Default)]
struct ClusterState {
    /// 为空时接受任意地址
    listeners: Vec<String>,
    strict_topics: bool,
    topics: RwLock<HashMap<String, TopicLog>>,
    open_streams: AtomicUsize,
    open_connections: AtomicUsize,
}

impl ClusterState {
    fn append(&self, record: Record) {
        let mut topics = self.topics.write();
        let log = if self.strict_topics {
            match topics.get_mut(&record.topic) {
                Some(log) => log,
                None => {
                    warn!(topic = %record.topic, "Unknown topic, record discarded");
                    return;
                }
            }
        } else {
            topics
                .entry(record.topic.clone())
                .or_insert_with(TopicLog::new)
        };

        log.retain(record.payload.clone());
        // 没有订阅者时 send 返回错误，忽略即可
        let _ = log.tx.send(record);
    }
}

/// 内存 broker
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<ClusterState>,
}

impl MemoryBroker {
    /// 接受任意地址、自动创建 topic 的 broker
    pub fn new() -> Self {
        Self::default()
    }

    /// 只接受指定的监听地址，其余地址连接失败
    pub fn listening_on<I, S>(addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            state: Arc::new(ClusterState {
                listeners: addresses.into_iter().map(Into::into).collect(),
                ..Default::default()
            }),
        }
    }

    /// 只允许预先创建的 topic，订阅未知 topic 会失败
    pub fn with_topics<I, S>(self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let topics = topics
            .into_iter()
            .map(|topic| (topic.into(), TopicLog::new()))
            .collect();
        Self {
            state: Arc::new(ClusterState {
                listeners: self.state.listeners.clone(),
                strict_topics: true,
                topics: RwLock::new(topics),
                ..Default::default()
            }),
        }
    }

    /// 绕过生产者直接写入（模拟其他客户端）
    pub fn publish(&self, topic: impl Into<String>, payload: impl Into<Vec<u8>>) {
        self.state.append(Record::new(topic, payload));
    }

    /// topic 日志中保留的负载（最多 [`RETAINED_RECORDS`] 条）
    pub fn records(&self, topic: &str) -> Vec<Vec<u8>> {
        self.state
            .topics
            .read()
            .get(topic)
            .map(|log| log.records.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// 尚未释放的分区读取流数量
    pub fn open_streams(&self) -> usize {
        self.state.open_streams.load(Ordering::SeqCst)
    }

    /// 尚未关闭的连接数量
    pub fn open_connections(&self) -> usize {
        self.state.open_connections.load(Ordering::SeqCst)
    }

    fn accepts(&self, options: &KafkaOptions) -> bool {
        let listeners = &self.state.listeners;
        listeners.is_empty()
            || options
                .bootstrap_addresses()
                .iter()
                .any(|addr| listeners.iter().any(|l| l == addr))
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn connect(&self, options: &KafkaOptions) -> BrokerResult<Box<dyn Connection>> {
        if !self.accepts(options) {
            return Err(BrokerError::connection(format!(
                "no broker listening on {}",
                options.bootstrap_addresses().join(",")
            )));
        }

        self.state.open_connections.fetch_add(1, Ordering::SeqCst);
        debug!(client_id = %options.client_id, "Memory broker connection opened");

        Ok(Box::new(MemoryConnection {
            state: self.state.clone(),
            queue_capacity: options.queue_capacity,
            closed: AtomicBool::new(false),
        }))
    }
}

struct MemoryConnection {
    state: Arc<ClusterState>,
    queue_capacity: usize,
    closed: AtomicBool,
}

impl Connection for MemoryConnection {
    fn producer(&self) -> BrokerResult<Box<dyn ProducerHandle>> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| BrokerError::producer(format!("no tokio runtime: {}", e)))?;

        let (tx, mut rx) = mpsc::channel::<Record>(self.queue_capacity);
        let state = self.state.clone();
        runtime.spawn(async move {
            while let Some(record) = rx.recv().await {
                state.append(record);
            }
            debug!("Memory producer drained");
        });

        Ok(Box::new(MemoryProducer {
            tx: Mutex::new(Some(tx)),
        }))
    }

    fn consumer(&self) -> BrokerResult<Arc<dyn ConsumerHandle>> {
        Ok(Arc::new(MemoryConsumer {
            state: self.state.clone(),
            closed: CancellationToken::new(),
        }))
    }

    fn close(&self) -> BrokerResult<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.state.open_connections.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        let _ = Connection::close(self);
    }
}

struct MemoryProducer {
    tx: Mutex<Option<mpsc::Sender<Record>>>,
}

impl ProducerHandle for MemoryProducer {
    fn try_send(&self, record: Record) -> Result<(), TrySendError> {
        let guard = self.tx.lock();
        let Some(tx) = guard.as_ref() else {
            return Err(TrySendError::Closed);
        };
        tx.try_send(record).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TrySendError::Full,
            mpsc::error::TrySendError::Closed(_) => TrySendError::Closed,
        })
    }

    fn close(&self) {
        // 丢弃发送端后，后台 task 写完队列中剩余的消息再退出
        self.tx.lock().take();
    }
}

struct MemoryConsumer {
    state: Arc<ClusterState>,
    closed: CancellationToken,
}

impl ConsumerHandle for MemoryConsumer {
    fn consume_partition(
        &self,
        topic: &str,
        partition: i32,
        offset: Offset,
    ) -> BrokerResult<Box<dyn PartitionStream>> {
        if self.closed.is_cancelled() {
            return Err(BrokerError::subscription(topic, "consumer is closed"));
        }
        if partition != 0 {
            return Err(BrokerError::subscription(
                topic,
                format!("unknown partition {partition}"),
            ));
        }

        let mut topics = self.state.topics.write();
        let log = if self.state.strict_topics {
            topics
                .get_mut(topic)
                .ok_or_else(|| BrokerError::subscription(topic, "unknown topic"))?
        } else {
            topics.entry(topic.to_string()).or_insert_with(TopicLog::new)
        };

        let backlog = match offset {
            Offset::Newest => VecDeque::new(),
            Offset::Oldest => log
                .records
                .iter()
                .map(|payload| Record::new(topic, payload.clone()))
                .collect(),
        };
        let rx = log.tx.subscribe();
        drop(topics);

        self.state.open_streams.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(MemoryStream {
            topic: topic.to_string(),
            backlog,
            rx,
            closed: self.closed.clone(),
            state: self.state.clone(),
            released: false,
        }))
    }

    fn close(&self) -> BrokerResult<()> {
        self.closed.cancel();
        Ok(())
    }
}

struct MemoryStream {
    topic: String,
    backlog: VecDeque<Record>,
    rx: broadcast::Receiver<Record>,
    closed: CancellationToken,
    state: Arc<ClusterState>,
    released: bool,
}

impl MemoryStream {
    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.state.open_streams.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl PartitionStream for MemoryStream {
    async fn next(&mut self) -> Option<Record> {
        if self.released || self.closed.is_cancelled() {
            return None;
        }
        if let Some(record) = self.backlog.pop_front() {
            return Some(record);
        }

        loop {
            tokio::select! {
                biased;
                _ = self.closed.cancelled() => return None,
                received = self.rx.recv() => match received {
                    Ok(record) => return Some(record),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(topic = %self.topic, skipped, "Partition stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                },
            }
        }
    }

    fn close(&mut self) {
        self.release();
    }
}

impl Drop for MemoryStream {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn options() -> KafkaOptions {
        KafkaOptions::new().with_address("x:9092")
    }

    async fn wait_for_records(broker: &MemoryBroker, topic: &str, count: usize) {
        tokio::time::timeout(Duration::from_secs(1), async {
            while broker.records(topic).len() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("records appended");
    }

    #[tokio::test]
    async fn test_rejects_unknown_listener() {
        let broker = MemoryBroker::listening_on(["x:9092"]);
        let options = KafkaOptions::new().with_address("y:9092");

        let err = broker.connect(&options).await.err().expect("connect fails");
        assert!(err.is_retryable());
        assert_eq!(broker.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_producer_appends_to_log() {
        let broker = MemoryBroker::listening_on(["x:9092"]);
        let connection = broker.connect(&options()).await.unwrap();
        assert_eq!(broker.open_connections(), 1);

        let producer = connection.producer().unwrap();
        producer.try_send(Record::new("orders", "a")).unwrap();
        producer.try_send(Record::new("orders", "b")).unwrap();
        wait_for_records(&broker, "orders", 2).await;

        producer.close();
        assert_eq!(
            producer.try_send(Record::new("orders", "c")),
            Err(TrySendError::Closed)
        );

        connection.close().unwrap();
        connection.close().unwrap();
        assert_eq!(broker.open_connections(), 0);
        assert_eq!(broker.records("orders"), vec![b"a".to_vec(), b"b".to_vec()]);
    }

    #[tokio::test]
    async fn test_stream_starts_at_newest_or_oldest() {
        let broker = MemoryBroker::new();
        broker.publish("orders", "before");

        let connection = broker.connect(&options()).await.unwrap();
        let consumer = connection.consumer().unwrap();
        let mut newest = consumer
            .consume_partition("orders", 0, Offset::Newest)
            .unwrap();
        let mut oldest = consumer
            .consume_partition("orders", 0, Offset::Oldest)
            .unwrap();
        assert_eq!(broker.open_streams(), 2);

        broker.publish("orders", "after");

        assert_eq!(newest.next().await, Some(Record::new("orders", "after")));
        assert_eq!(oldest.next().await, Some(Record::new("orders", "before")));
        assert_eq!(oldest.next().await, Some(Record::new("orders", "after")));

        newest.close();
        drop(oldest);
        assert_eq!(broker.open_streams(), 0);
    }

    #[tokio::test]
    async fn test_consumer_close_ends_streams() {
        let broker = MemoryBroker::new();
        let connection = broker.connect(&options()).await.unwrap();
        let consumer = connection.consumer().unwrap();
        let mut stream = consumer
            .consume_partition("orders", 0, Offset::Newest)
            .unwrap();

        let pending = tokio::spawn(async move { stream.next().await });
        consumer.close().unwrap();

        let next = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .expect("stream unblocked")
            .unwrap();
        assert_eq!(next, None);
        assert!(consumer
            .consume_partition("orders", 0, Offset::Newest)
            .is_err());
    }

    #[tokio::test]
    async fn test_strict_topics_and_partitions() {
        let broker = MemoryBroker::new().with_topics(["orders"]);
        let connection = broker.connect(&options()).await.unwrap();
        let consumer = connection.consumer().unwrap();

        assert!(consumer
            .consume_partition("orders", 0, Offset::Newest)
            .is_ok());
        let unknown = consumer
            .consume_partition("billing", 0, Offset::Newest)
            .err()
            .expect("unknown topic");
        assert!(matches!(unknown, BrokerError::Subscription { .. }));
        assert!(consumer
            .consume_partition("orders", 3, Offset::Newest)
            .is_err());

        broker.publish("billing", "dropped");
        assert!(broker.records("billing").is_empty());
    }

    #[test]
    fn test_log_keeps_most_recent_records() {
        let broker = MemoryBroker::new();
        for i in 0..RETAINED_RECORDS + 5 {
            broker.publish("orders", i.to_string());
        }

        let records = broker.records("orders");
        assert_eq!(records.len(), RETAINED_RECORDS);
        assert_eq!(records[0], b"5".to_vec());
        assert_eq!(
            records.last(),
            Some(&(RETAINED_RECORDS + 4).to_string().into_bytes())
        );
    }

    #[tokio::test]
    async fn test_full_queue_is_reported() {
        let broker = MemoryBroker::new();
        let connection = broker
            .connect(&options().with_queue_capacity(1))
            .await
            .unwrap();
        let producer = connection.producer().unwrap();

        // 当前线程 runtime 中后台 task 在本测试让出之前不会运行
        producer.try_send(Record::new("orders", "1")).unwrap();
        assert_eq!(
            producer.try_send(Record::new("orders", "2")),
            Err(TrySendError::Full)
        );

        wait_for_records(&broker, "orders", 1).await;
        assert_eq!(broker.records("orders"), vec![b"1".to_vec()]);
    }
}

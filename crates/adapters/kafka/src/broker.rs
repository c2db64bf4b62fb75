//! Kafka 消息代理适配器
//!
//! 把宿主框架的按频道发布/订阅接口映射到 Kafka：
//! - `emit` 非阻塞地写入生产者队列，队列满时丢弃
//! - `listen` 为频道打开分区 0 的读取流（从最新位置开始），在独立 task 中回调
//! - `stop` 关闭消费者与生产者，所有订阅随之结束

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use courier_errors::{BrokerError, BrokerResult};
use courier_ports::{Close, Handler, MessageBroker};
use parking_lot::RwLock;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::client::{Connection, Connector, ConsumerHandle, Offset, ProducerHandle, Record};
use crate::config::KafkaOptions;
use crate::subscription::Subscription;

/// 适配器名称
pub const BROKER_NAME: &str = "Courier::Kafka";

/// 订阅固定使用的分区
pub const PARTITION: i32 = 0;

/// `start` 成功后持有的连接资源
struct Session {
    connection: Box<dyn Connection>,
    producer: Box<dyn ProducerHandle>,
    consumer: Arc<dyn ConsumerHandle>,
    runtime: Handle,
}

/// Kafka 消息代理
pub struct KafkaBroker {
    options: KafkaOptions,
    connector: Arc<dyn Connector>,
    session: RwLock<Option<Session>>,
    /// 每次 `stop` 递增（持有写锁时），`start` 据此发现连接期间发生的 `stop`
    stop_generation: AtomicU64,
}

impl KafkaBroker {
    /// 使用 librdkafka 客户端
    #[cfg(feature = "rdkafka")]
    pub fn new(options: KafkaOptions) -> Self {
        Self::with_connector(options, crate::librdkafka::KafkaConnector)
    }

    /// 使用指定的 broker 客户端
    pub fn with_connector(options: KafkaOptions, connector: impl Connector + 'static) -> Self {
        Self {
            options,
            connector: Arc::new(connector),
            session: RwLock::new(None),
            stop_generation: AtomicU64::new(0),
        }
    }

    pub fn options(&self) -> &KafkaOptions {
        &self.options
    }

    pub fn is_started(&self) -> bool {
        self.session.read().is_some()
    }

    /// 打开连接并派生生产者与消费者
    ///
    /// 任何一步失败都会释放已创建的资源，适配器保持未启动状态。
    /// 已启动时直接返回成功。连接期间被 `stop` 时丢弃新连接并返回连接错误。
    pub async fn start(&self) -> BrokerResult<()> {
        if self.is_started() {
            debug!("Kafka broker already started");
            return Ok(());
        }

        self.options.validate()?;
        let runtime = Handle::try_current()
            .map_err(|e| BrokerError::configuration(format!("no tokio runtime: {}", e)))?;

        let generation = self.stop_generation.load(Ordering::SeqCst);
        let connection = self.connector.connect(&self.options).await?;
        let session = self.open_session(connection, runtime)?;

        let mut guard = self.session.write();
        if self.stop_generation.load(Ordering::SeqCst) != generation {
            drop(guard);
            debug!("Kafka broker stopped while starting, closing new session");
            self.close_session(session);
            return Err(BrokerError::connection("broker stopped while starting"));
        }
        if guard.is_some() {
            drop(guard);
            debug!("Kafka broker started concurrently, closing duplicate session");
            self.close_session(session);
            return Ok(());
        }
        *guard = Some(session);

        info!(
            addresses = ?self.options.bootstrap_addresses(),
            client_id = %self.options.client_id,
            "Kafka broker started"
        );
        Ok(())
    }

    fn open_session(
        &self,
        connection: Box<dyn Connection>,
        runtime: Handle,
    ) -> BrokerResult<Session> {
        let consumer = match connection.consumer() {
            Ok(consumer) => consumer,
            Err(e) => {
                self.close_connection(connection.as_ref());
                return Err(e);
            }
        };

        let producer = match connection.producer() {
            Ok(producer) => producer,
            Err(e) => {
                self.close_consumer(consumer.as_ref());
                self.close_connection(connection.as_ref());
                return Err(e);
            }
        };

        Ok(Session {
            connection,
            producer,
            consumer,
            runtime,
        })
    }

    /// 关闭消费者与生产者，可重复调用
    ///
    /// 底层关闭失败只记录日志并上报错误回调，总是返回成功。
    pub async fn stop(&self) -> BrokerResult<()> {
        let session = {
            let mut guard = self.session.write();
            self.stop_generation.fetch_add(1, Ordering::SeqCst);
            guard.take()
        };
        match session {
            Some(session) => {
                self.close_session(session);
                info!("Kafka broker stopped");
            }
            None => debug!("Kafka broker not started, nothing to stop"),
        }
        Ok(())
    }

    fn close_session(&self, session: Session) {
        self.close_consumer(session.consumer.as_ref());
        session.producer.close();
        self.close_connection(session.connection.as_ref());
    }

    fn close_consumer(&self, consumer: &dyn ConsumerHandle) {
        if let Err(e) = consumer.close() {
            warn!(error = %e, "Failed to close Kafka consumer");
            self.options.report(&e);
        }
    }

    fn close_connection(&self, connection: &dyn Connection) {
        if let Err(e) = connection.close() {
            warn!(error = %e, "Failed to close Kafka connection");
            self.options.report(&e);
        }
    }

    /// 发送消息
    ///
    /// 未启动时什么都不做；生产者队列已满时丢弃消息。两种情况都返回成功。
    pub fn emit(&self, channel: &[u8], message: &[u8]) -> BrokerResult<()> {
        let guard = self.session.read();
        let Some(session) = guard.as_ref() else {
            return Ok(());
        };

        let Some(topic) = self.topic_name(channel) else {
            return Ok(());
        };

        match session.producer.try_send(Record::new(topic, message)) {
            Ok(()) => metrics::counter!("courier_emit_accepted_total").increment(1),
            Err(e) => {
                debug!(topic = %topic, reason = %e, "Dropping outbound record");
                metrics::counter!("courier_emit_dropped_total").increment(1);
            }
        }
        Ok(())
    }

    /// 订阅频道
    ///
    /// 未启动或打开分区流失败时返回不活动的订阅，失败原因交给错误回调。
    pub fn subscribe(&self, channel: &[u8], handler: Handler) -> Subscription {
        let (consumer, runtime) = match self.session.read().as_ref() {
            Some(session) => (session.consumer.clone(), session.runtime.clone()),
            None => return Subscription::inert(),
        };

        let Some(topic) = self.topic_name(channel) else {
            return Subscription::inert();
        };

        match consumer.consume_partition(topic, PARTITION, Offset::Newest) {
            Ok(stream) => Subscription::spawn(&runtime, topic.to_string(), stream, handler),
            Err(e) => {
                warn!(topic = %topic, error = %e, "Failed to open partition stream");
                self.options.report(&e);
                Subscription::inert()
            }
        }
    }

    /// 频道名必须是合法的 UTF-8 才能作为 topic
    fn topic_name<'a>(&self, channel: &'a [u8]) -> Option<&'a str> {
        match std::str::from_utf8(channel) {
            Ok(topic) => Some(topic),
            Err(_) => {
                let err = BrokerError::invalid_channel(String::from_utf8_lossy(channel));
                debug!(error = %err, "Ignoring channel");
                self.options.report(&err);
                None
            }
        }
    }

    pub fn identify(&self) -> &'static str {
        BROKER_NAME
    }
}

#[async_trait]
impl MessageBroker for KafkaBroker {
    async fn start(&self) -> BrokerResult<()> {
        KafkaBroker::start(self).await
    }

    async fn stop(&self) -> BrokerResult<()> {
        KafkaBroker::stop(self).await
    }

    fn emit(&self, channel: &[u8], message: &[u8]) -> BrokerResult<()> {
        KafkaBroker::emit(self, channel, message)
    }

    fn listen(&self, channel: &[u8], handler: Handler) -> Close {
        self.subscribe(channel, handler).into_close()
    }

    fn identify(&self) -> &str {
        BROKER_NAME
    }
}

impl fmt::Display for KafkaBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(BROKER_NAME)
    }
}

impl fmt::Debug for KafkaBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KafkaBroker")
            .field("options", &self.options)
            .field("started", &self.is_started())
            .finish()
    }
}

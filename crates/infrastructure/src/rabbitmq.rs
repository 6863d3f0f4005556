use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use compute_core::{Broker, BrokerConfig, ComputeError, Result, TaskHandler};
use futures::StreamExt;
use lapin::{
    options::*,
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use tokio::sync::{broadcast, Mutex, RwLock, Semaphore};
use tracing::{debug, error, info, warn};

/// 投递次数头，worker自己维护（RabbitMQ的nack不递增计数）
const ATTEMPTS_HEADER: &str = "x-compute-attempts";

#[derive(Clone)]
struct Subscription {
    handler: Arc<dyn TaskHandler>,
    concurrency: usize,
    timeout: Duration,
}

/// RabbitMQ消息代理实现
///
/// 每个主题一个durable队列；消费侧按注册的并发度设置prefetch并用
/// 信号量限并发，处理超时或可重试失败时带递增的投递次数头重新
/// 发布，超过上限即确认丢弃。
pub struct RabbitMqBroker {
    connection: Connection,
    channel: Arc<Mutex<Channel>>,
    config: BrokerConfig,
    subscriptions: RwLock<HashMap<String, Subscription>>,
}

impl RabbitMqBroker {
    /// 建立连接并创建发布通道
    pub async fn new(config: BrokerConfig) -> Result<Self> {
        let connection = Connection::connect(&config.url, ConnectionProperties::default())
            .await
            .map_err(|e| ComputeError::Broker(format!("连接RabbitMQ失败: {e}")))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| ComputeError::Broker(format!("创建通道失败: {e}")))?;

        info!("成功连接到RabbitMQ: {}", config.url);

        Ok(Self {
            connection,
            channel: Arc::new(Mutex::new(channel)),
            config,
            subscriptions: RwLock::new(HashMap::new()),
        })
    }

    /// 声明durable队列
    async fn declare_queue(&self, queue_name: &str) -> Result<()> {
        let channel = self.channel.lock().await;
        channel
            .queue_declare(
                queue_name,
                QueueDeclareOptions {
                    durable: true,
                    exclusive: false,
                    auto_delete: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| ComputeError::Broker(format!("声明队列 {queue_name} 失败: {e}")))?;

        debug!("队列 {} 声明成功", queue_name);
        Ok(())
    }

    /// 获取连接状态
    pub fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }

    /// 关闭连接
    pub async fn close(&self) -> Result<()> {
        self.connection
            .close(200, "正常关闭")
            .await
            .map_err(|e| ComputeError::Broker(format!("关闭连接失败: {e}")))?;

        info!("RabbitMQ连接已关闭");
        Ok(())
    }
}

#[async_trait]
impl Broker for RabbitMqBroker {
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<()> {
        let channel = self.channel.lock().await;
        let confirm = channel
            .basic_publish(
                "",
                topic,
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default().with_delivery_mode(2), // 2 = persistent
            )
            .await
            .map_err(|e| ComputeError::Broker(format!("发布消息到主题 {topic} 失败: {e}")))?;

        confirm
            .await
            .map_err(|e| ComputeError::Broker(format!("消息发布确认失败: {e}")))?;

        debug!("消息已发布到主题: {}", topic);
        Ok(())
    }

    async fn register_handler(
        &self,
        topic: &str,
        handler: Arc<dyn TaskHandler>,
        concurrency: usize,
        timeout: Duration,
    ) -> Result<()> {
        self.declare_queue(topic).await?;

        info!(
            "为主题 {} 注册处理器: concurrency={}, timeout={}s",
            topic,
            concurrency,
            timeout.as_secs()
        );

        let mut subscriptions = self.subscriptions.write().await;
        subscriptions.insert(
            topic.to_string(),
            Subscription {
                handler,
                concurrency,
                timeout,
            },
        );
        Ok(())
    }

    async fn consume_until_shutdown(&self, shutdown: broadcast::Receiver<()>) -> Result<()> {
        let subscriptions: Vec<(String, Subscription)> = {
            let subs = self.subscriptions.read().await;
            subs.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };

        if subscriptions.is_empty() {
            return Err(ComputeError::Broker("没有注册任何处理器".to_string()));
        }

        let mut join_handles = Vec::new();
        for (topic, subscription) in subscriptions {
            // 每个主题独立通道，prefetch与并发度一致
            let channel = self
                .connection
                .create_channel()
                .await
                .map_err(|e| ComputeError::Broker(format!("创建消费通道失败: {e}")))?;
            channel
                .basic_qos(subscription.concurrency as u16, BasicQosOptions::default())
                .await
                .map_err(|e| ComputeError::Broker(format!("设置prefetch失败: {e}")))?;

            let consumer_tag = format!("{}-{}", self.config.channel, topic);
            let consumer = channel
                .basic_consume(
                    &topic,
                    &consumer_tag,
                    BasicConsumeOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| ComputeError::Broker(format!("创建消费者失败: {e}")))?;

            info!("开始消费主题: {} (tag: {})", topic, consumer_tag);

            join_handles.push(tokio::spawn(dispatch_loop(
                channel,
                consumer,
                topic,
                subscription,
                self.config.max_attempts,
                shutdown.resubscribe(),
            )));
        }

        for handle in join_handles {
            let _ = handle.await;
        }

        info!("所有主题的消费已停止");
        Ok(())
    }
}

/// 单主题分发循环：限并发领取消息，交给处理任务
async fn dispatch_loop(
    channel: Channel,
    mut consumer: lapin::Consumer,
    topic: String,
    subscription: Subscription,
    max_attempts: u32,
    mut shutdown: broadcast::Receiver<()>,
) {
    let semaphore = Arc::new(Semaphore::new(subscription.concurrency));

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                info!("主题 {} 收到关闭信号，停止领取新消息", topic);
                break;
            }
            delivery = consumer.next() => {
                let Some(delivery) = delivery else {
                    warn!("主题 {} 的消费者流已结束", topic);
                    break;
                };
                let delivery = match delivery {
                    Ok(delivery) => delivery,
                    Err(e) => {
                        error!("主题 {} 接收消息失败: {}", topic, e);
                        continue;
                    }
                };

                let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                    break;
                };
                let channel = channel.clone();
                let handler = Arc::clone(&subscription.handler);
                let timeout = subscription.timeout;
                let topic = topic.clone();
                tokio::spawn(async move {
                    handle_delivery(channel, delivery, handler, timeout, max_attempts, &topic)
                        .await;
                    drop(permit);
                });
            }
        }
    }

    // 等在途的处理器跑完
    let _ = semaphore
        .acquire_many(subscription.concurrency as u32)
        .await;
    debug!("主题 {} 的在途处理已全部结束", topic);
}

/// 处理单条投递：执行、分类、ack/重投
async fn handle_delivery(
    channel: Channel,
    delivery: lapin::message::Delivery,
    handler: Arc<dyn TaskHandler>,
    timeout: Duration,
    max_attempts: u32,
    topic: &str,
) {
    let attempts = delivery_attempts(&delivery.properties);

    let outcome = tokio::time::timeout(timeout, handler.handle(&delivery.data)).await;

    let retry_reason = match outcome {
        Ok(Ok(())) => {
            ack(&delivery, topic).await;
            return;
        }
        Ok(Err(e)) if e.is_fatal() => {
            // 重投不可能成功，确认后丢弃
            warn!("主题 {} 的消息处理失败（不可重试）: {}", topic, e);
            ack(&delivery, topic).await;
            return;
        }
        Ok(Err(e)) => e.to_string(),
        Err(_) => format!("处理超时 ({}s)", timeout.as_secs()),
    };

    if attempts >= max_attempts {
        error!(
            "主题 {} 的消息达到最大投递次数 {}，丢弃: {}",
            topic, max_attempts, retry_reason
        );
        ack(&delivery, topic).await;
        return;
    }

    // 带递增计数头重新发布，再确认原消息
    warn!(
        "主题 {} 的消息处理失败（第{}次投递），重新入队: {}",
        topic, attempts, retry_reason
    );
    let mut headers = FieldTable::default();
    headers.insert(
        ShortString::from(ATTEMPTS_HEADER),
        AMQPValue::LongUInt(attempts + 1),
    );
    let republish = channel
        .basic_publish(
            "",
            topic,
            BasicPublishOptions::default(),
            &delivery.data,
            BasicProperties::default()
                .with_delivery_mode(2)
                .with_headers(headers),
        )
        .await;
    match republish {
        Ok(confirm) => {
            if let Err(e) = confirm.await {
                error!("主题 {} 的消息重新发布确认失败: {}", topic, e);
            }
            ack(&delivery, topic).await;
        }
        Err(e) => {
            // 发布失败就把原消息nack回队列，至少不丢
            error!("主题 {} 的消息重新发布失败: {}", topic, e);
            if let Err(e) = delivery
                .acker
                .nack(BasicNackOptions {
                    requeue: true,
                    ..Default::default()
                })
                .await
            {
                error!("主题 {} 的消息nack失败: {}", topic, e);
            }
        }
    }
}

async fn ack(delivery: &lapin::message::Delivery, topic: &str) {
    if let Err(e) = delivery.acker.ack(BasicAckOptions::default()).await {
        error!("主题 {} 的消息确认失败: {}", topic, e);
    }
}

/// 从消息头读取当前投递次数，首投为1
fn delivery_attempts(properties: &BasicProperties) -> u32 {
    properties
        .headers()
        .as_ref()
        .and_then(|table| table.inner().get(&ShortString::from(ATTEMPTS_HEADER)))
        .and_then(|value| match value {
            AMQPValue::LongUInt(n) => Some(*n),
            AMQPValue::LongInt(n) => Some(*n as u32),
            AMQPValue::LongLongInt(n) => Some(*n as u32),
            _ => None,
        })
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivery_attempts_default() {
        assert_eq!(delivery_attempts(&BasicProperties::default()), 1);
    }

    #[test]
    fn test_delivery_attempts_from_header() {
        let mut headers = FieldTable::default();
        headers.insert(ShortString::from(ATTEMPTS_HEADER), AMQPValue::LongUInt(3));
        let properties = BasicProperties::default().with_headers(headers);
        assert_eq!(delivery_attempts(&properties), 3);
    }
}

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use compute_core::{Broker, ComputeError, Result, TaskHandler};
use tokio::sync::{broadcast, mpsc, Mutex, RwLock, Semaphore};
use tracing::{debug, error, info, warn};

/// 内存投递单元
#[derive(Debug, Clone)]
struct InMemoryDelivery {
    payload: Vec<u8>,
    attempts: u32,
}

struct TopicChannel {
    sender: mpsc::UnboundedSender<InMemoryDelivery>,
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<InMemoryDelivery>>>,
}

#[derive(Clone)]
struct Subscription {
    handler: Arc<dyn TaskHandler>,
    concurrency: usize,
    timeout: Duration,
}

/// 内存消息代理实现
///
/// 使用 Tokio channels 的进程内broker，嵌入式部署和测试用。分发
/// 语义与RabbitMQ实现一致：限并发、处理超时、可重试失败按投递
/// 次数重新入队。
pub struct InMemoryBroker {
    topics: Arc<RwLock<HashMap<String, TopicChannel>>>,
    subscriptions: RwLock<HashMap<String, Subscription>>,
    max_attempts: u32,
}

impl InMemoryBroker {
    pub fn new(max_attempts: u32) -> Self {
        info!("创建内存消息代理 (max_attempts: {})", max_attempts);
        Self {
            topics: Arc::new(RwLock::new(HashMap::new())),
            subscriptions: RwLock::new(HashMap::new()),
            max_attempts,
        }
    }

    async fn get_or_create_topic(&self, topic: &str) -> mpsc::UnboundedSender<InMemoryDelivery> {
        {
            let topics = self.topics.read().await;
            if let Some(channel) = topics.get(topic) {
                return channel.sender.clone();
            }
        }

        let mut topics = self.topics.write().await;
        let channel = topics.entry(topic.to_string()).or_insert_with(|| {
            debug!("创建内存主题: {}", topic);
            let (sender, receiver) = mpsc::unbounded_channel();
            TopicChannel {
                sender,
                receiver: Arc::new(Mutex::new(receiver)),
            }
        });
        channel.sender.clone()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<()> {
        let sender = self.get_or_create_topic(topic).await;
        sender
            .send(InMemoryDelivery {
                payload: payload.to_vec(),
                attempts: 1,
            })
            .map_err(|e| ComputeError::Broker(format!("发布到内存主题 {topic} 失败: {e}")))?;
        Ok(())
    }

    async fn register_handler(
        &self,
        topic: &str,
        handler: Arc<dyn TaskHandler>,
        concurrency: usize,
        timeout: Duration,
    ) -> Result<()> {
        self.get_or_create_topic(topic).await;

        info!(
            "为内存主题 {} 注册处理器: concurrency={}, timeout={}s",
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
            let (sender, receiver) = {
                let topics = self.topics.read().await;
                let channel = topics
                    .get(&topic)
                    .ok_or_else(|| ComputeError::Broker(format!("主题 {topic} 不存在")))?;
                (channel.sender.clone(), Arc::clone(&channel.receiver))
            };

            join_handles.push(tokio::spawn(dispatch_loop(
                topic,
                sender,
                receiver,
                subscription,
                self.max_attempts,
                shutdown.resubscribe(),
            )));
        }

        for handle in join_handles {
            let _ = handle.await;
        }

        info!("内存代理的所有主题消费已停止");
        Ok(())
    }
}

async fn dispatch_loop(
    topic: String,
    sender: mpsc::UnboundedSender<InMemoryDelivery>,
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<InMemoryDelivery>>>,
    subscription: Subscription,
    max_attempts: u32,
    mut shutdown: broadcast::Receiver<()>,
) {
    let semaphore = Arc::new(Semaphore::new(subscription.concurrency));
    let mut receiver = receiver.lock().await;

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                info!("内存主题 {} 收到关闭信号", topic);
                break;
            }
            delivery = receiver.recv() => {
                let Some(delivery) = delivery else { break };

                let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                    break;
                };
                let handler = Arc::clone(&subscription.handler);
                let timeout = subscription.timeout;
                let sender = sender.clone();
                let topic = topic.clone();
                tokio::spawn(async move {
                    handle_delivery(delivery, handler, timeout, max_attempts, sender, &topic)
                        .await;
                    drop(permit);
                });
            }
        }
    }

    let _ = semaphore
        .acquire_many(subscription.concurrency as u32)
        .await;
}

async fn handle_delivery(
    delivery: InMemoryDelivery,
    handler: Arc<dyn TaskHandler>,
    timeout: Duration,
    max_attempts: u32,
    sender: mpsc::UnboundedSender<InMemoryDelivery>,
    topic: &str,
) {
    let outcome = tokio::time::timeout(timeout, handler.handle(&delivery.payload)).await;

    let retry_reason = match outcome {
        Ok(Ok(())) => return,
        Ok(Err(e)) if e.is_fatal() => {
            warn!("内存主题 {} 的消息处理失败（不可重试）: {}", topic, e);
            return;
        }
        Ok(Err(e)) => e.to_string(),
        Err(_) => format!("处理超时 ({}s)", timeout.as_secs()),
    };

    if delivery.attempts >= max_attempts {
        error!(
            "内存主题 {} 的消息达到最大投递次数 {}，丢弃: {}",
            topic, max_attempts, retry_reason
        );
        return;
    }

    warn!(
        "内存主题 {} 的消息处理失败（第{}次投递），重新入队: {}",
        topic, delivery.attempts, retry_reason
    );
    let _ = sender.send(InMemoryDelivery {
        payload: delivery.payload,
        attempts: delivery.attempts + 1,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// 可编程的测试处理器，记录调用并按脚本返回
    struct RecordingHandler {
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        delay: Duration,
        behavior: Behavior,
        done_tx: mpsc::UnboundedSender<usize>,
    }

    enum Behavior {
        Succeed,
        FailFatal,
        FailRetryable,
    }

    impl RecordingHandler {
        fn new(behavior: Behavior, delay: Duration) -> (Arc<Self>, mpsc::UnboundedReceiver<usize>) {
            let (done_tx, done_rx) = mpsc::unbounded_channel();
            (
                Arc::new(Self {
                    calls: AtomicUsize::new(0),
                    in_flight: AtomicUsize::new(0),
                    max_in_flight: AtomicUsize::new(0),
                    delay,
                    behavior,
                    done_tx,
                }),
                done_rx,
            )
        }
    }

    #[async_trait]
    impl TaskHandler for RecordingHandler {
        async fn handle(&self, _payload: &[u8]) -> Result<()> {
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(current, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            let _ = self.done_tx.send(call);
            match self.behavior {
                Behavior::Succeed => Ok(()),
                Behavior::FailFatal => {
                    Err(ComputeError::InvalidUplet("uuid字段未设置".to_string()))
                }
                Behavior::FailRetryable => Err(ComputeError::Storage("503".to_string())),
            }
        }
    }

    async fn run_broker_until(
        broker: Arc<InMemoryBroker>,
        shutdown_tx: &broadcast::Sender<()>,
    ) -> tokio::task::JoinHandle<()> {
        let rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let _ = broker.consume_until_shutdown(rx).await;
        })
    }

    #[tokio::test]
    async fn test_delivery_reaches_handler() {
        let broker = Arc::new(InMemoryBroker::new(3));
        let (handler, mut done_rx) =
            RecordingHandler::new(Behavior::Succeed, Duration::from_millis(1));
        broker
            .register_handler("train", handler.clone(), 1, Duration::from_secs(5))
            .await
            .unwrap();

        let (shutdown_tx, _) = broadcast::channel(1);
        let consume = run_broker_until(Arc::clone(&broker), &shutdown_tx).await;

        broker.publish("train", b"payload").await.unwrap();
        done_rx.recv().await.unwrap();
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);

        let _ = shutdown_tx.send(());
        let _ = consume.await;
    }

    #[tokio::test]
    async fn test_fatal_error_not_redelivered() {
        let broker = Arc::new(InMemoryBroker::new(3));
        let (handler, mut done_rx) =
            RecordingHandler::new(Behavior::FailFatal, Duration::from_millis(1));
        broker
            .register_handler("train", handler.clone(), 1, Duration::from_secs(5))
            .await
            .unwrap();

        let (shutdown_tx, _) = broadcast::channel(1);
        let consume = run_broker_until(Arc::clone(&broker), &shutdown_tx).await;

        broker.publish("train", b"broken").await.unwrap();
        done_rx.recv().await.unwrap();
        // 留出重投（若发生）的时间窗
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);

        let _ = shutdown_tx.send(());
        let _ = consume.await;
    }

    #[tokio::test]
    async fn test_retryable_error_redelivered_up_to_max_attempts() {
        let broker = Arc::new(InMemoryBroker::new(3));
        let (handler, mut done_rx) =
            RecordingHandler::new(Behavior::FailRetryable, Duration::from_millis(1));
        broker
            .register_handler("train", handler.clone(), 1, Duration::from_secs(5))
            .await
            .unwrap();

        let (shutdown_tx, _) = broadcast::channel(1);
        let consume = run_broker_until(Arc::clone(&broker), &shutdown_tx).await;

        broker.publish("train", b"flaky").await.unwrap();
        for _ in 0..3 {
            done_rx.recv().await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        // 3次投递后不再重试
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);

        let _ = shutdown_tx.send(());
        let _ = consume.await;
    }

    #[tokio::test]
    async fn test_handler_timeout_triggers_redelivery() {
        let broker = Arc::new(InMemoryBroker::new(2));
        // 处理耗时远超超时窗口
        let (handler, _done_rx) =
            RecordingHandler::new(Behavior::Succeed, Duration::from_secs(30));
        broker
            .register_handler("train", handler.clone(), 1, Duration::from_millis(20))
            .await
            .unwrap();

        let (shutdown_tx, _) = broadcast::channel(1);
        let consume = run_broker_until(Arc::clone(&broker), &shutdown_tx).await;

        broker.publish("train", b"slow").await.unwrap();
        // 两次投递都超时后消息被丢弃；处理器被调起两次
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(handler.in_flight.load(Ordering::SeqCst), 2);

        let _ = shutdown_tx.send(());
        let _ = consume.await;
    }

    #[tokio::test]
    async fn test_bounded_concurrency() {
        let broker = Arc::new(InMemoryBroker::new(1));
        let (handler, mut done_rx) =
            RecordingHandler::new(Behavior::Succeed, Duration::from_millis(30));
        broker
            .register_handler("train", handler.clone(), 2, Duration::from_secs(5))
            .await
            .unwrap();

        let (shutdown_tx, _) = broadcast::channel(1);
        let consume = run_broker_until(Arc::clone(&broker), &shutdown_tx).await;

        for _ in 0..6 {
            broker.publish("train", b"work").await.unwrap();
        }
        for _ in 0..6 {
            done_rx.recv().await.unwrap();
        }
        assert_eq!(handler.calls.load(Ordering::SeqCst), 6);
        assert!(handler.max_in_flight.load(Ordering::SeqCst) <= 2);

        let _ = shutdown_tx.send(());
        let _ = consume.await;
    }

    #[tokio::test]
    async fn test_consume_without_handlers_fails() {
        let broker = InMemoryBroker::new(1);
        let (shutdown_tx, rx) = broadcast::channel(1);
        drop(shutdown_tx);
        let err = broker.consume_until_shutdown(rx).await.unwrap_err();
        assert!(matches!(err, ComputeError::Broker(_)));
    }
}

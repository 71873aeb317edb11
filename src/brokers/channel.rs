use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::select;
use tokio::sync::{mpsc, watch};

use super::{Broker, BrokerFactory, DispatchTarget, Event};
use crate::error::BrokerError;

pub const DEFAULT_CAPACITY: usize = 64;

/// In-process broker fed through a bounded channel.
///
/// The run loop ends on [`Broker::stop`] or once every [`Publisher`] handed
/// out has been dropped.
pub struct ChannelBroker {
    server_id: String,
    target: Mutex<Arc<dyn DispatchTarget>>,
    // held until the first publisher is taken, the broker only keeps a weak handle after that
    seed: Mutex<Option<mpsc::Sender<Event>>>,
    sender: mpsc::WeakSender<Event>,
    receiver: tokio::sync::Mutex<mpsc::Receiver<Event>>,
    killswitch: watch::Sender<bool>,
}

impl ChannelBroker {
    pub fn new(server_id: impl Into<String>, target: Arc<dyn DispatchTarget>, capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        ChannelBroker {
            server_id: server_id.into(),
            target: Mutex::new(target),
            sender: sender.downgrade(),
            seed: Mutex::new(Some(sender)),
            receiver: tokio::sync::Mutex::new(receiver),
            killswitch: watch::channel(false).0,
        }
    }

    pub fn publisher(&self) -> Result<Publisher, BrokerError> {
        let sender = match lock(&self.seed).take() {
            Some(sender) => sender,
            None => self
                .sender
                .upgrade()
                .ok_or_else(|| BrokerError::Closed(self.server_id.clone()))?,
        };
        Ok(Publisher {
            server_id: self.server_id.clone(),
            sender,
        })
    }

    /// True once all publishers are gone and no more events can arrive.
    pub fn is_closed(&self) -> bool {
        lock(&self.seed).is_none() && self.sender.upgrade().is_none()
    }

    /// Points the broker at a new target and clears a previous stop.
    fn rebind(&self, target: Arc<dyn DispatchTarget>) {
        *lock(&self.target) = target;
        self.killswitch.send_replace(false);
    }

    fn target(&self) -> Arc<dyn DispatchTarget> {
        lock(&self.target).clone()
    }
}

#[async_trait]
impl Broker for ChannelBroker {
    fn server_id(&self) -> &str {
        &self.server_id
    }

    async fn start(&self) -> Result<(), BrokerError> {
        let mut receiver = self
            .receiver
            .try_lock()
            .map_err(|_| BrokerError::AlreadyRunning(self.server_id.clone()))?;
        let mut killswitch = self.killswitch.subscribe();

        tracing::info!("Broker {} running", self.server_id);

        // stop may already have been signalled before this task got scheduled
        if *killswitch.borrow_and_update() {
            return Ok(());
        }

        loop {
            select! {
                biased;
                changed = killswitch.changed() => {
                    if changed.is_err() || *killswitch.borrow_and_update() {
                        break;
                    }
                }
                event = receiver.recv() => {
                    let Some(event) = event else {
                        tracing::debug!("Broker {} has no publishers left", self.server_id);
                        break;
                    };
                    // failed events are dropped, the handler already saw them
                    if let Err(err) = self.target().deliver(event).await {
                        tracing::warn!("Broker {} dropped event: {}", self.server_id, err);
                    }
                }
            }
        }

        tracing::info!("Broker {} stopped", self.server_id);
        Ok(())
    }

    async fn stop(&self) {
        tracing::debug!("Stopping broker {}", self.server_id);
        self.killswitch.send_replace(true);
    }
}

/// Handle used by producers to push events into a [`ChannelBroker`].
#[derive(Clone, Debug)]
pub struct Publisher {
    server_id: String,
    sender: mpsc::Sender<Event>,
}

impl Publisher {
    pub async fn publish(&self, event: Event) -> Result<(), BrokerError> {
        self.sender
            .send(event)
            .await
            .map_err(|_| BrokerError::Closed(self.server_id.clone()))
    }

    /// True once the broker has taken every queued event.
    pub fn is_drained(&self) -> bool {
        self.sender.capacity() == self.sender.max_capacity()
    }
}

/// Registry of [`ChannelBroker`]s keyed by server id.
#[derive(Default)]
pub struct ChannelBrokerFactory {
    capacity: usize,
    brokers: Mutex<HashMap<String, Arc<ChannelBroker>>>,
}

impl ChannelBrokerFactory {
    pub fn new() -> Self {
        Self::default().with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn broker(&self, server_id: &str) -> Option<Arc<ChannelBroker>> {
        lock(&self.brokers).get(server_id).cloned()
    }

    pub fn publisher(&self, server_id: &str) -> Option<Publisher> {
        self.broker(server_id)
            .and_then(|broker| broker.publisher().ok())
    }

    pub fn remove(&self, server_id: &str) -> Option<Arc<ChannelBroker>> {
        lock(&self.brokers).remove(server_id)
    }
}

impl BrokerFactory for ChannelBrokerFactory {
    fn create(
        &self,
        server_id: &str,
        target: Arc<dyn DispatchTarget>,
    ) -> Result<Arc<dyn Broker>, BrokerError> {
        if server_id.is_empty() {
            return Err(BrokerError::Create {
                server_id: String::new(),
                reason: "server id is empty".into(),
            });
        }

        let mut brokers = lock(&self.brokers);
        let broker = match brokers.get(server_id) {
            Some(broker) if !broker.is_closed() => {
                tracing::debug!("Reusing broker {}", server_id);
                broker.rebind(target);
                broker.clone()
            }
            _ => {
                tracing::debug!("Creating broker {}", server_id);
                let broker = Arc::new(ChannelBroker::new(server_id, target, self.capacity));
                brokers.insert(server_id.to_string(), broker.clone());
                broker
            }
        };
        Ok(broker)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ListenerError;
    use serde_json::json;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<Event>>,
    }

    #[async_trait]
    impl DispatchTarget for Recorder {
        async fn deliver(&self, event: Event) -> Result<(), ListenerError> {
            let reject = event.contains_key("reject");
            self.events.lock().unwrap().push(event);
            if reject {
                return Err(ListenerError::NotInitialized);
            }
            Ok(())
        }
    }

    fn event(value: serde_json::Value) -> Event {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn forwards_events_until_stopped() {
        let recorder = Arc::new(Recorder::default());
        let factory = ChannelBrokerFactory::new();
        let broker = factory.create("srv-1", recorder.clone()).unwrap();
        let publisher = factory.publisher("srv-1").unwrap();

        let runner = broker.clone();
        let task = tokio::spawn(async move { runner.start().await });

        publisher.publish(event(json!({ "reject": true }))).await.unwrap();
        publisher.publish(event(json!({ "temp": 42 }))).await.unwrap();
        while recorder.events.lock().unwrap().len() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert!(publisher.is_drained());
        broker.stop().await;
        task.await.unwrap().unwrap();

        let events = recorder.events.lock().unwrap();
        assert_eq!(events[1], event(json!({ "temp": 42 })));
    }

    #[tokio::test]
    async fn stop_before_start_returns_immediately() {
        let factory = ChannelBrokerFactory::new();
        let broker = factory.create("srv-1", Arc::new(Recorder::default())).unwrap();
        broker.stop().await;
        tokio::time::timeout(Duration::from_secs(1), broker.start())
            .await
            .expect("start should observe the earlier stop")
            .unwrap();
    }

    #[tokio::test]
    async fn same_id_returns_same_broker() {
        let factory = ChannelBrokerFactory::new().with_capacity(4);
        let first = factory.create("srv-1", Arc::new(Recorder::default())).unwrap();
        let second = factory.create("srv-1", Arc::new(Recorder::default())).unwrap();
        let other = factory.create("srv-2", Arc::new(Recorder::default())).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert!(!Arc::ptr_eq(&first, &other));
        assert_eq!(other.server_id(), "srv-2");
    }

    #[tokio::test]
    async fn second_run_loop_is_rejected() {
        let factory = ChannelBrokerFactory::new();
        let broker = factory.create("srv-1", Arc::new(Recorder::default())).unwrap();
        let runner = broker.clone();
        let task = tokio::spawn(async move { runner.start().await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(matches!(broker.start().await, Err(BrokerError::AlreadyRunning(_))));

        broker.stop().await;
        task.await.unwrap().unwrap();
    }

    #[test]
    fn empty_server_id_is_rejected() {
        let factory = ChannelBrokerFactory::new();
        let err = factory.create("", Arc::new(Recorder::default())).err().unwrap();
        assert!(matches!(err, BrokerError::Create { .. }));
    }

    #[tokio::test]
    async fn publish_after_removal_fails() {
        let factory = ChannelBrokerFactory::new();
        factory.create("srv-1", Arc::new(Recorder::default())).unwrap();
        let publisher = factory.publisher("srv-1").unwrap();
        let broker = factory.remove("srv-1").unwrap();
        drop(broker);

        let err = publisher.publish(Event::new()).await.unwrap_err();
        assert!(matches!(err, BrokerError::Closed(id) if id == "srv-1"));
        assert!(factory.publisher("srv-1").is_none());
    }

    #[tokio::test]
    async fn dropping_last_publisher_ends_run_loop() {
        let factory = ChannelBrokerFactory::new();
        let broker = factory.create("srv-1", Arc::new(Recorder::default())).unwrap();
        let publisher = factory.publisher("srv-1").unwrap();
        let second = publisher.clone();

        let runner = broker.clone();
        let task = tokio::spawn(async move { runner.start().await });

        drop(publisher);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!task.is_finished());

        drop(second);
        tokio::time::timeout(Duration::from_millis(500), task)
            .await
            .expect("run loop should end once every publisher is gone")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn closed_broker_is_replaced() {
        let factory = ChannelBrokerFactory::new();
        let first = factory.create("srv-1", Arc::new(Recorder::default())).unwrap();
        drop(factory.publisher("srv-1").unwrap());

        let closed = factory.broker("srv-1").unwrap();
        assert!(closed.is_closed());
        assert!(matches!(closed.publisher(), Err(BrokerError::Closed(_))));

        let second = factory.create("srv-1", Arc::new(Recorder::default())).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(factory.publisher("srv-1").is_some());
    }
}

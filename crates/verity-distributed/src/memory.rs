//! In-process broker
//!
//! A thread-safe [`Broker`] backed by a mutex-guarded queue map and a
//! condition variable. Clones share the same broker, so a master and any
//! number of workers on separate threads can talk through it.

use crate::broker::{Broker, Destination, Message};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Errors raised by [`InMemoryBroker`]
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MemoryBrokerError {
    #[error("broker is closed")]
    Closed,
    #[error("unknown destination {0}")]
    UnknownDestination(Destination),
}

#[derive(Default)]
struct State {
    queues: HashMap<Destination, VecDeque<Message>>,
    topics: HashMap<String, Vec<Destination>>,
    next_id: u64,
    closed: bool,
}

impl State {
    fn queue_mut(
        &mut self,
        destination: &Destination,
    ) -> Result<&mut VecDeque<Message>, MemoryBrokerError> {
        match destination {
            Destination::Queue(_) => Ok(self.queues.entry(destination.clone()).or_default()),
            Destination::Subscription(_) | Destination::Temporary(_) => self
                .queues
                .get_mut(destination)
                .ok_or_else(|| MemoryBrokerError::UnknownDestination(destination.clone())),
            Destination::Topic(_) => {
                Err(MemoryBrokerError::UnknownDestination(destination.clone()))
            }
        }
    }
}

struct Inner {
    state: Mutex<State>,
    signal: Condvar,
}

/// Broker living in the current process
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                signal: Condvar::new(),
            }),
        }
    }

    /// Number of messages waiting on a destination
    pub fn pending(&self, destination: &Destination) -> usize {
        self.inner
            .state
            .lock()
            .queues
            .get(destination)
            .map(VecDeque::len)
            .unwrap_or(0)
    }

    /// Whether [`Broker::close`] has been called
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl Broker for InMemoryBroker {
    type Error = MemoryBrokerError;

    fn send(&self, destination: &Destination, message: Message) -> Result<(), Self::Error> {
        let mut state = self.inner.state.lock();
        if state.closed {
            return Err(MemoryBrokerError::Closed);
        }
        match destination {
            Destination::Topic(name) => {
                let subscribers = state.topics.get(name).cloned().unwrap_or_default();
                for subscriber in &subscribers {
                    if let Some(queue) = state.queues.get_mut(subscriber) {
                        queue.push_back(message.clone());
                    }
                }
            }
            _ => state.queue_mut(destination)?.push_back(message),
        }
        drop(state);
        self.inner.signal.notify_all();
        Ok(())
    }

    fn subscribe(&self, topic: &str) -> Result<Destination, Self::Error> {
        let mut state = self.inner.state.lock();
        if state.closed {
            return Err(MemoryBrokerError::Closed);
        }
        state.next_id += 1;
        let subscription = Destination::Subscription(state.next_id);
        state.queues.insert(subscription.clone(), VecDeque::new());
        state
            .topics
            .entry(topic.to_string())
            .or_default()
            .push(subscription.clone());
        Ok(subscription)
    }

    fn receive(
        &self,
        from: &Destination,
        timeout: Duration,
    ) -> Result<Option<Message>, Self::Error> {
        Ok(self
            .receive_any(std::slice::from_ref(from), timeout)?
            .map(|(_, message)| message))
    }

    fn receive_any(
        &self,
        from: &[Destination],
        timeout: Duration,
    ) -> Result<Option<(Destination, Message)>, Self::Error> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        loop {
            if state.closed {
                return Err(MemoryBrokerError::Closed);
            }
            for destination in from {
                if let Some(message) = state.queue_mut(destination)?.pop_front() {
                    return Ok(Some((destination.clone(), message)));
                }
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            self.inner.signal.wait_until(&mut state, deadline);
        }
    }

    fn create_temporary_queue(&self) -> Result<Destination, Self::Error> {
        let mut state = self.inner.state.lock();
        if state.closed {
            return Err(MemoryBrokerError::Closed);
        }
        state.next_id += 1;
        let queue = Destination::Temporary(state.next_id);
        state.queues.insert(queue.clone(), VecDeque::new());
        Ok(queue)
    }

    fn delete(&self, destination: &Destination) -> Result<(), Self::Error> {
        let mut state = self.inner.state.lock();
        match destination {
            Destination::Topic(name) => {
                if let Some(subscribers) = state.topics.remove(name) {
                    for subscriber in subscribers {
                        state.queues.remove(&subscriber);
                    }
                }
            }
            _ => {
                state.queues.remove(destination);
                for subscribers in state.topics.values_mut() {
                    subscribers.retain(|s| s != destination);
                }
            }
        }
        Ok(())
    }

    fn close(&self) -> Result<(), Self::Error> {
        self.inner.state.lock().closed = true;
        self.inner.signal.notify_all();
        tracing::debug!("in-memory broker closed");
        Ok(())
    }
}

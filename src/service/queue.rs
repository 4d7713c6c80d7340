// src/service/queue.rs

//! FIFO request queue shared by the worker pool

use super::{RequestId, SipLocation};
use crate::cancel::CancellationToken;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

/// A request waiting for (or handed to) a worker
#[derive(Debug, Clone)]
pub struct QueuedRequest {
    pub request_id: RequestId,
    pub identifier: String,
    pub sip: SipLocation,
    pub cancel_token: CancellationToken,
}

/// Pending requests plus the cancel tokens of every request not yet finished
pub struct RequestQueue {
    queue: Mutex<VecDeque<QueuedRequest>>,
    cancel_tokens: Mutex<HashMap<RequestId, CancellationToken>>,
    notify: Notify,
    closed: AtomicBool,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            cancel_tokens: Mutex::new(HashMap::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Append a request and wake one worker
    pub fn push(&self, request: QueuedRequest) {
        lock(&self.cancel_tokens)
            .insert(request.request_id.clone(), request.cancel_token.clone());
        lock(&self.queue).push_back(request);
        self.notify.notify_one();
    }

    /// Wait for the next request; `None` once the queue is closed
    pub async fn pop(&self) -> Option<QueuedRequest> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            if let Some(request) = lock(&self.queue).pop_front() {
                return Some(request);
            }

            notified.await;
        }
    }

    /// Take a request out of the queue before any worker picks it up
    pub fn remove(&self, request_id: &str) -> Option<QueuedRequest> {
        let mut queue = lock(&self.queue);
        let pos = queue.iter().position(|r| r.request_id == request_id)?;
        let request = queue.remove(pos);
        drop(queue);

        lock(&self.cancel_tokens).remove(request_id);
        request
    }

    pub fn cancel_token(&self, request_id: &str) -> Option<CancellationToken> {
        lock(&self.cancel_tokens).get(request_id).cloned()
    }

    /// Forget a finished request's token
    pub fn remove_token(&self, request_id: &str) {
        lock(&self.cancel_tokens).remove(request_id);
    }

    pub fn len(&self) -> usize {
        lock(&self.queue).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.queue).is_empty()
    }

    /// Stop handing out requests; waiting workers return `None`
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }
}

impl Default for RequestQueue {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

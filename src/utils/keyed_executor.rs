//! Task executor that keeps FIFO order per key while running different keys
//! concurrently on a bounded number of workers.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tracing::trace;

struct Inner<K> {
    // A key is present while a drainer task owns it.
    queues: Mutex<HashMap<K, VecDeque<BoxFuture<'static, ()>>>>,
    permits: Arc<Semaphore>,
}

pub struct KeyedExecutor<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for KeyedExecutor<K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K> KeyedExecutor<K>
where
    K: Eq + Hash + Clone + std::fmt::Debug + Send + Sync + 'static,
{
    pub fn new(workers: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                queues: Mutex::new(HashMap::new()),
                permits: Arc::new(Semaphore::new(workers.max(1))),
            }),
        }
    }

    /// Queues `task` behind earlier tasks of the same key.
    pub fn submit<F>(
        &self,
        key: K,
        task: F,
    ) where
        F: Future<Output = ()> + Send + 'static,
    {
        let task = task.boxed();
        {
            let mut queues = self.inner.queues.lock();
            if let Some(queue) = queues.get_mut(&key) {
                queue.push_back(task);
                return;
            }
            queues.insert(key.clone(), VecDeque::new());
        }
        tokio::spawn(drain(self.inner.clone(), key, task));
    }

    /// Keys with queued or running tasks.
    pub fn active_keys(&self) -> usize {
        self.inner.queues.lock().len()
    }

    /// Stops handing out workers. Queued tasks are dropped when their key drains.
    pub fn close(&self) {
        self.inner.permits.close();
    }
}

async fn drain<K>(
    inner: Arc<Inner<K>>,
    key: K,
    first: BoxFuture<'static, ()>,
) where
    K: Eq + Hash + std::fmt::Debug,
{
    let mut next = Some(first);
    while let Some(task) = next.take() {
        let permit = match inner.permits.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => {
                trace!(?key, "executor closed, dropping queued tasks");
                inner.queues.lock().remove(&key);
                return;
            }
        };
        task.await;
        drop(permit);

        let mut queues = inner.queues.lock();
        next = queues.get_mut(&key).and_then(|q| q.pop_front());
        if next.is_none() {
            queues.remove(&key);
        }
    }
}

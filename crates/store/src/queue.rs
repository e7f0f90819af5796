//! Per-session serial execution queue.
//!
//! Every session owns one [`SerialQueue`]: a FIFO of async operations
//! executed strictly in submission order, one at a time, by a dedicated
//! worker task. Enqueueing is synchronous — the returned [`TaskHandle`]
//! is created before `add` returns — so submission order is call order
//! even when callers collect handles before awaiting any of them.
//!
//! Items run under a per-item execution bound; a timed-out item fails its
//! handle but the queue continues with the next item. Handles can be
//! cancelled before their item is dequeued, which removes the item
//! silently; cancelling a running item has no effect.
//!
//! [`multi_add`] plants a barrier block at the head of several queues at
//! once, giving the caller mutual exclusion on all of them for the
//! duration of one closure. Blocks are planted sequentially in the order
//! given; callers must order overlapping queue sets consistently (the
//! transaction coordinator sorts participants by key), which makes
//! cross-queue acquisition deadlock-free the same way sorted lock
//! acquisition is.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    task::{Context, Poll},
    time::Duration,
};

use tokio::sync::{mpsc, oneshot, watch};

use crate::error::{StoreError, StoreResult};

type BoxedRun = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

struct Enqueued {
    run: BoxedRun,
    cancelled: Arc<AtomicBool>,
}

/// FIFO executor for one session's operations.
pub(crate) struct SerialQueue {
    sender: mpsc::UnboundedSender<Enqueued>,
    item_timeout: Duration,
}

impl SerialQueue {
    /// Creates a queue and spawns its worker task.
    ///
    /// The worker drains remaining items and exits when the queue is
    /// dropped.
    pub(crate) fn new(item_timeout: Duration) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Enqueued>();
        tokio::spawn(async move {
            while let Some(item) = receiver.recv().await {
                if item.cancelled.load(Ordering::Acquire) {
                    continue;
                }
                (item.run)().await;
            }
        });
        Self { sender, item_timeout }
    }

    /// Appends an operation; returns a handle resolving to its result.
    ///
    /// The operation runs under the queue's per-item timeout. A timed-out
    /// operation fails its handle with [`StoreError::QueueTimeout`] and is
    /// dropped where it stands; the queue moves on.
    pub(crate) fn add<T, F, Fut>(&self, operation: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = StoreResult<T>> + Send + 'static,
    {
        let timeout = self.item_timeout;
        self.enqueue(move || async move {
            match tokio::time::timeout(timeout, operation()).await {
                Ok(result) => result,
                Err(_) => Err(StoreError::QueueTimeout),
            }
        })
    }

    /// Appends an operation exempt from the per-item timeout.
    ///
    /// Reserved for the barrier blocks of [`multi_add`]: a block must hold
    /// its queue for as long as the coordinated closure runs, and cutting
    /// it loose at the timeout would silently break the mutual-exclusion
    /// guarantee.
    fn add_unbounded<T, F, Fut>(&self, operation: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = StoreResult<T>> + Send + 'static,
    {
        self.enqueue(operation)
    }

    fn enqueue<T, F, Fut>(&self, operation: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = StoreResult<T>> + Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();
        let cancelled = Arc::new(AtomicBool::new(false));
        let run: BoxedRun = Box::new(move || {
            Box::pin(async move {
                let _ = result_tx.send(operation().await);
            })
        });

        if self.sender.send(Enqueued { run, cancelled: Arc::clone(&cancelled) }).is_err() {
            return TaskHandle::ready(Err(StoreError::session_closed("queue stopped")));
        }
        TaskHandle { state: HandleState::Waiting { receiver: result_rx, cancelled } }
    }
}

enum HandleState<T> {
    Ready(Option<StoreResult<T>>),
    Waiting { receiver: oneshot::Receiver<StoreResult<T>>, cancelled: Arc<AtomicBool> },
}

/// Handle to a queued operation's eventual result.
///
/// Awaiting the handle yields the operation's result. A handle whose item
/// was cancelled before dequeue, or whose queue stopped first, yields
/// [`StoreError::Cancelled`].
pub struct TaskHandle<T> {
    state: HandleState<T>,
}

impl<T> TaskHandle<T> {
    /// Creates an already-resolved handle.
    pub(crate) fn ready(result: StoreResult<T>) -> Self {
        Self { state: HandleState::Ready(Some(result)) }
    }

    /// Cancels the queued item if it has not started executing.
    ///
    /// Cancellation removes the item silently; the handle resolves to
    /// [`StoreError::Cancelled`]. Cancelling after execution has begun
    /// has no effect.
    pub fn cancel(&self) {
        if let HandleState::Waiting { cancelled, .. } = &self.state {
            cancelled.store(true, Ordering::Release);
        }
    }
}

impl<T: Unpin> Future for TaskHandle<T> {
    type Output = StoreResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().state {
            HandleState::Ready(slot) => {
                Poll::Ready(slot.take().unwrap_or(Err(StoreError::Cancelled)))
            },
            HandleState::Waiting { receiver, .. } => match Pin::new(receiver).poll(cx) {
                Poll::Ready(Ok(result)) => Poll::Ready(result),
                // Sender dropped without a result: the item was cancelled,
                // skipped at dequeue, or its queue stopped.
                Poll::Ready(Err(_)) => Poll::Ready(Err(StoreError::Cancelled)),
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

/// Runs `body` while holding head-of-queue position on every queue at
/// once.
///
/// A barrier block is planted on each queue in the order given; each block
/// signals when it reaches the head and then holds its queue until `body`
/// finishes, success or failure. Overlapping calls must order shared
/// queues consistently or they can deadlock against each other — the
/// caller is responsible for a canonical order.
pub(crate) async fn multi_add<T, F, Fut>(queues: &[Arc<SerialQueue>], body: F) -> StoreResult<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = StoreResult<T>>,
{
    let (release_tx, _) = watch::channel(false);
    let mut blocks: Vec<TaskHandle<()>> = Vec::with_capacity(queues.len());

    let mut acquired = true;
    for queue in queues {
        let (entered_tx, entered_rx) = oneshot::channel::<()>();
        let mut release = release_tx.subscribe();
        blocks.push(queue.add_unbounded(move || async move {
            let _ = entered_tx.send(());
            while !*release.borrow_and_update() {
                if release.changed().await.is_err() {
                    break;
                }
            }
            Ok(())
        }));

        // The block's entry signal doubles as its failure signal: a queue
        // that stopped drops the closure, which drops the sender.
        if entered_rx.await.is_err() {
            acquired = false;
            break;
        }
    }

    let result = if acquired {
        body().await
    } else {
        Err(StoreError::session_closed("a participant queue stopped"))
    };

    let _ = release_tx.send(true);
    for block in blocks {
        let _ = block.await;
    }
    result
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use super::*;

    fn queue() -> SerialQueue {
        SerialQueue::new(Duration::from_secs(60))
    }

    #[tokio::test]
    async fn items_run_in_submission_order() {
        let q = queue();
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let handles: Vec<_> = (0..32)
            .map(|i| {
                let log = Arc::clone(&log);
                q.add(move || async move {
                    log.lock().push(i);
                    Ok(i)
                })
            })
            .collect();

        for (i, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.await.unwrap(), i);
        }
        assert_eq!(*log.lock(), (0..32).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn one_item_at_a_time() {
        let q = queue();
        let running = Arc::new(AtomicU32::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let running = Arc::clone(&running);
                q.add(move || async move {
                    let now = running.fetch_add(1, Ordering::SeqCst);
                    assert_eq!(now, 0, "two items executing concurrently");
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn errors_surface_without_halting_the_queue() {
        let q = queue();
        let failing =
            q.add(|| async { Err::<(), _>(StoreError::bad_transform("boom")) });
        let following = q.add(|| async { Ok(7) });

        assert!(matches!(failing.await, Err(StoreError::BadTransform { .. })));
        assert_eq!(following.await.unwrap(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_item_times_out_and_queue_continues() {
        let q = SerialQueue::new(Duration::from_secs(60));
        let stuck = q.add(|| async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(1)
        });
        let next = q.add(|| async { Ok(2) });

        assert!(matches!(stuck.await, Err(StoreError::QueueTimeout)));
        assert_eq!(next.await.unwrap(), 2);
    }

    #[tokio::test]
    async fn cancel_before_dequeue_removes_item_silently() {
        let q = queue();
        let ran = Arc::new(AtomicBool::new(false));

        // Occupy the worker so the second item stays queued.
        let (gate_tx, gate_rx) = oneshot::channel::<()>();
        let blocker = q.add(move || async move {
            let _ = gate_rx.await;
            Ok(())
        });

        let ran_clone = Arc::clone(&ran);
        let victim = q.add(move || async move {
            ran_clone.store(true, Ordering::SeqCst);
            Ok(())
        });
        victim.cancel();

        let _ = gate_tx.send(());
        blocker.await.unwrap();
        assert!(matches!(victim.await, Err(StoreError::Cancelled)));

        // Prove the worker moved past the cancelled slot.
        q.add(|| async { Ok(()) }).await.unwrap();
        assert!(!ran.load(Ordering::SeqCst), "cancelled item must never run");
    }

    #[tokio::test]
    async fn cancel_while_executing_has_no_effect() {
        let q = queue();
        let (started_tx, started_rx) = oneshot::channel::<()>();
        let (gate_tx, gate_rx) = oneshot::channel::<()>();

        let handle = q.add(move || async move {
            let _ = started_tx.send(());
            let _ = gate_rx.await;
            Ok(41)
        });

        started_rx.await.unwrap();
        handle.cancel();
        let _ = gate_tx.send(());
        assert_eq!(handle.await.unwrap(), 41);
    }

    #[tokio::test]
    async fn multi_add_excludes_all_queues_for_the_body() {
        let queues: Vec<_> = (0..3).map(|_| Arc::new(queue())).collect();
        let counter = Arc::new(AtomicU32::new(0));

        // Per-queue traffic that bumps the counter; the coordinated body
        // asserts the counter does not move while it holds every queue.
        let mut traffic = Vec::new();
        for q in &queues {
            for _ in 0..4 {
                let counter = Arc::clone(&counter);
                traffic.push(q.add(move || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }));
            }
        }

        let counter_in_body = Arc::clone(&counter);
        multi_add(&queues, || async move {
            let before = counter_in_body.load(Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            let after = counter_in_body.load(Ordering::SeqCst);
            assert_eq!(before, after, "traffic ran while all queues were held");
            Ok(())
        })
        .await
        .unwrap();

        for handle in traffic {
            handle.await.unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 12);
    }

    #[tokio::test]
    async fn multi_add_releases_on_body_failure() {
        let queues: Vec<_> = (0..2).map(|_| Arc::new(queue())).collect();

        let result: StoreResult<()> = multi_add(&queues, || async {
            Err(StoreError::bad_transform("body failed"))
        })
        .await;
        assert!(matches!(result, Err(StoreError::BadTransform { .. })));

        // Both queues keep serving afterwards.
        for q in &queues {
            q.add(|| async { Ok(()) }).await.unwrap();
        }
    }

    #[tokio::test]
    async fn overlapping_multi_adds_in_consistent_order_make_progress() {
        let q1 = Arc::new(queue());
        let q2 = Arc::new(queue());

        let mut coordinators = Vec::new();
        for _ in 0..8 {
            let set = vec![Arc::clone(&q1), Arc::clone(&q2)];
            coordinators.push(tokio::spawn(async move {
                multi_add(&set, || async {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    Ok(())
                })
                .await
            }));
        }
        for coordinator in coordinators {
            coordinator.await.unwrap().unwrap();
        }
    }
}

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use futures::{FutureExt, Stream, StreamExt};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, trace, warn};

use crate::ops::{Emitter, Operation, OperationKind};
use crate::result::{Error, Result};
use crate::util::OperationId;

struct Job {
    id: OperationId,
    kind: OperationKind,
    is_cancelled: Box<dyn Fn() -> bool + Send>,
    cancelled: BoxFuture<'static, ()>,
    task: BoxFuture<'static, ()>,
}

/// Runs operations one at a time, in the order they were first polled, on a
/// dedicated worker task.
#[derive(Clone)]
pub struct OperationQueue {
    jobs: mpsc::Sender<Job>,
    capacity: usize,
}

impl OperationQueue {
    /// Creates a queue holding at most `capacity` waiting operations and
    /// spawns its worker on `runtime`. The worker stops once every handle to
    /// the queue has been dropped.
    pub fn new(capacity: usize, runtime: &Handle) -> Self {
        let capacity = capacity.max(1);
        let (jobs, rx) = mpsc::channel(capacity);
        runtime.spawn(run(rx));

        OperationQueue { jobs, capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the result stream of `operation`. Nothing is queued until the
    /// stream is first polled; dropping the stream cancels the operation.
    pub fn schedule<O: Operation>(&self, operation: O) -> OperationStream<O::Output> {
        let jobs = self.jobs.clone();
        let capacity = self.capacity;
        let kind = operation.kind();

        let enqueue = move || {
            let id = OperationId::new();
            let (tx, rx) = mpsc::unbounded_channel();

            let probe = tx.clone();
            let closed = tx.clone();
            let job = Job {
                id,
                kind,
                is_cancelled: Box::new(move || probe.is_closed()),
                cancelled: async move { closed.closed().await }.boxed(),
                task: operation.execute(Emitter::new(id, kind, tx)),
            };

            match jobs.try_send(job) {
                Ok(()) => {
                    trace!(op = %kind, %id, "queued");
                    Ok(rx)
                }
                Err(TrySendError::Full(_)) => {
                    warn!(op = %kind, capacity, "operation queue is full");
                    Err(Error::QueueFull { capacity })
                }
                Err(TrySendError::Closed(_)) => Err(Error::QueueClosed),
            }
        };

        OperationStream {
            kind,
            state: StreamState::Idle(Box::new(enqueue)),
        }
    }
}

impl std::fmt::Debug for OperationQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationQueue")
            .field("capacity", &self.capacity)
            .field("closed", &self.jobs.is_closed())
            .finish()
    }
}

async fn run(mut jobs: mpsc::Receiver<Job>) {
    while let Some(job) = jobs.recv().await {
        let Job {
            id,
            kind,
            is_cancelled,
            cancelled,
            task,
        } = job;

        if is_cancelled() {
            trace!(op = %kind, %id, "skipping cancelled operation");
            continue;
        }

        debug!(op = %kind, %id, "executing");
        tokio::select! {
            _ = task => trace!(op = %kind, %id, "finished"),
            _ = cancelled => debug!(op = %kind, %id, "cancelled while executing"),
        }
    }

    trace!("operation queue stopped");
}

type Enqueue<T> = Box<dyn FnOnce() -> Result<mpsc::UnboundedReceiver<Result<T>>> + Send>;

enum StreamState<T> {
    Idle(Enqueue<T>),
    Running(mpsc::UnboundedReceiver<Result<T>>),
    Done,
}

/// Results of one scheduled operation. Ends after the operation's terminal
/// event.
#[must_use = "operations do nothing until their stream is polled"]
pub struct OperationStream<T> {
    kind: OperationKind,
    state: StreamState<T>,
}

impl<T> OperationStream<T> {
    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    /// Awaits the first result of a single-result operation.
    pub async fn single(mut self) -> Result<T> {
        match self.next().await {
            Some(result) => result,
            None => Err(Error::NoResult { kind: self.kind }),
        }
    }

    /// Drives the operation to its end, discarding values; returns its
    /// failure if it had one.
    pub async fn completion(mut self) -> Result<()> {
        while let Some(result) = self.next().await {
            result?;
        }
        Ok(())
    }
}

impl<T> Stream for OperationStream<T> {
    type Item = Result<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            match std::mem::replace(&mut this.state, StreamState::Done) {
                StreamState::Idle(enqueue) => match enqueue() {
                    Ok(rx) => this.state = StreamState::Running(rx),
                    Err(error) => return Poll::Ready(Some(Err(error))),
                },
                StreamState::Running(mut rx) => {
                    let poll = rx.poll_recv(cx);
                    if !matches!(poll, Poll::Ready(None)) {
                        this.state = StreamState::Running(rx);
                    }
                    return poll;
                }
                StreamState::Done => return Poll::Ready(None),
            }
        }
    }
}

impl<T> std::fmt::Debug for OperationStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.state {
            StreamState::Idle(_) => "idle",
            StreamState::Running(_) => "running",
            StreamState::Done => "done",
        };
        f.debug_struct("OperationStream")
            .field("kind", &self.kind)
            .field("state", &state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use futures::future::join_all;
    use tokio::sync::oneshot;

    use super::*;

    struct NoOp;

    impl Operation for NoOp {
        type Output = ();

        fn kind(&self) -> OperationKind {
            OperationKind::Disconnect
        }

        fn execute(self, emitter: Emitter<()>) -> BoxFuture<'static, ()> {
            async move { emitter.finish(Ok(())) }.boxed()
        }
    }

    /// Records its tag when it starts, then optionally waits to be released.
    struct Record {
        tag: usize,
        log: Arc<Mutex<Vec<usize>>>,
        release: Option<oneshot::Receiver<()>>,
    }

    impl Operation for Record {
        type Output = usize;

        fn kind(&self) -> OperationKind {
            OperationKind::ReadCharacteristic
        }

        fn execute(self, emitter: Emitter<usize>) -> BoxFuture<'static, ()> {
            async move {
                self.log.lock().unwrap().push(self.tag);
                if let Some(release) = self.release {
                    let _ = release.await;
                }
                emitter.finish(Ok(self.tag))
            }
            .boxed()
        }
    }

    struct Forever;

    impl Operation for Forever {
        type Output = ();

        fn kind(&self) -> OperationKind {
            OperationKind::Scan
        }

        fn execute(self, _emitter: Emitter<()>) -> BoxFuture<'static, ()> {
            futures::future::pending().boxed()
        }
    }

    #[tokio::test]
    pub async fn no_ops_complete() {
        let queue = OperationQueue::new(100, &Handle::current());

        let results = join_all((0..4).map(|_| queue.schedule(NoOp).collect::<Vec<_>>())).await;

        assert_eq!(results.len(), 4);
        for result in results {
            assert_eq!(result, vec![Ok(())]);
        }
    }

    #[tokio::test]
    pub async fn submission_order() {
        let queue = OperationQueue::new(100, &Handle::current());
        let log = Arc::new(Mutex::new(Vec::new()));

        let streams = (0..16).map(|tag| {
            queue
                .schedule(Record {
                    tag,
                    log: log.clone(),
                    release: None,
                })
                .single()
        });
        let results = join_all(streams).await;

        assert_eq!(*log.lock().unwrap(), (0..16).collect::<Vec<_>>());
        assert_eq!(results, (0..16).map(Ok).collect::<Vec<_>>());
    }

    #[test]
    pub fn overflow_is_reported() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();

        runtime.block_on(async {
            // the worker cannot run before this task yields, so the first job
            // stays in the channel
            let queue = OperationQueue::new(1, &Handle::current());
            let mut first = queue.schedule(Forever);
            let mut second = queue.schedule(NoOp);

            assert!(futures::poll!(first.next()).is_pending());
            match futures::poll!(second.next()) {
                Poll::Ready(Some(Err(error))) => {
                    assert_eq!(error, Error::QueueFull { capacity: 1 })
                }
                other => panic!("expected overflow, got {:?}", other),
            }
            assert!(matches!(futures::poll!(second.next()), Poll::Ready(None)));
        });
    }

    #[tokio::test]
    pub async fn cancelled_before_start_is_skipped() {
        let queue = OperationQueue::new(10, &Handle::current());
        let log = Arc::new(Mutex::new(Vec::new()));
        let (release, blocked) = oneshot::channel();

        let mut first = queue.schedule(Record {
            tag: 0,
            log: log.clone(),
            release: Some(blocked),
        });
        assert!(futures::poll!(first.next()).is_pending());

        let mut second = queue.schedule(Record {
            tag: 1,
            log: log.clone(),
            release: None,
        });
        assert!(futures::poll!(second.next()).is_pending());
        drop(second);

        release.send(()).unwrap();
        assert_eq!(first.single().await, Ok(0));

        let third = queue.schedule(Record {
            tag: 2,
            log: log.clone(),
            release: None,
        });
        assert_eq!(third.single().await, Ok(2));
        assert_eq!(*log.lock().unwrap(), vec![0, 2]);
    }

    #[tokio::test]
    pub async fn cancelled_in_flight_releases_the_worker() {
        let queue = OperationQueue::new(10, &Handle::current());

        let mut stuck = queue.schedule(Forever);
        assert!(futures::poll!(stuck.next()).is_pending());
        tokio::task::yield_now().await;
        drop(stuck);

        let done = tokio::time::timeout(
            std::time::Duration::from_secs(1),
            queue.schedule(NoOp).single(),
        )
        .await;
        assert_eq!(done, Ok(Ok(())));
    }

    #[tokio::test]
    pub async fn empty_operation_has_no_result() {
        struct Silent;

        impl Operation for Silent {
            type Output = u8;

            fn kind(&self) -> OperationKind {
                OperationKind::RequestMtu
            }

            fn execute(self, emitter: Emitter<u8>) -> BoxFuture<'static, ()> {
                async move { drop(emitter) }.boxed()
            }
        }

        let queue = OperationQueue::new(10, &Handle::current());
        assert_eq!(
            queue.schedule(Silent).single().await,
            Err(Error::NoResult {
                kind: OperationKind::RequestMtu
            })
        );
    }
}

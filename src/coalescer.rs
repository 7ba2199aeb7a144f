use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::RwLock;
use tokio::runtime::Handle;
use tokio::sync::watch;

type CycleFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
pub type CycleExecutor = Arc<dyn Fn() -> CycleFuture + Send + Sync>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoalescerStatus {
    pub running: bool,
    pub stopped: bool,
    pub cycles_completed: u64,
    /// Highest request ticket whose refresh has been served by a completed cycle.
    pub completed_through: u64,
    pub last_completed_at: Option<DateTime<Utc>>,
}

/// Collapses refresh requests from every trigger source into one serialized
/// stream of cycles: `Idle -> Running -> (pending ? Running : Idle)`.
#[derive(Clone)]
pub struct RefreshCoalescer {
    inner: Arc<Inner>,
}

struct Inner {
    pending: AtomicBool,
    running: AtomicBool,
    stopped: AtomicBool,
    tickets: AtomicU64,
    executor: RwLock<Option<CycleExecutor>>,
    status: watch::Sender<CoalescerStatus>,
    runtime: Handle,
}

impl RefreshCoalescer {
    pub fn new(runtime: Handle) -> Self {
        let (status, _) = watch::channel(CoalescerStatus::default());
        Self {
            inner: Arc::new(Inner {
                pending: AtomicBool::new(false),
                running: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                tickets: AtomicU64::new(0),
                executor: RwLock::new(None),
                status,
                runtime,
            }),
        }
    }

    pub fn set_executor(&self, executor: CycleExecutor) {
        match self.inner.executor.write() {
            Ok(mut writer) => *writer = Some(executor),
            Err(poisoned) => *poisoned.into_inner() = Some(executor),
        }
    }

    /// Non-blocking and safe from any thread. Returns a ticket for `wait_for`.
    pub fn request_refresh(&self) -> u64 {
        let ticket = self.inner.tickets.fetch_add(1, Ordering::SeqCst) + 1;
        if self.inner.stopped.load(Ordering::SeqCst) {
            return ticket;
        }
        self.inner.pending.store(true, Ordering::SeqCst);
        self.try_start();
        ticket
    }

    /// Resolves once a cycle that began after `ticket` was issued has completed,
    /// or immediately if the coalescer has been stopped.
    pub async fn wait_for(&self, ticket: u64) {
        let mut receiver = self.inner.status.subscribe();
        let _ = receiver
            .wait_for(|status| status.stopped || status.completed_through >= ticket)
            .await;
    }

    pub async fn refresh_and_wait(&self) {
        let ticket = self.request_refresh();
        self.wait_for(ticket).await;
    }

    pub fn is_running(&self) -> bool {
        self.inner.status.borrow().running
    }

    pub fn status(&self) -> CoalescerStatus {
        *self.inner.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<CoalescerStatus> {
        self.inner.status.subscribe()
    }

    /// Refuses new cycles and waits for an in-flight one to finish.
    pub async fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.status.send_modify(|status| status.stopped = true);
        let mut receiver = self.inner.status.subscribe();
        let _ = receiver.wait_for(|status| !status.running).await;
    }

    fn try_start(&self) {
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.inner.status.send_modify(|status| status.running = true);
            let coalescer = self.clone();
            self.inner.runtime.spawn(async move {
                coalescer.drain().await;
            });
        }
    }

    async fn drain(self) {
        loop {
            while !self.inner.stopped.load(Ordering::SeqCst) && self.inner.pending.swap(false, Ordering::SeqCst) {
                let covered = self.inner.tickets.load(Ordering::SeqCst);
                self.execute().await;
                self.inner.status.send_modify(|status| {
                    status.cycles_completed += 1;
                    status.completed_through = status.completed_through.max(covered);
                    status.last_completed_at = Some(Utc::now());
                });
            }

            self.inner.running.store(false, Ordering::SeqCst);
            self.inner.status.send_modify(|status| status.running = false);

            // A request may have landed between the last swap and clearing `running`.
            if self.inner.stopped.load(Ordering::SeqCst) || !self.inner.pending.load(Ordering::SeqCst) {
                break;
            }
            if self
                .inner
                .running
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                break;
            }
            self.inner.status.send_modify(|status| status.running = true);
        }
    }

    async fn execute(&self) {
        let executor = match self.inner.executor.read() {
            Ok(reader) => reader.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        let Some(executor) = executor else {
            tracing::warn!("refresh requested before a cycle executor was set");
            return;
        };
        if let Err(error) = self.inner.runtime.spawn(executor()).await {
            tracing::error!(error = %error, "refresh cycle aborted");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{CycleExecutor, RefreshCoalescer};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::runtime::Handle;
    use tokio::sync::{mpsc, Semaphore};
    use tokio::time::{sleep, Duration};

    fn counting_executor(count: Arc<AtomicUsize>) -> CycleExecutor {
        Arc::new(move || {
            let count = count.clone();
            Box::pin(async move {
                count.fetch_add(1, Ordering::SeqCst);
            })
        })
    }

    /// Each cycle announces itself and then waits for a permit.
    fn gated_executor(
        count: Arc<AtomicUsize>,
        gate: Arc<Semaphore>,
        started: mpsc::UnboundedSender<usize>,
    ) -> CycleExecutor {
        Arc::new(move || {
            let count = count.clone();
            let gate = gate.clone();
            let started = started.clone();
            Box::pin(async move {
                let index = count.fetch_add(1, Ordering::SeqCst) + 1;
                let _ = started.send(index);
                if let Ok(permit) = gate.acquire().await {
                    permit.forget();
                }
            })
        })
    }

    #[tokio::test]
    async fn single_request_runs_one_cycle() {
        let coalescer = RefreshCoalescer::new(Handle::current());
        let count = Arc::new(AtomicUsize::new(0));
        coalescer.set_executor(counting_executor(count.clone()));

        coalescer.refresh_and_wait().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        let status = coalescer.status();
        assert_eq!(status.cycles_completed, 1);
        assert!(status.last_completed_at.is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn requests_during_a_cycle_collapse_into_one_follow_up() {
        let coalescer = RefreshCoalescer::new(Handle::current());
        let count = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Semaphore::new(0));
        let (started_tx, mut started_rx) = mpsc::unbounded_channel();
        coalescer.set_executor(gated_executor(count.clone(), gate.clone(), started_tx));

        coalescer.request_refresh();
        assert_eq!(started_rx.recv().await, Some(1));

        let mut producers = Vec::new();
        for _ in 0..10 {
            let coalescer = coalescer.clone();
            producers.push(tokio::spawn(async move { coalescer.request_refresh() }));
        }
        let mut last_ticket = 0;
        for producer in producers {
            last_ticket = last_ticket.max(producer.await.expect("producer task"));
        }

        gate.add_permits(10);
        coalescer.wait_for(last_ticket).await;
        sleep(Duration::from_millis(50)).await;

        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert!(!coalescer.is_running());
        assert_eq!(coalescer.status().cycles_completed, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn cycles_never_overlap() {
        let coalescer = RefreshCoalescer::new(Handle::current());
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let executor: CycleExecutor = {
            let active = active.clone();
            let peak = peak.clone();
            Arc::new(move || {
                let active = active.clone();
                let peak = peak.clone();
                Box::pin(async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    sleep(Duration::from_millis(5)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                })
            })
        };
        coalescer.set_executor(executor);

        let mut last_ticket = 0;
        for _ in 0..25 {
            last_ticket = coalescer.request_refresh();
            sleep(Duration::from_millis(1)).await;
        }
        coalescer.wait_for(last_ticket).await;
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn wait_requires_a_cycle_started_after_the_request() {
        let coalescer = RefreshCoalescer::new(Handle::current());
        let count = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Semaphore::new(0));
        let (started_tx, mut started_rx) = mpsc::unbounded_channel();
        coalescer.set_executor(gated_executor(count.clone(), gate.clone(), started_tx));

        coalescer.request_refresh();
        assert_eq!(started_rx.recv().await, Some(1));

        let waiter = {
            let coalescer = coalescer.clone();
            tokio::spawn(async move { coalescer.refresh_and_wait().await })
        };
        sleep(Duration::from_millis(20)).await;

        gate.add_permits(1);
        assert_eq!(started_rx.recv().await, Some(2));
        assert!(!waiter.is_finished());

        gate.add_permits(1);
        waiter.await.expect("waiter");
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_lets_the_current_cycle_finish_and_refuses_new_ones() {
        let coalescer = RefreshCoalescer::new(Handle::current());
        let count = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Semaphore::new(0));
        let (started_tx, mut started_rx) = mpsc::unbounded_channel();
        coalescer.set_executor(gated_executor(count.clone(), gate.clone(), started_tx));

        coalescer.request_refresh();
        assert_eq!(started_rx.recv().await, Some(1));
        coalescer.request_refresh();

        let stopper = {
            let coalescer = coalescer.clone();
            tokio::spawn(async move { coalescer.stop().await })
        };
        sleep(Duration::from_millis(20)).await;
        assert!(!stopper.is_finished());

        gate.add_permits(5);
        stopper.await.expect("stop");
        assert_eq!(count.load(Ordering::SeqCst), 1);

        coalescer.refresh_and_wait().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(coalescer.status().stopped);
    }

    #[tokio::test]
    async fn missing_executor_still_completes_cycles() {
        let coalescer = RefreshCoalescer::new(Handle::current());
        coalescer.refresh_and_wait().await;
        assert_eq!(coalescer.status().cycles_completed, 1);
    }
}

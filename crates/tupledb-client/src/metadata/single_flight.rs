use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use futures::future::{BoxFuture, FutureExt, Shared};

/// Coalesces concurrent calls into one in-flight future.
///
/// The first caller starts the work; callers arriving while it runs attach to
/// the same future and receive a clone of its output. Once it completes the
/// slot is cleared, so the next call starts a new generation.
///
/// [`run_fresh`](Self::run_fresh) callers never attach to a run that was
/// already going when they arrived. They share one follow-up run queued
/// behind it, which takes over the slot when the current run finishes.
pub struct SingleFlight<T: Clone> {
    generation: AtomicU64,
    inflight: Mutex<Flights<T>>,
}

type Flight<T> = (u64, Shared<BoxFuture<'static, T>>);

struct Flights<T: Clone> {
    current: Option<Flight<T>>,
    queued: Option<Flight<T>>,
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            generation: AtomicU64::new(0),
            inflight: Mutex::new(Flights {
                current: None,
                queued: None,
            }),
        }
    }

    /// Joins the in-flight call, or starts one with `start`.
    ///
    /// `start` is only invoked when nothing is in flight.
    pub async fn run<F, Fut>(&self, start: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let (generation, future) = {
            let mut flights = self.lock();
            match &flights.current {
                Some((generation, future)) => (*generation, future.clone()),
                None => self.begin(&mut flights, start().boxed()),
            }
        };

        self.finish(generation, future).await
    }

    /// Like [`run`](Self::run), but the output always comes from work started
    /// after this call.
    ///
    /// With nothing in flight this starts a run. Otherwise it joins the run
    /// queued behind the current one, queueing it with `start` if needed.
    pub async fn run_fresh<F, Fut>(&self, start: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let (generation, future) = {
            let mut flights = self.lock();
            match (&flights.current, &flights.queued) {
                (None, _) => self.begin(&mut flights, start().boxed()),
                (Some(_), Some((generation, future))) => (*generation, future.clone()),
                (Some((_, running)), None) => {
                    let running = running.clone();
                    let work = start();
                    let chained = async move {
                        let _ = running.await;
                        work.await
                    };
                    let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
                    let future = chained.boxed().shared();
                    flights.queued = Some((generation, future.clone()));
                    (generation, future)
                }
            }
        };

        self.finish(generation, future).await
    }

    pub fn is_in_flight(&self) -> bool {
        self.lock().current.is_some()
    }

    /// Number of calls started so far.
    pub fn generations(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, Flights<T>> {
        self.inflight.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn begin(&self, flights: &mut Flights<T>, work: BoxFuture<'static, T>) -> Flight<T> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let future = work.shared();
        flights.current = Some((generation, future.clone()));
        (generation, future)
    }

    /// Awaits `future` and clears its slot, promoting the queued run when the
    /// current one is done.
    async fn finish(&self, generation: u64, future: Shared<BoxFuture<'static, T>>) -> T {
        let output = future.await;

        let mut flights = self.lock();
        if matches!(&flights.queued, Some((queued, _)) if *queued == generation) {
            flights.queued = None;
        }
        if matches!(&flights.current, Some((current, _)) if *current == generation) {
            flights.current = flights.queued.take();
        }
        output
    }
}

impl<T> Default for SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

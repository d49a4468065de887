//! Coalesce concurrent callers onto one in-flight operation.
//!
//! The first caller starts a flight (spawned, so it survives the caller being
//! cancelled); everyone arriving while it runs awaits the same result. The
//! task clears the slot itself when done, so the next caller starts fresh.

use std::{future::Future, sync::Arc};

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("flight {0} aborted before completing")]
pub struct FlightAborted(pub Uuid);

type FlightFuture<T> = Shared<BoxFuture<'static, Result<T, FlightAborted>>>;

struct Flight<T> {
    id: Uuid,
    fut: FlightFuture<T>,
}

#[derive(Debug, Clone)]
pub struct Joined<T> {
    pub id: Uuid,
    pub led: bool,
    pub result: Result<T, FlightAborted>,
}

pub struct SingleFlight<T> {
    slot: Arc<Mutex<Option<Flight<T>>>>,
}

impl<T> Default for SingleFlight<T> {
    fn default() -> Self {
        Self { slot: Arc::new(Mutex::new(None)) }
    }
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_flight(&self) -> Option<Uuid> {
        self.slot.lock().as_ref().map(|f| f.id)
    }

    /// Join the live flight, or start one from `make`. `make` runs only when
    /// this caller leads, and receives the new flight's id.
    pub async fn run<F, Fut>(&self, make: F) -> Joined<T>
    where
        F: FnOnce(Uuid) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let (id, led, fut) = {
            let mut slot = self.slot.lock();
            match slot.as_ref() {
                Some(f) => (f.id, false, f.fut.clone()),
                None => {
                    let id = Uuid::new_v4();
                    let work = make(id);
                    let release = Arc::clone(&self.slot);
                    // The task's release blocks on this lock until the flight is installed below.
                    let handle = tokio::spawn(async move {
                        let out = work.await;
                        let mut slot = release.lock();
                        if slot.as_ref().map(|f| f.id) == Some(id) {
                            *slot = None;
                        }
                        out
                    });
                    let fut = async move { handle.await.map_err(|_| FlightAborted(id)) }
                        .boxed()
                        .shared();
                    *slot = Some(Flight { id, fut: fut.clone() });
                    (id, true, fut)
                }
            }
        };

        let result = fut.await;
        if result.is_err() {
            // The task died without releasing; make sure the next caller isn't stuck.
            let mut slot = self.slot.lock();
            if slot.as_ref().map(|f| f.id) == Some(id) {
                *slot = None;
            }
        }
        Joined { id, led, result }
    }
}

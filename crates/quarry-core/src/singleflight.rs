//! Per-key single-flight: the first caller leads, later callers for the same
//! key attach and receive a clone of the leader's outcome.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

#[derive(Clone)]
enum FlightStatus<T> {
    Pending,
    Done(T),
    /// Leader dropped its guard without completing.
    Abandoned,
}

pub struct Singleflight<T> {
    flights: Mutex<HashMap<String, Arc<FlightState<T>>>>,
}

impl<T> Default for Singleflight<T> {
    fn default() -> Self {
        Self {
            flights: Mutex::new(HashMap::new()),
        }
    }
}

impl<T: Clone> Singleflight<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self, key: &str) -> FlightGuard<'_, T> {
        let mut map = self.flights.lock();
        if let Some(state) = map.get(key) {
            state.add_ref();
            FlightGuard::new_follower(self, key.to_string(), Arc::clone(state))
        } else {
            let state = Arc::new(FlightState::new());
            map.insert(key.to_string(), Arc::clone(&state));
            FlightGuard::new_leader(self, key.to_string(), state)
        }
    }

    /// Keys with a flight in progress.
    pub fn in_flight(&self) -> usize {
        self.flights.lock().len()
    }

    fn release(&self, key: &str, flight: &Arc<FlightState<T>>) {
        let mut map = self.flights.lock();
        if flight.release() == 0 {
            if let Some(existing) = map.get(key) {
                if Arc::ptr_eq(existing, flight) {
                    map.remove(key);
                }
            }
        }
    }
}

struct FlightState<T> {
    tx: watch::Sender<FlightStatus<T>>,
    refs: AtomicUsize,
}

impl<T: Clone> FlightState<T> {
    fn new() -> Self {
        let (tx, _rx) = watch::channel(FlightStatus::Pending);
        Self {
            tx,
            refs: AtomicUsize::new(1),
        }
    }

    fn add_ref(&self) {
        self.refs.fetch_add(1, Ordering::Relaxed);
    }

    fn release(&self) -> usize {
        self.refs.fetch_sub(1, Ordering::AcqRel) - 1
    }

    fn finish(&self, status: FlightStatus<T>) {
        self.tx.send_replace(status);
    }

    async fn wait(&self) -> Option<T> {
        let mut rx = self.tx.subscribe();
        let status = rx
            .wait_for(|s| !matches!(s, FlightStatus::Pending))
            .await
            .ok()?
            .clone();
        match status {
            FlightStatus::Done(value) => Some(value),
            FlightStatus::Pending | FlightStatus::Abandoned => None,
        }
    }
}

pub struct FlightGuard<'a, T: Clone> {
    singleflight: &'a Singleflight<T>,
    key: String,
    flight: Arc<FlightState<T>>,
    finish_on_drop: bool,
    is_leader: bool,
}

impl<'a, T: Clone> FlightGuard<'a, T> {
    fn new_leader(singleflight: &'a Singleflight<T>, key: String, flight: Arc<FlightState<T>>) -> Self {
        Self {
            singleflight,
            key,
            flight,
            finish_on_drop: true,
            is_leader: true,
        }
    }

    fn new_follower(
        singleflight: &'a Singleflight<T>,
        key: String,
        flight: Arc<FlightState<T>>,
    ) -> Self {
        Self {
            singleflight,
            key,
            flight,
            finish_on_drop: false,
            is_leader: false,
        }
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader
    }

    /// Publish the leader's outcome to every attached follower.
    pub fn complete(&mut self, value: T) {
        if self.is_leader {
            self.flight.finish(FlightStatus::Done(value));
            self.finish_on_drop = false;
        }
    }

    /// Follower side: the leader's outcome, or `None` if it was abandoned.
    pub async fn wait(&self) -> Option<T> {
        self.flight.wait().await
    }
}

impl<T: Clone> Drop for FlightGuard<'_, T> {
    fn drop(&mut self) {
        if self.finish_on_drop {
            self.flight.finish(FlightStatus::Abandoned);
            self.finish_on_drop = false;
        }
        self.singleflight.release(&self.key, &self.flight);
    }
}

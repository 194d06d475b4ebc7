use std::cmp::Ordering;
use std::fmt;

/// A callback to invoke once, as of the time this event was scheduled.
pub type Callback = Box<dyn FnOnce() + Send>;

/// A pending callback waiting for its fire time, as stored in the
/// transport's priority queue.
///
/// Ordered by `(fire_at_ns, event_id)` so that [`std::collections::BinaryHeap`]
/// (wrapped in [`std::cmp::Reverse`] by the transport to get min-heap
/// behavior) pops the earliest-due event first, with ties broken by
/// insertion order.
pub struct TimedEvent {
    /// Absolute monotonic fire time, in nanoseconds since the transport
    /// started.
    pub fire_at_ns: u64,
    /// Unique, monotonically minted id. Used for tie-breaking and for
    /// [`crate::Transport::remove_event`].
    pub event_id: u64,
    /// Whether this event should run on the worker pool (`true`) or inline
    /// on the dispatcher thread (`false`).
    pub concurrent: bool,
    /// The callback itself. Taken by [`Option::take`] when the event fires,
    /// so a [`TimedEvent`] can still be inspected (for removal/rescheduling)
    /// after its callback has been extracted.
    pub callback: Option<Callback>,
}

impl fmt::Debug for TimedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimedEvent")
            .field("fire_at_ns", &self.fire_at_ns)
            .field("event_id", &self.event_id)
            .field("concurrent", &self.concurrent)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

impl TimedEvent {
    /// Creates a new event. `callback` is always present at construction;
    /// it is only ever taken once, at fire time.
    pub fn new(fire_at_ns: u64, event_id: u64, concurrent: bool, callback: Callback) -> Self {
        Self {
            fire_at_ns,
            event_id,
            concurrent,
            callback: Some(callback),
        }
    }
}

impl PartialEq for TimedEvent {
    fn eq(&self, other: &Self) -> bool {
        self.fire_at_ns == other.fire_at_ns && self.event_id == other.event_id
    }
}
impl Eq for TimedEvent {}

impl PartialOrd for TimedEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for TimedEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        self.fire_at_ns
            .cmp(&other.fire_at_ns)
            .then_with(|| self.event_id.cmp(&other.event_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::Reverse;
    use std::collections::BinaryHeap;

    fn event(fire_at_ns: u64, event_id: u64) -> TimedEvent {
        TimedEvent::new(fire_at_ns, event_id, true, Box::new(|| {}))
    }

    #[test]
    fn orders_by_fire_time_then_id() {
        assert!(event(10, 5) < event(20, 0));
        assert!(event(10, 0) < event(10, 1));
    }

    #[test]
    fn min_heap_pops_earliest_first() {
        let mut heap = BinaryHeap::new();
        heap.push(Reverse(event(300, 2)));
        heap.push(Reverse(event(100, 0)));
        heap.push(Reverse(event(200, 1)));

        let order: Vec<u64> = std::iter::from_fn(|| heap.pop().map(|Reverse(e)| e.fire_at_ns))
            .collect();
        assert_eq!(order, vec![100, 200, 300]);
    }
}

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::Notify;

use super::event::{Event, Priority};

/// Four bounded FIFO queues, one per [`Priority`].
///
/// `pop` always takes from the highest non-empty lane and only parks when
/// every lane is empty.
pub(crate) struct LaneQueue {
    lanes: Mutex<[VecDeque<Arc<Event>>; 4]>,
    capacity: usize,
    notify: Notify,
}

impl LaneQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            lanes: Mutex::new(Default::default()),
            capacity: capacity.max(1),
            notify: Notify::new(),
        }
    }

    /// Enqueue without waiting. Returns `false` when the lane is full.
    pub fn push(&self, event: Arc<Event>) -> bool {
        {
            let mut lanes = self.lanes.lock().unwrap_or_else(PoisonError::into_inner);
            let lane = &mut lanes[event.priority.lane()];
            if lane.len() >= self.capacity {
                return false;
            }
            lane.push_back(event);
        }
        self.notify.notify_one();
        true
    }

    pub fn try_pop(&self) -> Option<Arc<Event>> {
        let mut lanes = self.lanes.lock().unwrap_or_else(PoisonError::into_inner);
        Priority::DESCENDING
            .iter()
            .find_map(|priority| lanes[priority.lane()].pop_front())
    }

    /// Cancel-safe: nothing is removed unless the future completes.
    pub async fn pop(&self) -> Arc<Event> {
        loop {
            if let Some(event) = self.try_pop() {
                return event;
            }
            self.notify.notified().await;
        }
    }

    /// Queue depth per lane, indexed by [`Priority::lane`].
    pub fn depths(&self) -> [usize; 4] {
        let lanes = self.lanes.lock().unwrap_or_else(PoisonError::into_inner);
        [lanes[0].len(), lanes[1].len(), lanes[2].len(), lanes[3].len()]
    }
}

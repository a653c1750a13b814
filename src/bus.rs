use std::sync::{Arc, Mutex};

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::events::EngineEvent;

const TOPIC_BOUND: usize = 256;

/// Fan-out channel carrying engine events to however many subscribers the
/// front end registers. Subscribers that hang up are dropped on the next
/// publish.
#[derive(Clone)]
pub struct EventBus {
    subs: Arc<Mutex<Vec<Sender<EngineEvent>>>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subs: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn publish(&self, event: EngineEvent) {
        let mut subs = self.subs.lock().unwrap();
        subs.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscribe(&self) -> Receiver<EngineEvent> {
        let (tx, rx) = bounded(TOPIC_BOUND);
        self.subs.lock().unwrap().push(tx);
        rx
    }
}

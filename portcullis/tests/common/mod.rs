#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use portcullis::{EventSink, ManualClock, SecurityAction, SecurityEvent};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Whole-second start so timestamps survive a millisecond round trip.
pub fn manual_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(
        Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
    ))
}

#[derive(Default)]
pub struct RecordingSink {
    pub events: Mutex<Vec<SecurityEvent>>,
}

impl RecordingSink {
    pub fn actions(&self) -> Vec<SecurityAction> {
        self.events.lock().unwrap().iter().map(|e| e.action).collect()
    }

    pub fn count(&self, action: SecurityAction) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.action == action)
            .count()
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn dispatch(&self, event: &SecurityEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

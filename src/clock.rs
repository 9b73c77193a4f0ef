//! Injectable time source.
//!
//! Token freshness and caller idleness are computed against a shared clock so
//! that expiry can be exercised without sleeping.

use chrono::{DateTime, Local, Utc};
use mockable::{Clock, DefaultClock};
use std::sync::{Arc, Mutex};

pub type SharedClock = Arc<dyn Clock + Send + Sync>;

/// Wall-clock time
pub fn system_clock() -> SharedClock {
    Arc::new(DefaultClock)
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Start at the current wall-clock time
    pub fn starting_now() -> Arc<Self> {
        Arc::new(Self::new(Utc::now()))
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *now += by;
    }

    pub fn advance_secs(&self, secs: i64) {
        self.advance(chrono::Duration::seconds(secs));
    }
}

impl Clock for ManualClock {
    fn local(&self) -> DateTime<Local> {
        self.utc().with_timezone(&Local)
    }

    fn utc(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

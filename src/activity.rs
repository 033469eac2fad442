//! Per-uid record of remote transfers, for a UI activity panel

use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

use crate::remote::ContentInfo;

/// Entries older than this are pruned
pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Upload,
    Download,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivityState {
    Init,
    Processing,
    Success,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivityTarget {
    /// `info` is `None` while a download is still waiting for fetch-info
    Asset {
        info: Option<ContentInfo>,
        processed_chunks: u64,
    },
    Setting { key: String },
    Filesystem,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Activity {
    pub direction: Direction,
    pub target: ActivityTarget,
    pub state: ActivityState,
    /// Unix millis of the last state change
    pub time: i64,
}

pub struct ActivityTracker {
    items: Mutex<HashMap<String, Activity>>,
    ttl: Duration,
}

impl Default for ActivityTracker {
    fn default() -> Self {
        Self::with_ttl(DEFAULT_TTL)
    }
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            items: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Insert or replace the activity for `uid`
    pub fn begin(&self, uid: &str, direction: Direction, target: ActivityTarget, state: ActivityState) {
        self.prune();
        let activity = Activity {
            direction,
            target,
            state,
            time: Utc::now().timestamp_millis(),
        };
        self.items.lock().insert(uid.to_string(), activity);
    }

    pub fn set_state(&self, uid: &str, state: ActivityState) {
        if let Some(a) = self.items.lock().get_mut(uid) {
            a.state = state;
            a.time = Utc::now().timestamp_millis();
        }
    }

    /// Attach asset info once fetch-info returns
    pub fn set_info(&self, uid: &str, new_info: ContentInfo) {
        if let Some(Activity {
            target: ActivityTarget::Asset { info, .. },
            ..
        }) = self.items.lock().get_mut(uid)
        {
            *info = Some(new_info);
        }
    }

    pub fn inc_processed_chunks(&self, uid: &str) {
        if let Some(Activity {
            target: ActivityTarget::Asset { processed_chunks, .. },
            ..
        }) = self.items.lock().get_mut(uid)
        {
            *processed_chunks += 1;
        }
    }

    pub fn get(&self, uid: &str) -> Option<Activity> {
        self.items.lock().get(uid).cloned()
    }

    pub fn has(&self, uid: &str) -> bool {
        self.items.lock().contains_key(uid)
    }

    fn by_direction(&self, direction: Direction) -> Vec<(String, Activity)> {
        let mut out: Vec<_> = self
            .items
            .lock()
            .iter()
            .filter(|(_, a)| a.direction == direction)
            .map(|(k, a)| (k.clone(), a.clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    pub fn downloads(&self) -> Vec<(String, Activity)> {
        self.by_direction(Direction::Download)
    }

    pub fn uploads(&self) -> Vec<(String, Activity)> {
        self.by_direction(Direction::Upload)
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn remove(&self, uid: &str) -> Option<Activity> {
        self.items.lock().remove(uid)
    }

    pub fn remove_with_state(&self, states: &[ActivityState]) -> usize {
        let mut items = self.items.lock();
        let before = items.len();
        items.retain(|_, a| !states.contains(&a.state));
        before - items.len()
    }

    /// Drop entries whose last change is older than the ttl
    pub fn prune(&self) -> usize {
        let cutoff = Utc::now().timestamp_millis() - self.ttl.as_millis() as i64;
        let mut items = self.items.lock();
        let before = items.len();
        items.retain(|_, a| a.time >= cutoff);
        before - items.len()
    }
}

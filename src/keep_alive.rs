use std::{collections::HashMap, sync::Mutex};

use rand::Rng;

use crate::{data_model::ApplicationId, utils::time::get_epoch_time_in_ms};

/// Schedules keep-alive mentions for applications whose credentials must
/// outlive their nominal expiry while jobs are still running.
///
/// The next mention for an application lands between 0.7 and 0.9 of the
/// credential removal delay so a burst of applications does not re-align on
/// one heartbeat.
pub struct KeepAliveTracker {
    enabled: bool,
    token_removal_delay_ms: u64,
    next_send: Mutex<HashMap<ApplicationId, u64>>,
}

impl KeepAliveTracker {
    pub fn new(enabled: bool, token_removal_delay_ms: u64) -> Self {
        Self {
            enabled,
            token_removal_delay_ms,
            next_send: Mutex::new(HashMap::new()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Starts tracking applications newly observed at finish.
    pub fn track_applications(&self, application_ids: &[ApplicationId]) {
        if !self.enabled || application_ids.is_empty() {
            return;
        }
        let mut next_send = self.next_send.lock().unwrap();
        for application_id in application_ids {
            next_send.insert(application_id.clone(), self.next_send_time());
        }
    }

    /// Produces the keep-alive list for the next heartbeat: tracked
    /// applications whose send time has passed are included and rescheduled;
    /// applications that are no longer live are dropped.
    pub fn create_keep_alive_application_list(
        &self,
        mut is_live: impl FnMut(&ApplicationId) -> bool,
    ) -> Vec<ApplicationId> {
        if !self.enabled {
            return Vec::new();
        }
        let now = get_epoch_time_in_ms();
        let mut list = Vec::new();
        let mut next_send = self.next_send.lock().unwrap();
        next_send.retain(|application_id, _| is_live(application_id));
        for (application_id, next) in next_send.iter_mut() {
            if now > *next {
                list.push(application_id.clone());
                *next = Self::jittered_next_send(self.token_removal_delay_ms);
            }
        }
        list
    }

    fn next_send_time(&self) -> u64 {
        Self::jittered_next_send(self.token_removal_delay_ms)
    }

    fn jittered_next_send(delay_ms: u64) -> u64 {
        let r = rand::rng().random_range(0..100u64);
        let delay = delay_ms as f64;
        get_epoch_time_in_ms() + (0.7 * delay + (0.2 * delay * r as f64) / 100.0) as u64
    }

    #[cfg(test)]
    fn next_send_for(&self, application_id: &ApplicationId) -> Option<u64> {
        self.next_send.lock().unwrap().get(application_id).copied()
    }
}

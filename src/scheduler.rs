//! Alarm scheduler: polls the task list and surfaces due tasks once.
//!
//! Claiming a due task (notified set + active alerts) happens inside
//! `AppState::claim_due`; this module owns the due rule, the poll loop and
//! the fan-out to alarm channels.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveDateTime, NaiveTime};
use tracing::{debug, info, warn};

use crate::model::{parse_hhmm, Task};
use crate::state::AppState;

/// A side effect of firing an alarm. Channels are independent: one
/// failing never stops the others.
pub trait AlarmChannel: Send + Sync {
    fn name(&self) -> &'static str;
    fn fire(&self, task: &Task) -> Result<(), String>;
}

/// Whether `task` should fire at `now`, ignoring the notified set.
pub fn is_due(task: &Task, now: NaiveDateTime, default_time: NaiveTime) -> bool {
    if task.completed {
        return false;
    }
    let today = now.date();
    if task.due_date < today {
        return true;
    }
    if task.due_date > today {
        return false;
    }
    now.time() >= task.due_time.unwrap_or(default_time)
}

pub struct AlarmScheduler {
    state: AppState,
    channels: Vec<Arc<dyn AlarmChannel>>,
    interval: Duration,
    default_time: NaiveTime,
}

impl AlarmScheduler {
    pub fn new(state: AppState, interval: Duration, default_time: &str) -> Self {
        let default_time = parse_hhmm(default_time).unwrap_or_else(|e| {
            warn!("{e}, falling back to 08:00");
            NaiveTime::from_hms_opt(8, 0, 0).unwrap_or(NaiveTime::MIN)
        });
        Self {
            state,
            channels: Vec::new(),
            interval,
            default_time,
        }
    }

    pub fn with_channel(mut self, channel: Arc<dyn AlarmChannel>) -> Self {
        self.channels.push(channel);
        self
    }

    /// One poll: claim due tasks and fan out to every channel.
    pub fn tick(&self, now: NaiveDateTime) -> Vec<Task> {
        let fired = self.state.claim_due(now, self.default_time);
        for task in &fired {
            info!(
                "Alarm triggered: '{}' ({} {})",
                task.title,
                task.due_date,
                task.due_time_label().unwrap_or_default()
            );
            for channel in &self.channels {
                if let Err(e) = channel.fire(task) {
                    warn!("Alarm channel '{}' failed for '{}': {e}", channel.name(), task.title);
                }
            }
        }
        fired
    }

    /// Poll forever on a fixed interval.
    pub async fn run(self) {
        info!(
            "Alarm scheduler running every {:?} ({} channels)",
            self.interval,
            self.channels.len()
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let fired = self.tick(Local::now().naive_local());
            if !fired.is_empty() {
                debug!("{} alarm(s) fired this tick", fired.len());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::parse_date;
    use crate::state::tests::{at, draft};
    use crate::store::Snapshot;
    use std::sync::Mutex;

    fn task(date: &str, time: Option<&str>) -> Task {
        Task {
            id: "t".into(),
            title: "t".into(),
            due_date: parse_date(date).unwrap(),
            due_time: time.map(|t| parse_hhmm(t).unwrap()),
            completed: false,
            category: String::new(),
        }
    }

    fn eight() -> NaiveTime {
        parse_hhmm("08:00").unwrap()
    }

    #[derive(Default)]
    struct Recorder {
        fired: Mutex<Vec<String>>,
    }

    impl AlarmChannel for Recorder {
        fn name(&self) -> &'static str {
            "recorder"
        }
        fn fire(&self, task: &Task) -> Result<(), String> {
            self.fired.lock().unwrap().push(task.title.clone());
            Ok(())
        }
    }

    struct Broken;

    impl AlarmChannel for Broken {
        fn name(&self) -> &'static str {
            "broken"
        }
        fn fire(&self, _task: &Task) -> Result<(), String> {
            Err("no device".into())
        }
    }

    #[test]
    fn test_timed_task_fires_at_or_after_time() {
        let t = task("2024-05-01", Some("07:00"));
        assert!(!is_due(&t, at("2024-05-01", "06:59"), eight()));
        assert!(is_due(&t, at("2024-05-01", "07:00"), eight()));
        assert!(is_due(&t, at("2024-05-01", "07:01"), eight()));
    }

    #[test]
    fn test_untimed_task_waits_for_default_time() {
        let t = task("2024-05-01", None);
        assert!(!is_due(&t, at("2024-05-01", "07:59"), eight()));
        assert!(is_due(&t, at("2024-05-01", "08:00"), eight()));
    }

    #[test]
    fn test_overdue_fires_regardless_of_time() {
        let t = task("2024-04-30", Some("23:00"));
        assert!(is_due(&t, at("2024-05-01", "00:01"), eight()));
    }

    #[test]
    fn test_future_and_completed_never_fire() {
        let future = task("2024-05-02", Some("00:00"));
        assert!(!is_due(&future, at("2024-05-01", "23:59"), eight()));

        let mut done = task("2024-04-01", None);
        done.completed = true;
        assert!(!is_due(&done, at("2024-05-01", "12:00"), eight()));
    }

    #[test]
    fn test_pagar_conta_scenario() {
        let state = AppState::detached(Snapshot::default());
        let task = state.add_task(draft("Pagar conta", "2024-05-01", Some("07:00")));
        let recorder = Arc::new(Recorder::default());
        let scheduler = AlarmScheduler::new(state.clone(), Duration::from_secs(5), "08:00")
            .with_channel(recorder.clone());

        scheduler.tick(at("2024-05-01", "07:01"));

        let alerts = state.active_alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].title, "Pagar conta");
        assert!(state.is_notified(&task.id));
        assert_eq!(*recorder.fired.lock().unwrap(), vec!["Pagar conta".to_string()]);
    }

    #[test]
    fn test_notified_task_never_refires() {
        let state = AppState::detached(Snapshot::default());
        state.add_task(draft("Atrasada", "2024-04-01", None));
        let recorder = Arc::new(Recorder::default());
        let scheduler = AlarmScheduler::new(state.clone(), Duration::from_secs(5), "08:00")
            .with_channel(recorder.clone());

        scheduler.tick(at("2024-05-01", "09:00"));
        scheduler.tick(at("2024-05-01", "09:00"));
        scheduler.tick(at("2024-05-02", "09:00"));

        assert_eq!(recorder.fired.lock().unwrap().len(), 1);
        assert_eq!(state.active_alerts().len(), 1);
    }

    #[test]
    fn test_failing_channel_does_not_block_others() {
        let state = AppState::detached(Snapshot::default());
        state.add_task(draft("x", "2024-04-01", None));
        let recorder = Arc::new(Recorder::default());
        let scheduler = AlarmScheduler::new(state, Duration::from_secs(5), "08:00")
            .with_channel(Arc::new(Broken))
            .with_channel(recorder.clone());

        scheduler.tick(at("2024-05-01", "09:00"));
        assert_eq!(recorder.fired.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_same_tick_fires_in_collection_order() {
        let state = AppState::detached(Snapshot::default());
        state.add_task(draft("segunda", "2024-05-01", Some("07:30")));
        state.add_task(draft("primeira", "2024-05-01", Some("07:00")));
        let scheduler = AlarmScheduler::new(state.clone(), Duration::from_secs(5), "08:00");

        let fired = scheduler.tick(at("2024-05-01", "09:00"));
        let titles: Vec<_> = fired.iter().map(|t| t.title.as_str()).collect();
        assert_eq!(titles, vec!["segunda", "primeira"]);
        assert_eq!(state.current_alert().unwrap().0.title, "segunda");
    }

    #[test]
    fn test_bad_default_time_falls_back() {
        let state = AppState::detached(Snapshot::default());
        state.add_task(draft("x", "2024-05-01", None));
        let scheduler = AlarmScheduler::new(state, Duration::from_secs(5), "oito horas");
        assert!(scheduler.tick(at("2024-05-01", "07:59")).is_empty());
        assert_eq!(scheduler.tick(at("2024-05-01", "08:00")).len(), 1);
    }
}

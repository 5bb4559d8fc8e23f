//! Shared agenda state.
//!
//! One mutex guards tasks, transactions, the notified set, active alerts and
//! the theme. The scheduler, the bus listener, voice tools and the API all go
//! through the methods here; nothing else writes the collections. Each
//! mutation persists the keys it touched before the lock is released.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{NaiveDateTime, NaiveTime};
use tracing::{debug, info, warn};

use crate::model::{LedgerSummary, Task, TaskDraft, ThemeColor, Transaction, TransactionDraft};
use crate::scheduler::is_due;
use crate::store::{Snapshot, Store, StoreError};

#[derive(Default)]
struct Inner {
    tasks: Vec<Task>,
    transactions: Vec<Transaction>,
    notified: Vec<String>,
    alerts: Vec<Task>,
    theme: ThemeColor,
}

impl Inner {
    fn is_notified(&self, id: &str) -> bool {
        self.notified.iter().any(|n| n == id)
    }

    /// Returns true if the id was newly added.
    fn mark_notified(&mut self, id: &str) -> bool {
        if self.is_notified(id) {
            return false;
        }
        self.notified.push(id.to_string());
        true
    }

    fn remove_alert(&mut self, id: &str) -> bool {
        let before = self.alerts.len();
        self.alerts.retain(|t| t.id != id);
        self.alerts.len() != before
    }
}

/// Which keys a mutation dirtied.
#[derive(Default, Clone, Copy)]
struct Dirty {
    tasks: bool,
    transactions: bool,
    notified: bool,
}

#[derive(Clone)]
pub struct AppState {
    inner: Arc<Mutex<Inner>>,
    store: Option<Store>,
}

impl AppState {
    pub fn new(store: Store) -> Self {
        let snapshot = store.load();
        Self::build(snapshot, Some(store))
    }

    /// State that is never written to disk.
    pub fn detached(snapshot: Snapshot) -> Self {
        Self::build(snapshot, None)
    }

    fn build(snapshot: Snapshot, store: Option<Store>) -> Self {
        let inner = Inner {
            tasks: snapshot.tasks,
            transactions: snapshot.transactions,
            notified: snapshot.notified,
            alerts: Vec::new(),
            theme: snapshot.theme,
        };
        Self {
            inner: Arc::new(Mutex::new(inner)),
            store,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, inner: &Inner, dirty: Dirty) {
        let Some(store) = &self.store else {
            return;
        };
        let mut results: Vec<Result<(), StoreError>> = Vec::with_capacity(3);
        if dirty.tasks {
            results.push(store.save_tasks(&inner.tasks));
        }
        if dirty.transactions {
            results.push(store.save_transactions(&inner.transactions));
        }
        if dirty.notified {
            results.push(store.save_notified(&inner.notified));
        }
        for result in results {
            if let Err(e) = result {
                warn!("Failed to persist state: {e}");
            }
        }
    }

    // --- Tasks ---

    pub fn add_task(&self, draft: TaskDraft) -> Task {
        let task = Task::from_draft(uuid::Uuid::new_v4().to_string(), draft);
        let mut inner = self.lock();
        inner.tasks.push(task.clone());
        self.persist(
            &inner,
            Dirty {
                tasks: true,
                ..Dirty::default()
            },
        );
        info!("Task added: '{}' ({} {:?})", task.title, task.due_date, task.due_time_label());
        task
    }

    /// Flip completion. Also clears the alert and marks the task notified,
    /// whichever direction the toggle went.
    pub fn toggle_task(&self, id: &str) -> Option<Task> {
        let mut inner = self.lock();
        let task = inner.tasks.iter_mut().find(|t| t.id == id)?;
        task.completed = !task.completed;
        let toggled = task.clone();
        inner.remove_alert(id);
        let newly_notified = inner.mark_notified(id);
        self.persist(
            &inner,
            Dirty {
                tasks: true,
                notified: newly_notified,
                ..Dirty::default()
            },
        );
        info!("Task '{}' completed={}", toggled.title, toggled.completed);
        Some(toggled)
    }

    /// Remove a task together with its notified entry and any active alert.
    pub fn delete_task(&self, id: &str) -> Option<Task> {
        let mut inner = self.lock();
        let pos = inner.tasks.iter().position(|t| t.id == id)?;
        let removed = inner.tasks.remove(pos);
        let before = inner.notified.len();
        inner.notified.retain(|n| n != id);
        let notified_changed = inner.notified.len() != before;
        inner.remove_alert(id);
        self.persist(
            &inner,
            Dirty {
                tasks: true,
                notified: notified_changed,
                ..Dirty::default()
            },
        );
        info!("Task deleted: '{}'", removed.title);
        Some(removed)
    }

    /// First task whose title contains `fragment`, ignoring case.
    pub fn find_task_by_title(&self, fragment: &str) -> Option<Task> {
        let needle = fragment.trim().to_lowercase();
        if needle.is_empty() {
            return None;
        }
        self.lock()
            .tasks
            .iter()
            .find(|t| t.title.to_lowercase().contains(&needle))
            .cloned()
    }

    pub fn task(&self, id: &str) -> Option<Task> {
        self.lock().tasks.iter().find(|t| t.id == id).cloned()
    }

    pub fn tasks(&self) -> Vec<Task> {
        self.lock().tasks.clone()
    }

    // --- Transactions ---

    pub fn add_transaction(&self, draft: TransactionDraft) -> Transaction {
        let tx = Transaction::from_draft(uuid::Uuid::new_v4().to_string(), draft);
        let mut inner = self.lock();
        inner.transactions.push(tx.clone());
        self.persist(
            &inner,
            Dirty {
                transactions: true,
                ..Dirty::default()
            },
        );
        info!("Transaction added: '{}' {:.2} ({:?})", tx.description, tx.amount, tx.kind);
        tx
    }

    pub fn delete_transaction(&self, id: &str) -> Option<Transaction> {
        let mut inner = self.lock();
        let pos = inner.transactions.iter().position(|t| t.id == id)?;
        let removed = inner.transactions.remove(pos);
        self.persist(
            &inner,
            Dirty {
                transactions: true,
                ..Dirty::default()
            },
        );
        Some(removed)
    }

    pub fn transactions(&self) -> Vec<Transaction> {
        self.lock().transactions.clone()
    }

    // --- Alarms ---

    pub fn mark_notified(&self, id: &str) {
        let mut inner = self.lock();
        if inner.mark_notified(id) {
            self.persist(
                &inner,
                Dirty {
                    notified: true,
                    ..Dirty::default()
                },
            );
        }
    }

    /// Clear an alert without completing the task.
    pub fn dismiss_alert(&self, id: &str) {
        let mut inner = self.lock();
        inner.remove_alert(id);
        // Push tags and stale ids have no task to guard
        let known = inner.tasks.iter().any(|t| t.id == id);
        if known && inner.mark_notified(id) {
            self.persist(
                &inner,
                Dirty {
                    notified: true,
                    ..Dirty::default()
                },
            );
        }
        debug!("Alert dismissed: {id}");
    }

    /// Check-and-mark every due task in one critical section.
    ///
    /// A task returned here is already in the notified set and in the active
    /// alerts, so a second call can never return it again.
    pub fn claim_due(&self, now: NaiveDateTime, default_time: NaiveTime) -> Vec<Task> {
        let mut inner = self.lock();
        let due: Vec<Task> = inner
            .tasks
            .iter()
            .filter(|t| !inner.is_notified(&t.id) && is_due(t, now, default_time))
            .cloned()
            .collect();

        if due.is_empty() {
            return due;
        }

        for task in &due {
            inner.mark_notified(&task.id);
            if !inner.alerts.iter().any(|a| a.id == task.id) {
                inner.alerts.push(task.clone());
            }
        }
        self.persist(
            &inner,
            Dirty {
                notified: true,
                ..Dirty::default()
            },
        );
        due
    }

    /// Earliest-fired unresolved alert and how many more are waiting.
    pub fn current_alert(&self) -> Option<(Task, usize)> {
        let inner = self.lock();
        inner
            .alerts
            .first()
            .map(|t| (t.clone(), inner.alerts.len() - 1))
    }

    pub fn active_alerts(&self) -> Vec<Task> {
        self.lock().alerts.clone()
    }

    pub fn notified(&self) -> Vec<String> {
        self.lock().notified.clone()
    }

    pub fn is_notified(&self, id: &str) -> bool {
        self.lock().is_notified(id)
    }

    // --- Preferences / views ---

    pub fn theme(&self) -> ThemeColor {
        self.lock().theme
    }

    pub fn set_theme(&self, theme: ThemeColor) {
        self.lock().theme = theme;
        if let Some(store) = &self.store {
            if let Err(e) = store.save_theme(theme) {
                warn!("Failed to persist theme: {e}");
            }
        }
    }

    pub fn summary(&self) -> LedgerSummary {
        let inner = self.lock();
        LedgerSummary::compute(&inner.tasks, &inner.transactions)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::model::{parse_date, parse_hhmm, TransactionType};
    use chrono::Utc;

    pub(crate) fn draft(title: &str, date: &str, time: Option<&str>) -> TaskDraft {
        TaskDraft {
            title: title.into(),
            due_date: parse_date(date).unwrap(),
            due_time: time.map(|t| parse_hhmm(t).unwrap()),
            completed: false,
            category: "Geral".into(),
        }
    }

    pub(crate) fn at(date: &str, time: &str) -> NaiveDateTime {
        parse_date(date).unwrap().and_time(parse_hhmm(time).unwrap())
    }

    fn eight() -> NaiveTime {
        parse_hhmm("08:00").unwrap()
    }

    #[test]
    fn test_add_assigns_unique_ids() {
        let state = AppState::detached(Snapshot::default());
        let a = state.add_task(draft("a", "2024-05-01", None));
        let b = state.add_task(draft("b", "2024-05-01", None));
        assert_ne!(a.id, b.id);
        assert_eq!(state.tasks().len(), 2);
    }

    #[test]
    fn test_claim_due_is_idempotent() {
        let state = AppState::detached(Snapshot::default());
        state.add_task(draft("Pagar conta", "2024-05-01", Some("07:00")));
        let now = at("2024-05-01", "07:01");

        let first = state.claim_due(now, eight());
        assert_eq!(first.len(), 1);
        assert!(state.claim_due(now, eight()).is_empty());
        assert_eq!(state.active_alerts().len(), 1);
        assert_eq!(state.notified().len(), 1);
    }

    #[test]
    fn test_toggle_clears_alert_and_marks_notified() {
        let state = AppState::detached(Snapshot::default());
        let task = state.add_task(draft("x", "2024-04-01", None));
        state.claim_due(at("2024-05-01", "10:00"), eight());
        assert_eq!(state.active_alerts().len(), 1);

        let toggled = state.toggle_task(&task.id).unwrap();
        assert!(toggled.completed);
        assert!(state.active_alerts().is_empty());
        assert!(state.is_notified(&task.id));
    }

    #[test]
    fn test_untoggle_does_not_rearm() {
        let state = AppState::detached(Snapshot::default());
        let task = state.add_task(draft("x", "2024-04-01", None));
        state.claim_due(at("2024-05-01", "10:00"), eight());
        state.toggle_task(&task.id);
        state.toggle_task(&task.id);
        assert!(!state.task(&task.id).unwrap().completed);
        assert!(state.claim_due(at("2024-05-01", "10:05"), eight()).is_empty());
    }

    #[test]
    fn test_delete_removes_from_all_collections() {
        let state = AppState::detached(Snapshot::default());
        let task = state.add_task(draft("x", "2024-04-01", None));
        state.claim_due(at("2024-05-01", "10:00"), eight());

        state.delete_task(&task.id).unwrap();
        assert!(state.tasks().is_empty());
        assert!(state.notified().is_empty());
        assert!(state.active_alerts().is_empty());
    }

    #[test]
    fn test_dismiss_keeps_task_incomplete() {
        let state = AppState::detached(Snapshot::default());
        let task = state.add_task(draft("x", "2024-04-01", None));
        state.claim_due(at("2024-05-01", "10:00"), eight());

        state.dismiss_alert(&task.id);
        assert!(state.active_alerts().is_empty());
        assert!(state.is_notified(&task.id));
        assert!(!state.task(&task.id).unwrap().completed);
    }

    #[test]
    fn test_dismiss_unknown_id_is_not_remembered() {
        let state = AppState::detached(Snapshot::default());
        state.add_task(draft("x", "2024-04-01", None));

        state.dismiss_alert("general");
        state.dismiss_alert("deleted-long-ago");
        assert!(state.notified().is_empty());
        assert!(!state.is_notified("general"));
    }

    #[test]
    fn test_current_alert_reports_earliest_and_rest() {
        let state = AppState::detached(Snapshot::default());
        state.add_task(draft("primeira", "2024-04-01", None));
        state.add_task(draft("segunda", "2024-04-02", None));
        state.claim_due(at("2024-05-01", "10:00"), eight());

        let (task, rest) = state.current_alert().unwrap();
        assert_eq!(task.title, "primeira");
        assert_eq!(rest, 1);
    }

    #[test]
    fn test_find_by_title_is_case_insensitive_substring() {
        let state = AppState::detached(Snapshot::default());
        state.add_task(draft("Reunião de equipe", "2024-05-01", None));
        assert!(state.find_task_by_title("reun").is_some());
        assert!(state.find_task_by_title("EQUIPE").is_some());
        assert!(state.find_task_by_title("almoço").is_none());
        assert!(state.find_task_by_title("  ").is_none());
    }

    #[test]
    fn test_mutations_write_through() {
        let dir = tempfile::tempdir().unwrap();
        let state = AppState::new(Store::open(dir.path()).unwrap());
        let task = state.add_task(draft("x", "2024-04-01", None));
        state.add_transaction(TransactionDraft {
            description: "Café".into(),
            amount: 5.0,
            date: Utc::now(),
            kind: TransactionType::Expense,
            category: String::new(),
        });
        state.claim_due(at("2024-05-01", "10:00"), eight());
        state.set_theme(ThemeColor::Amber);

        let reloaded = Store::open(dir.path()).unwrap().load();
        assert_eq!(reloaded.tasks.len(), 1);
        assert_eq!(reloaded.transactions.len(), 1);
        assert_eq!(reloaded.notified, vec![task.id]);
        assert_eq!(reloaded.theme, ThemeColor::Amber);
    }
}

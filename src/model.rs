//! Agenda and ledger records.
//!
//! JSON field names are camelCase and dates are plain strings
//! (`YYYY-MM-DD`, `HH:MM`) so persisted files stay readable and match
//! what the API and the voice tools exchange.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

/// Category stamped on records created through the voice assistant.
pub const VOICE_CATEGORY: &str = "Voz";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub title: String,
    pub due_date: NaiveDate,
    #[serde(default, with = "hhmm", skip_serializing_if = "Option::is_none")]
    pub due_time: Option<NaiveTime>,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub category: String,
}

impl Task {
    pub fn from_draft(id: String, draft: TaskDraft) -> Self {
        Self {
            id,
            title: draft.title,
            due_date: draft.due_date,
            due_time: draft.due_time,
            completed: draft.completed,
            category: draft.category,
        }
    }

    /// Due time as `HH:MM`, if one is set.
    pub fn due_time_label(&self) -> Option<String> {
        self.due_time.map(format_hhmm)
    }
}

/// A task before it has been assigned an id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDraft {
    pub title: String,
    pub due_date: NaiveDate,
    #[serde(default, with = "hhmm", skip_serializing_if = "Option::is_none")]
    pub due_time: Option<NaiveTime>,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub category: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionType {
    Income,
    Expense,
}

impl FromStr for TransactionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "income" => Ok(Self::Income),
            "expense" => Ok(Self::Expense),
            other => Err(format!("invalid transaction type: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: String,
    pub description: String,
    pub amount: f64,
    pub date: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: TransactionType,
    #[serde(default)]
    pub category: String,
}

impl Transaction {
    pub fn from_draft(id: String, draft: TransactionDraft) -> Self {
        Self {
            id,
            description: draft.description,
            amount: draft.amount,
            date: draft.date,
            kind: draft.kind,
            category: draft.category,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionDraft {
    pub description: String,
    pub amount: f64,
    #[serde(default = "Utc::now")]
    pub date: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: TransactionType,
    #[serde(default)]
    pub category: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThemeColor {
    #[default]
    Indigo,
    Emerald,
    Rose,
    Amber,
    Violet,
    Slate,
}

impl ThemeColor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Indigo => "indigo",
            Self::Emerald => "emerald",
            Self::Rose => "rose",
            Self::Amber => "amber",
            Self::Violet => "violet",
            Self::Slate => "slate",
        }
    }
}

impl fmt::Display for ThemeColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ThemeColor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "indigo" => Ok(Self::Indigo),
            "emerald" => Ok(Self::Emerald),
            "rose" => Ok(Self::Rose),
            "amber" => Ok(Self::Amber),
            "violet" => Ok(Self::Violet),
            "slate" => Ok(Self::Slate),
            other => Err(format!("unknown theme: {other}")),
        }
    }
}

/// Running focus timer. Lives only in memory.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FocusSession {
    pub is_active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_title: Option<String>,
    pub duration_minutes: u32,
}

impl FocusSession {
    pub fn inactive(duration_minutes: u32) -> Self {
        Self {
            is_active: false,
            task_id: None,
            task_title: None,
            duration_minutes,
        }
    }
}

/// Dashboard figures: ledger totals plus the next pending task.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerSummary {
    pub total_income: f64,
    pub total_expense: f64,
    pub balance: f64,
    pub pending_tasks: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_task: Option<Task>,
}

impl LedgerSummary {
    pub fn compute(tasks: &[Task], transactions: &[Transaction]) -> Self {
        let total_income: f64 = transactions
            .iter()
            .filter(|tx| tx.kind == TransactionType::Income)
            .map(|tx| tx.amount)
            .sum();
        let total_expense: f64 = transactions
            .iter()
            .filter(|tx| tx.kind == TransactionType::Expense)
            .map(|tx| tx.amount)
            .sum();

        let pending = sorted_pending(tasks);

        Self {
            total_income,
            total_expense,
            balance: total_income - total_expense,
            pending_tasks: pending.len(),
            next_task: pending.into_iter().next().cloned(),
        }
    }
}

/// Incomplete tasks by date, then time. Tasks without a time sort as 23:59.
pub fn sorted_pending(tasks: &[Task]) -> Vec<&Task> {
    let end_of_day = NaiveTime::from_hms_opt(23, 59, 0).unwrap_or(NaiveTime::MIN);
    let mut pending: Vec<&Task> = tasks.iter().filter(|t| !t.completed).collect();
    pending.sort_by_key(|t| (t.due_date, t.due_time.unwrap_or(end_of_day)));
    pending
}

pub fn parse_hhmm(s: &str) -> Result<NaiveTime, String> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M").map_err(|e| format!("invalid time '{s}': {e}"))
}

pub fn format_hhmm(time: NaiveTime) -> String {
    time.format("%H:%M").to_string()
}

pub fn parse_date(s: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").map_err(|e| format!("invalid date '{s}': {e}"))
}

/// Serde adapter for `Option<NaiveTime>` as `"HH:MM"`.
mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<NaiveTime>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(t) => s.serialize_str(&super::format_hhmm(*t)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<NaiveTime>, D::Error> {
        let raw: Option<String> = Option::deserialize(d)?;
        match raw.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(s) => super::parse_hhmm(s).map(Some).map_err(serde::de::Error::custom),
        }
    }
}

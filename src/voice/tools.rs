//! Model-invocable tools.
//!
//! Remote function calls arrive as a name plus a JSON argument bag. They are
//! parsed into `ToolCall` (validated, typed) before anything runs; unknown
//! names never reach the host.

use chrono::{NaiveDate, NaiveTime, Utc};
use serde_json::{json, Value};
use thiserror::Error;

use crate::model::{
    format_hhmm, parse_date, parse_hhmm, Task, TaskDraft, Transaction, TransactionDraft,
    TransactionType, VOICE_CATEGORY,
};

#[derive(Debug, Error, PartialEq)]
pub enum ToolCallError {
    #[error("Operação não suportada: {0}")]
    Unsupported(String),
    #[error("Argumento inválido '{field}': {reason}")]
    InvalidArgument { field: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ToolCall {
    AddTask {
        title: String,
        date: NaiveDate,
        time: Option<NaiveTime>,
    },
    DeleteTask {
        task_title: String,
    },
    AddTransaction {
        description: String,
        amount: f64,
        kind: TransactionType,
    },
    StartFocus {
        task_title: Option<String>,
        minutes: Option<u32>,
    },
    CloseAssistant,
}

/// What the session does after a call ran.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutcome {
    Reply(String),
    Close,
}

/// Local side effects available to the assistant.
pub trait ToolHost: Send + Sync {
    fn add_task(&self, draft: TaskDraft) -> Task;
    fn find_task_by_title(&self, fragment: &str) -> Option<Task>;
    fn delete_task(&self, id: &str) -> Option<Task>;
    fn add_transaction(&self, draft: TransactionDraft) -> Transaction;
    /// Start a focus session; returns the effective duration in minutes.
    fn start_focus(&self, task: Option<Task>, minutes: Option<u32>) -> Result<u32, String>;
}

impl ToolCall {
    pub fn parse(name: &str, args: &Value) -> Result<Self, ToolCallError> {
        match name {
            "add_task" => {
                let time = match optional_str(args, "time") {
                    Some(raw) => Some(parse_time(raw)?),
                    None => None,
                };
                Ok(Self::AddTask {
                    title: required_str(args, "title")?,
                    date: parse_date(&required_str(args, "date")?).map_err(|reason| {
                        ToolCallError::InvalidArgument {
                            field: "date",
                            reason,
                        }
                    })?,
                    time,
                })
            }
            "delete_task" => Ok(Self::DeleteTask {
                task_title: required_str(args, "task_title")?,
            }),
            "add_transaction" => Ok(Self::AddTransaction {
                description: required_str(args, "description")?,
                amount: required_number(args, "amount")?,
                kind: required_str(args, "type")?.parse().map_err(|reason| {
                    ToolCallError::InvalidArgument {
                        field: "type",
                        reason,
                    }
                })?,
            }),
            "start_focus" => Ok(Self::StartFocus {
                task_title: optional_str(args, "task_title").map(str::to_string),
                minutes: match args.get("minutes") {
                    None | Some(Value::Null) => None,
                    Some(_) => {
                        let minutes = required_number(args, "minutes")?;
                        if minutes < 1.0 {
                            return Err(ToolCallError::InvalidArgument {
                                field: "minutes",
                                reason: "must be at least 1".into(),
                            });
                        }
                        Some(minutes.round() as u32)
                    }
                },
            }),
            "close_assistant" => Ok(Self::CloseAssistant),
            other => Err(ToolCallError::Unsupported(other.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::AddTask { .. } => "add_task",
            Self::DeleteTask { .. } => "delete_task",
            Self::AddTransaction { .. } => "add_transaction",
            Self::StartFocus { .. } => "start_focus",
            Self::CloseAssistant => "close_assistant",
        }
    }
}

fn optional_str<'a>(args: &'a Value, field: &str) -> Option<&'a str> {
    args.get(field)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn required_str(args: &Value, field: &'static str) -> Result<String, ToolCallError> {
    optional_str(args, field)
        .map(str::to_string)
        .ok_or(ToolCallError::InvalidArgument {
            field,
            reason: "missing".into(),
        })
}

fn required_number(args: &Value, field: &'static str) -> Result<f64, ToolCallError> {
    let invalid = |reason: String| ToolCallError::InvalidArgument { field, reason };
    let value = match args.get(field) {
        Some(Value::Number(n)) => n.as_f64().ok_or_else(|| invalid("not a number".into()))?,
        Some(Value::String(s)) => s
            .trim()
            .replace(',', ".")
            .parse::<f64>()
            .map_err(|e| invalid(e.to_string()))?,
        Some(_) => return Err(invalid("not a number".into())),
        None => return Err(invalid("missing".into())),
    };
    // "NaN" and "inf" parse, but cannot be persisted as JSON numbers
    if !value.is_finite() {
        return Err(invalid("not a finite number".into()));
    }
    Ok(value)
}

fn parse_time(raw: &str) -> Result<NaiveTime, ToolCallError> {
    parse_hhmm(raw)
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M:%S").map_err(|e| e.to_string()))
        .map_err(|reason| ToolCallError::InvalidArgument {
            field: "time",
            reason,
        })
}

/// Run a validated call against the host. Every call except
/// `close_assistant` produces a short reply for the model.
pub fn dispatch(call: ToolCall, host: &dyn ToolHost, default_time: NaiveTime) -> ToolOutcome {
    match call {
        ToolCall::AddTask { title, date, time } => {
            let time = time.unwrap_or(default_time);
            host.add_task(TaskDraft {
                title,
                due_date: date,
                due_time: Some(time),
                completed: false,
                category: VOICE_CATEGORY.into(),
            });
            ToolOutcome::Reply(format!("Tarefa adicionada para as {}", format_hhmm(time)))
        }
        ToolCall::DeleteTask { task_title } => match host.find_task_by_title(&task_title) {
            Some(task) => {
                host.delete_task(&task.id);
                ToolOutcome::Reply("Tarefa apagada".into())
            }
            None => ToolOutcome::Reply("Tarefa não encontrada".into()),
        },
        ToolCall::AddTransaction {
            description,
            amount,
            kind,
        } => {
            host.add_transaction(TransactionDraft {
                description,
                amount,
                date: Utc::now(),
                kind,
                category: VOICE_CATEGORY.into(),
            });
            ToolOutcome::Reply("Lançamento registrado".into())
        }
        ToolCall::StartFocus {
            task_title,
            minutes,
        } => {
            let task = task_title.as_deref().and_then(|t| host.find_task_by_title(t));
            match host.start_focus(task, minutes) {
                Ok(minutes) => ToolOutcome::Reply(format!("Foco iniciado por {minutes} minutos")),
                Err(e) => ToolOutcome::Reply(format!("Não foi possível iniciar o foco: {e}")),
            }
        }
        ToolCall::CloseAssistant => ToolOutcome::Close,
    }
}

/// Function declarations sent in the session setup.
pub fn declarations() -> Value {
    json!([
        {
            "name": "add_task",
            "description": "Adiciona uma tarefa à agenda com data e hora.",
            "parameters": {
                "type": "OBJECT",
                "properties": {
                    "title": { "type": "STRING", "description": "O título ou descrição da tarefa" },
                    "date": { "type": "STRING", "description": "Data no formato YYYY-MM-DD" },
                    "time": { "type": "STRING", "description": "Horário no formato HH:mm (Ex: 14:30, 08:00)" }
                },
                "required": ["title", "date"]
            }
        },
        {
            "name": "delete_task",
            "description": "Apaga uma tarefa.",
            "parameters": {
                "type": "OBJECT",
                "properties": {
                    "task_title": { "type": "STRING", "description": "Título da tarefa para apagar" }
                },
                "required": ["task_title"]
            }
        },
        {
            "name": "add_transaction",
            "description": "Registra finanças.",
            "parameters": {
                "type": "OBJECT",
                "properties": {
                    "description": { "type": "STRING" },
                    "amount": { "type": "NUMBER" },
                    "type": { "type": "STRING", "enum": ["income", "expense"] }
                },
                "required": ["description", "amount", "type"]
            }
        },
        {
            "name": "start_focus",
            "description": "Inicia uma sessão de foco, opcionalmente ligada a uma tarefa.",
            "parameters": {
                "type": "OBJECT",
                "properties": {
                    "task_title": { "type": "STRING", "description": "Título da tarefa em foco" },
                    "minutes": { "type": "NUMBER", "description": "Duração em minutos (padrão 25)" }
                }
            }
        },
        {
            "name": "close_assistant",
            "description": "Fecha o assistente.",
            "parameters": { "type": "OBJECT", "properties": {} }
        }
    ])
}

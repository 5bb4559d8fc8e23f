//! alba-notify: trigger Alba notifications and task actions from the shell.
//!
//! Posts to the local API of a running alba-rs daemon. Meant for cron jobs
//! and other external schedulers that want push-style reminders.

use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use reqwest::Client;
use serde::{Deserialize, Serialize};

#[derive(Parser, Debug)]
#[command(name = "alba-notify", about = "Send notifications and task actions to Alba")]
struct Args {
    /// Port of the local Alba API
    #[arg(short, long, default_value_t = 8787)]
    port: u16,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show a notification through the daemon
    Push {
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        body: Option<String>,
        /// Attach Concluir/Dispensar actions for this task
        #[arg(long)]
        task_id: Option<String>,
    },
    /// Mark a task as completed
    Complete { task_id: String },
    /// Dismiss a task's alert
    Dismiss { task_id: String },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PushRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    task_id: Option<String>,
}

#[derive(Serialize)]
struct BusRequest<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    action: &'static str,
    #[serde(rename = "taskId")]
    task_id: &'a str,
}

#[derive(Deserialize)]
struct ApiResponse {
    status: String,
    error: Option<String>,
    delivered: Option<usize>,
}

fn task_action<'a>(action: &'static str, task_id: &'a str) -> BusRequest<'a> {
    BusRequest {
        kind: "TASK_ACTION",
        action,
        task_id,
    }
}

async fn post<T: Serialize>(client: &Client, url: &str, body: &T) -> Result<ApiResponse, String> {
    let resp = client
        .post(url)
        .json(body)
        .send()
        .await
        .map_err(|e| format!("Alba is not reachable at {url}: {e}"))?;
    let status = resp.status();
    let parsed: ApiResponse = resp
        .json()
        .await
        .map_err(|e| format!("Unexpected response ({status}): {e}"))?;
    if !status.is_success() {
        return Err(parsed.error.unwrap_or_else(|| status.to_string()));
    }
    Ok(parsed)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();
    let base = format!("http://127.0.0.1:{}", args.port);

    let client = Client::builder()
        .connect_timeout(Duration::from_millis(300))
        .timeout(Duration::from_secs(3))
        .build()
        .unwrap_or_else(|_| Client::new());

    let result = match &args.command {
        Command::Push {
            title,
            body,
            task_id,
        } => {
            let request = PushRequest {
                title: title.clone(),
                body: body.clone(),
                task_id: task_id.clone(),
            };
            post(&client, &format!("{base}/push"), &request).await
        }
        Command::Complete { task_id } => {
            post(&client, &format!("{base}/bus"), &task_action("complete", task_id)).await
        }
        Command::Dismiss { task_id } => {
            post(&client, &format!("{base}/bus"), &task_action("dismiss", task_id)).await
        }
    };

    match result {
        Ok(resp) => {
            match resp.delivered {
                Some(n) => println!("{} ({n} listeners)", resp.status),
                None => println!("{}", resp.status),
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("alba-notify: {e}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_action_matches_bus_format() {
        let json = serde_json::to_value(task_action("complete", "abc")).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "TASK_ACTION", "action": "complete", "taskId": "abc"})
        );
    }

    #[test]
    fn test_push_omits_missing_fields() {
        let request = PushRequest {
            title: Some("Alba".into()),
            body: None,
            task_id: Some("t1".into()),
        };
        let json = serde_json::to_value(request).unwrap();
        assert_eq!(json, serde_json::json!({"title": "Alba", "taskId": "t1"}));
    }

    #[test]
    fn test_parses_subcommands() {
        let args = Args::parse_from(["alba-notify", "-p", "9000", "dismiss", "t1"]);
        assert_eq!(args.port, 9000);
        assert!(matches!(args.command, Command::Dismiss { ref task_id } if task_id == "t1"));

        let args = Args::parse_from(["alba-notify", "push", "--title", "Oi", "--task-id", "t2"]);
        match args.command {
            Command::Push { title, body, task_id } => {
                assert_eq!(title.as_deref(), Some("Oi"));
                assert!(body.is_none());
                assert_eq!(task_id.as_deref(), Some("t2"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}

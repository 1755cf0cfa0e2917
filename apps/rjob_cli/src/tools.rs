//! JSON-lines adapter exposing the orchestrator operations as named tools.

use anyhow::{Context, Result};
use rjob_engine::Orchestrator;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

pub const DEFAULT_GRACE_SECONDS: u64 = 10;

#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "tool", rename_all = "snake_case")]
pub enum ToolRequest {
    Submit {
        script_path: PathBuf,
        work_dir: PathBuf,
    },
    GetStatus,
    GetLastResult,
    TerminateCurrentTask {
        #[serde(default = "default_reason")]
        reason: String,
        #[serde(default = "default_grace")]
        grace_seconds: u64,
    },
}

fn default_reason() -> String {
    "requested by caller".into()
}

fn default_grace() -> u64 {
    DEFAULT_GRACE_SECONDS
}

/// One parsed request line. `id` is echoed back verbatim when present.
#[derive(Debug)]
pub struct ToolCall {
    pub id: Option<Value>,
    pub request: ToolRequest,
}

impl ToolCall {
    /// Termination can take the whole grace window and must not hold up other requests.
    pub fn is_long_running(&self) -> bool {
        matches!(self.request, ToolRequest::TerminateCurrentTask { .. })
    }
}

/// Parses a request line, or returns the error response to send instead.
pub fn parse_line(line: &str) -> Result<ToolCall, Value> {
    let value: Value = serde_json::from_str(line)
        .map_err(|err| json!({ "error": format!("invalid request: {err}") }))?;
    let id = value.get("id").cloned();
    match serde_json::from_value::<ToolRequest>(value) {
        Ok(request) => Ok(ToolCall { id, request }),
        Err(err) => Err(with_id(json!({ "error": format!("invalid request: {err}") }), id)),
    }
}

pub async fn handle(orchestrator: &Orchestrator, request: ToolRequest) -> serde_json::Result<Value> {
    match request {
        ToolRequest::Submit {
            script_path,
            work_dir,
        } => serde_json::to_value(orchestrator.submit(script_path, work_dir)),
        ToolRequest::GetStatus => serde_json::to_value(orchestrator.get_status()),
        ToolRequest::GetLastResult => serde_json::to_value(orchestrator.get_last_result()),
        ToolRequest::TerminateCurrentTask {
            reason,
            grace_seconds,
        } => serde_json::to_value(
            orchestrator
                .terminate_current_task(&reason, grace_seconds)
                .await,
        ),
    }
}

/// Runs a parsed call. Never fails: encoding problems become `{"error": ...}`.
pub async fn respond(orchestrator: &Orchestrator, call: ToolCall) -> Value {
    let response = match handle(orchestrator, call.request).await {
        Ok(value) => value,
        Err(err) => json!({ "error": format!("could not encode response: {err}") }),
    };
    with_id(response, call.id)
}

fn with_id(mut response: Value, id: Option<Value>) -> Value {
    if let (Some(id), Some(object)) = (id, response.as_object_mut()) {
        object.insert("id".into(), id);
    }
    response
}

/// Answers request lines from `input` on `output` until input closes and every
/// outstanding termination has replied.
///
/// Quick requests are answered in order. Terminations run on their own task and
/// reply when they finish, so status queries keep flowing meanwhile.
pub async fn serve_lines<R, W>(orchestrator: &Orchestrator, input: R, mut output: W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<Value>();
    let mut tx = Some(tx);
    let mut lines = input.lines();
    loop {
        tokio::select! {
            line = lines.next_line(), if tx.is_some() => {
                let Some(line) = line.context("reading requests")? else {
                    tx = None;
                    continue;
                };
                if line.trim().is_empty() {
                    continue;
                }
                match parse_line(&line) {
                    Ok(call) if call.is_long_running() => {
                        if let Some(tx) = &tx {
                            let tx = tx.clone();
                            let orchestrator = orchestrator.clone();
                            tokio::spawn(async move {
                                let _ = tx.send(respond(&orchestrator, call).await);
                            });
                        }
                    }
                    Ok(call) => write_line(&mut output, &respond(orchestrator, call).await).await?,
                    Err(response) => write_line(&mut output, &response).await?,
                }
            }
            response = rx.recv() => match response {
                Some(response) => write_line(&mut output, &response).await?,
                None => break,
            },
        }
    }
    Ok(())
}

async fn write_line<W: AsyncWrite + Unpin>(output: &mut W, response: &Value) -> Result<()> {
    let mut encoded = serde_json::to_string(response)?;
    encoded.push('\n');
    output.write_all(encoded.as_bytes()).await?;
    output.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rjob_remote::config::StaticSettings;
    use rjob_model::Stage;
    use rjob_remote::mock::MockHost;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::tempdir;
    use tokio::io::BufReader;

    async fn dispatch_line(orchestrator: &Orchestrator, line: &str) -> Value {
        match parse_line(line) {
            Ok(call) => respond(orchestrator, call).await,
            Err(response) => response,
        }
    }

    fn orchestrator(root: &std::path::Path) -> Orchestrator {
        Orchestrator::new(
            Arc::new(MockHost::new(root)),
            Arc::new(StaticSettings(MockHost::settings())),
        )
    }

    #[test]
    fn terminate_defaults_apply() {
        let request: ToolRequest =
            serde_json::from_str(r#"{"tool":"terminate_current_task"}"#).expect("parse");
        assert_eq!(
            request,
            ToolRequest::TerminateCurrentTask {
                reason: "requested by caller".into(),
                grace_seconds: DEFAULT_GRACE_SECONDS,
            }
        );
    }

    #[tokio::test]
    async fn malformed_lines_become_errors() {
        let dir = tempdir().expect("tempdir");
        let orch = orchestrator(dir.path());
        let unknown = dispatch_line(&orch, r#"{"tool":"reboot"}"#).await;
        assert!(unknown["error"].as_str().is_some_and(|e| e.contains("invalid request")));
        let garbage = dispatch_line(&orch, "not json").await;
        assert!(garbage.get("error").is_some());
    }

    #[tokio::test]
    async fn request_ids_are_echoed() {
        let dir = tempdir().expect("tempdir");
        let orch = orchestrator(dir.path());
        let status = dispatch_line(&orch, r#"{"tool":"get_status","id":7}"#).await;
        assert_eq!(status["id"], 7);
        assert_eq!(status["status"], "idle");
        let unknown = dispatch_line(&orch, r#"{"tool":"reboot","id":"r1"}"#).await;
        assert_eq!(unknown["id"], "r1");
        assert!(unknown["error"].is_string());
        let plain = dispatch_line(&orch, r#"{"tool":"get_last_result"}"#).await;
        assert!(plain.get("id").is_none());
    }

    async fn next_reply<R: AsyncBufRead + Unpin>(replies: &mut tokio::io::Lines<R>) -> Value {
        let line = tokio::time::timeout(Duration::from_secs(10), replies.next_line())
            .await
            .expect("reply in time")
            .expect("read reply")
            .expect("reply line");
        serde_json::from_str(&line).expect("json reply")
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn status_is_answered_while_termination_waits() {
        let dir = tempdir().expect("tempdir");
        let work = dir.path().join("work");
        std::fs::create_dir_all(&work).expect("mkdir");
        let script = work.join("main.py");
        std::fs::write(&script, "# rjob-mock: sleep_ms=60000\n# rjob-mock: ignore_term\n")
            .expect("write");
        let orch = orchestrator(&dir.path().join("remote-home"));

        let (client, server) = tokio::io::duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server);
        let serving = {
            let orch = orch.clone();
            tokio::spawn(async move {
                serve_lines(&orch, BufReader::new(server_read), server_write).await
            })
        };
        let (client_read, mut client_write) = tokio::io::split(client);
        let mut replies = BufReader::new(client_read).lines();

        let submit = json!({"tool": "submit", "id": 1, "script_path": &script, "work_dir": &work});
        client_write
            .write_all(format!("{submit}\n").as_bytes())
            .await
            .expect("send submit");
        let accepted = next_reply(&mut replies).await;
        assert_eq!(accepted["id"], 1);
        assert_eq!(accepted["accepted"], true);

        let started = tokio::time::Instant::now();
        loop {
            let status = orch.get_status();
            if status.job.is_some_and(|job| job.stage == Stage::Executing) {
                break;
            }
            assert!(started.elapsed() < Duration::from_secs(10), "script never started");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        client_write
            .write_all(
                concat!(
                    r#"{"tool":"terminate_current_task","id":"stop","grace_seconds":2}"#,
                    "\n",
                    r#"{"tool":"get_status","id":"status"}"#,
                    "\n"
                )
                .as_bytes(),
            )
            .await
            .expect("send requests");
        let asked = tokio::time::Instant::now();

        let status = next_reply(&mut replies).await;
        assert_eq!(status["id"], "status");
        assert_eq!(status["status"], "running");
        assert!(asked.elapsed() < Duration::from_secs(1));

        let terminated = next_reply(&mut replies).await;
        assert_eq!(terminated["id"], "stop");
        assert_eq!(terminated["accepted"], true);
        assert_eq!(terminated["outcome"], "terminated_forcefully");

        client_write.shutdown().await.expect("close input");
        serving.await.expect("join").expect("serve");
    }

    #[tokio::test]
    async fn idle_orchestrator_answers_every_tool() {
        let dir = tempdir().expect("tempdir");
        let orch = orchestrator(dir.path());

        let status = dispatch_line(&orch, r#"{"tool":"get_status"}"#).await;
        assert_eq!(status["status"], "idle");
        let result = dispatch_line(&orch, r#"{"tool":"get_last_result"}"#).await;
        assert_eq!(result["available"], false);
        let terminate =
            dispatch_line(&orch, r#"{"tool":"terminate_current_task","grace_seconds":1}"#).await;
        assert_eq!(terminate["accepted"], false);
        assert_eq!(terminate["reason"], "not_running");
        let submit = dispatch_line(
            &orch,
            r#"{"tool":"submit","script_path":"/nonexistent/run.py","work_dir":"/nonexistent"}"#,
        )
        .await;
        assert_eq!(submit["reason"], "invalid_input");
    }
}

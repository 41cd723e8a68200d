use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::info;

use webtty_common::{ExecRequest, ExecResponse};

use crate::app::App;

/// Per-stream capture cap. Reaching it appends the truncation trailer and
/// stops the pump.
const MAX_OUTPUT_SIZE: usize = 40960;
const TRUNCATION_TRAILER: &str = "...<More contents were truncated>";
/// Hard wall-clock limit for one exec request.
const EXEC_TIMEOUT: Duration = Duration::from_secs(60);
const READ_CHUNK: usize = 1024;

/// `/rexec`: one-shot command execution with bounded output capture.
///
/// Non-POST requests get 200 with no body, preserved for existing callers.
pub async fn handle_rexec(
    State(app): State<Arc<App>>,
    method: Method,
    body: Bytes,
) -> Response {
    let content_type = [(header::CONTENT_TYPE, "application/json;charset=UTF-8")];
    if method != Method::POST {
        return (StatusCode::OK, content_type, String::new()).into_response();
    }
    let request: ExecRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(_) => return StatusCode::BAD_REQUEST.into_response(),
    };
    info!(request = ?request, "exec");
    let response = run_exec(request, app.run_as).await;
    (content_type, Json(response)).into_response()
}

/// Spawn the command, capture stdout/stderr up to the cap, and wait for the
/// earliest of: one stream draining, the 60 s deadline. The child is then
/// killed and reaped; a non-zero exit lands in `Error`, never in the HTTP
/// status.
pub async fn run_exec(request: ExecRequest, run_as: Option<(u32, u32)>) -> ExecResponse {
    let mut response = ExecResponse {
        request: request.clone(),
        ..Default::default()
    };

    let mut cmd = Command::new(&request.command);
    cmd.args(&request.arguments)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some((uid, gid)) = run_as {
        cmd.uid(uid).gid(gid);
    }

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            response.error = format!("Can not start command {:?}: {}", request.command, e);
            return response;
        }
    };
    let stdout = child.stdout.take().expect("stdout piped");
    let stderr = child.stderr.take().expect("stderr piped");

    // One slot per pump; the first finisher triggers cancellation.
    let (done_tx, mut done_rx) = mpsc::channel::<()>(2);
    let stdout_task = tokio::spawn(read_capped(
        stdout,
        "stdout",
        request.command.clone(),
        done_tx.clone(),
    ));
    let stderr_task = tokio::spawn(read_capped(
        stderr,
        "stderr",
        request.command.clone(),
        done_tx,
    ));

    tokio::select! {
        _ = done_rx.recv() => {}
        _ = tokio::time::sleep(EXEC_TIMEOUT) => {}
    }
    let _ = child.start_kill();

    match child.wait().await {
        Ok(status) if !status.success() => {
            response.error = format!(
                "Exit with error for command {:?}: {}",
                request.command,
                describe_exit(status)
            );
        }
        Ok(_) => {}
        Err(e) => {
            response.error = format!("Can not wait for command {:?}: {}", request.command, e);
        }
    }

    response.output1 = stdout_task.await.unwrap_or_default();
    response.output2 = stderr_task.await.unwrap_or_default();
    response
}

async fn read_capped(
    mut stream: impl AsyncRead + Unpin,
    name: &'static str,
    command: String,
    done: mpsc::Sender<()>,
) -> String {
    let mut captured: Vec<u8> = Vec::with_capacity(4096);
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        match stream.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                let room = MAX_OUTPUT_SIZE - captured.len();
                captured.extend_from_slice(&chunk[..n.min(room)]);
                if captured.len() >= MAX_OUTPUT_SIZE {
                    let mut text = String::from_utf8_lossy(&captured).into_owned();
                    text.push_str(TRUNCATION_TRAILER);
                    let _ = done.send(()).await;
                    return text;
                }
            }
            Err(e) => {
                let mut text = String::from_utf8_lossy(&captured).into_owned();
                text.push_str(&format!(
                    "...<Error occurred while reading {name} for command {command:?}: {e}>"
                ));
                let _ = done.send(()).await;
                return text;
            }
        }
    }
    let _ = done.send(()).await;
    String::from_utf8_lossy(&captured).into_owned()
}

fn describe_exit(status: std::process::ExitStatus) -> String {
    if let Some(code) = status.code() {
        format!("exit status {code}")
    } else if let Some(signum) = status.signal() {
        match nix::sys::signal::Signal::try_from(signum) {
            Ok(signal) => format!("signal: {}", signal.as_str()),
            Err(_) => format!("signal: {signum}"),
        }
    } else {
        "unknown exit status".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(command: &str, arguments: &[&str]) -> ExecRequest {
        ExecRequest {
            context: "test".to_string(),
            command: command.to_string(),
            arguments: arguments.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn captures_stdout_and_echoes_the_request() {
        let response = run_exec(request("echo", &["hello"]), None).await;
        assert_eq!(response.output1, "hello\n");
        assert_eq!(response.output2, "");
        assert_eq!(response.error, "");
        assert_eq!(response.request.command, "echo");
        assert_eq!(response.request.context, "test");
    }

    #[tokio::test]
    async fn captures_stderr_separately() {
        let response = run_exec(request("sh", &["-c", "echo oops >&2"]), None).await;
        assert_eq!(response.output1, "");
        assert_eq!(response.output2, "oops\n");
        assert_eq!(response.error, "");
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported_in_error_only() {
        let response = run_exec(request("sh", &["-c", "exit 3"]), None).await;
        assert!(
            response.error.contains("exit status 3"),
            "unexpected error: {}",
            response.error
        );
    }

    #[tokio::test]
    async fn unknown_binary_reports_start_failure() {
        let response = run_exec(request("/no/such/webtty-exec", &[]), None).await;
        assert!(
            response.error.starts_with("Can not start command"),
            "unexpected error: {}",
            response.error
        );
        assert_eq!(response.output1, "");
    }

    #[tokio::test]
    #[ignore = "takes the full 60 s exec deadline"]
    async fn long_running_commands_are_killed_at_the_deadline() {
        let started = std::time::Instant::now();
        let response = run_exec(request("sleep", &["120"]), None).await;
        let elapsed = started.elapsed();
        assert!(
            elapsed >= EXEC_TIMEOUT && elapsed < EXEC_TIMEOUT + Duration::from_secs(10),
            "deadline not enforced: {elapsed:?}"
        );
        assert!(
            response.error.contains("signal"),
            "expected a kill report, got: {}",
            response.error
        );
    }

    #[tokio::test]
    async fn unbounded_output_is_truncated_and_the_child_killed() {
        let response = run_exec(request("yes", &["x"]), None).await;
        assert!(
            response.output1.ends_with(TRUNCATION_TRAILER),
            "stdout should end with the truncation trailer"
        );
        assert!(
            response.output1.len() <= MAX_OUTPUT_SIZE + TRUNCATION_TRAILER.len(),
            "capture exceeded the cap: {}",
            response.output1.len()
        );
        assert!(
            response.error.contains("signal"),
            "expected a kill signal in the error, got: {}",
            response.error
        );
    }
}

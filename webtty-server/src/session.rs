use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::{error, info, warn};

use webtty_common::{InitMessage, ServerFrame, SUBPROTOCOL};

use crate::app::App;
use crate::bridge::{self, BridgeSettings};
use crate::lifecycle::ConnectionGuard;
use crate::pty::PtyProcess;
use crate::title::TitleVars;

/// `GET /ws`: admission, upgrade, authentication, spawn, bridge, teardown.
///
/// The method router already answers non-GET requests with 405, so this
/// handler only runs for upgrade candidates.
pub async fn handle_ws(
    State(app): State<Arc<App>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    app.lifecycle.stop_idle_timer();

    let guard = app.lifecycle.acquire();
    let max = app.options.max_connection;
    if max > 0 && guard.previous() >= max {
        warn!(remote = %remote, max, "reached max connection");
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    info!(remote = %remote, "new client connected");

    ws.protocols([SUBPROTOCOL])
        .on_upgrade(move |socket| handle_session(app, socket, remote, guard))
}

/// Runs for the whole session. The connection guard is held to the end, so
/// every exit path (auth failure, once-loss, spawn failure, normal teardown)
/// releases the counter slot and rearms the idle timer when it was the last.
async fn handle_session(
    app: Arc<App>,
    mut socket: WebSocket,
    remote: SocketAddr,
    guard: ConnectionGuard,
) {
    let init = match read_init(&mut socket).await {
        Ok(init) => init,
        Err(reason) => {
            warn!(remote = %remote, reason, "failed to authenticate websocket connection");
            return;
        }
    };
    if init.auth_token != app.options.credential {
        warn!(remote = %remote, "failed to authenticate websocket connection");
        return;
    }

    let argv = build_argv(&app.command, &init, app.options.permit_arguments);

    if app.options.once {
        if app.lifecycle.try_once() {
            info!("last client accepted, closing the listener");
            app.lifecycle.exit();
        } else {
            info!(remote = %remote, "server is already closing");
            return;
        }
    }

    let _registration = app.lifecycle.register_session();

    let dims = (app.options.width > 0 && app.options.height > 0)
        .then_some((app.options.width, app.options.height));
    let mut pty = match PtyProcess::spawn(&argv, app.run_as, dims) {
        Ok(pty) => pty,
        Err(e) => {
            error!(remote = %remote, error = %e, "failed to execute command");
            return;
        }
    };

    if app.options.max_connection > 0 {
        info!(
            remote = %remote,
            pid = pty.pid(),
            args = ?argv,
            connections = guard.count(),
            max = app.options.max_connection,
            "command is running"
        );
    } else {
        info!(
            remote = %remote,
            pid = pty.pid(),
            args = ?argv,
            connections = guard.count(),
            "command is running"
        );
    }

    let title = app.title.render(&TitleVars {
        command: app.command.join(" "),
        hostname: app.hostname.clone(),
        remote_addr: remote.to_string(),
        pid: pty.pid(),
    });
    let mut greeting = vec![
        ServerFrame::SetWindowTitle(title),
        ServerFrame::SetPreferences(serde_json::Value::Object(app.options.preferences.clone())),
    ];
    if app.options.enable_reconnect {
        greeting.push(ServerFrame::SetReconnect(app.options.reconnect_time));
    }

    let settings = BridgeSettings {
        permit_write: app.options.permit_write,
        fixed_cols: app.options.width,
        fixed_rows: app.options.height,
    };
    bridge::run(socket, &mut pty, greeting, settings).await;

    pty.shutdown(app.options.close_signal).await;
    info!(remote = %remote, "connection closed");
}

/// Read exactly one init frame. Transport ping/pong noise is skipped; any
/// other shape fails authentication.
async fn read_init(socket: &mut WebSocket) -> Result<InitMessage, String> {
    loop {
        return match socket.recv().await {
            Some(Ok(Message::Text(text))) => serde_json::from_str(text.as_str())
                .map_err(|e| format!("failed to parse init message: {e}")),
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(_)) => Err("unexpected first frame".to_string()),
            Some(Err(e)) => Err(format!("websocket error: {e}")),
            None => Err("connection closed before init".to_string()),
        };
    }
}

/// Extend the configured command line with client-supplied `?arg=` values
/// when permitted.
fn build_argv(base: &[String], init: &InitMessage, permit_arguments: bool) -> Vec<String> {
    let mut argv = base.to_vec();
    if permit_arguments {
        let query = init.arguments.trim_start_matches('?');
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            if key == "arg" {
                argv.push(value.into_owned());
            }
        }
    }
    argv
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Vec<String> {
        vec!["tail".to_string(), "-f".to_string()]
    }

    fn init(arguments: &str) -> InitMessage {
        InitMessage {
            arguments: arguments.to_string(),
            auth_token: String::new(),
        }
    }

    #[test]
    fn arguments_are_dropped_unless_permitted() {
        let argv = build_argv(&base(), &init("?arg=/var/log/syslog"), false);
        assert_eq!(argv, base());
    }

    #[test]
    fn permitted_arguments_extend_argv_in_order() {
        let argv = build_argv(&base(), &init("?arg=a&arg=b&arg=c"), true);
        assert_eq!(argv, vec!["tail", "-f", "a", "b", "c"]);
    }

    #[test]
    fn non_arg_keys_are_ignored() {
        let argv = build_argv(&base(), &init("?foo=1&arg=x&bar=2"), true);
        assert_eq!(argv, vec!["tail", "-f", "x"]);
    }

    #[test]
    fn values_are_percent_decoded() {
        let argv = build_argv(&base(), &init("?arg=%2Fvar%2Flog%2Fmessages"), true);
        assert_eq!(argv, vec!["tail", "-f", "/var/log/messages"]);
    }

    #[test]
    fn empty_arguments_leave_argv_untouched() {
        assert_eq!(build_argv(&base(), &init(""), true), base());
        assert_eq!(build_argv(&base(), &init("?"), true), base());
    }
}

use std::net::SocketAddr;

use anyhow::Result;
use chrono::Local;
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    select,
    sync::mpsc,
};
use tracing::warn;

use crate::{
    cli::ClientArgs,
    config::{SessionConfig, resolve_server_address},
    session::{ClientSession, ConnectionState, SessionEvent},
};

enum Input {
    Continue,
    Leave,
}

pub async fn run(args: ClientArgs) -> Result<()> {
    let mut server = resolve_server_address(&args.server).await?;
    let (session, mut events) = ClientSession::new(SessionConfig::from(&args));
    session.connect(server).await;

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    run_client_loop(&session, &mut events, &mut stdin, &mut server).await
}

async fn run_client_loop(
    session: &ClientSession,
    events: &mut mpsc::UnboundedReceiver<SessionEvent>,
    stdin: &mut io::Lines<BufReader<io::Stdin>>,
    server: &mut SocketAddr,
) -> Result<()> {
    let mut leaving = false;

    loop {
        select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                if !handle_session_event(event, session, *server, leaving).await? {
                    break;
                }
            }
            line = stdin.next_line(), if !leaving => {
                if let Input::Leave = handle_stdin_input(line, session, server).await? {
                    write_stdout("*** leaving chat").await?;
                    leaving = true;
                    if !begin_leaving(session).await {
                        break;
                    }
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                break;
            }
        }
    }

    Ok(())
}

/// Returns `false` when there is nothing left to wait for.
async fn begin_leaving(session: &ClientSession) -> bool {
    match session.state().await {
        ConnectionState::Disconnected => false,
        ConnectionState::Disconnecting => true,
        ConnectionState::Connecting | ConnectionState::Connected => session.disconnect().await,
    }
}

async fn handle_session_event(
    event: SessionEvent,
    session: &ClientSession,
    server: SocketAddr,
    leaving: bool,
) -> Result<bool> {
    match event {
        SessionEvent::StateChanged(state) => {
            render_state(state, session, server).await?;
            Ok(!(leaving && state == ConnectionState::Disconnected))
        }
        SessionEvent::MessageReceived(message) => {
            let time = message.received_at.with_timezone(&Local).format("%H:%M:%S");
            write_stdout(&format!(
                "[{time}] <{}> {}",
                message.sender_tag,
                message.payload_text()
            ))
            .await?;
            Ok(true)
        }
        SessionEvent::Error { detail, .. } => {
            write_stderr(&format!("!!! {detail}")).await?;
            Ok(true)
        }
    }
}

async fn render_state(
    state: ConnectionState,
    session: &ClientSession,
    server: SocketAddr,
) -> io::Result<()> {
    match state {
        ConnectionState::Connecting => write_stdout(&format!("*** connecting to {server}")).await,
        ConnectionState::Connected => match session.local_addr().await {
            Some(local) => write_stdout(&format!("*** connected to {server} as {local}")).await,
            None => write_stdout(&format!("*** connected to {server}")).await,
        },
        ConnectionState::Disconnecting => write_stdout("*** disconnecting").await,
        ConnectionState::Disconnected => write_stdout("*** disconnected").await,
    }
}

async fn handle_stdin_input(
    line: io::Result<Option<String>>,
    session: &ClientSession,
    server: &mut SocketAddr,
) -> Result<Input> {
    let Some(line) = line? else {
        return Ok(Input::Leave);
    };

    let text = line.trim_end();
    if text.is_empty() {
        return Ok(Input::Continue);
    }

    match text.split_once(' ').map_or((text, ""), |(cmd, rest)| (cmd, rest.trim())) {
        (cmd, _) if cmd.eq_ignore_ascii_case("/quit") => return Ok(Input::Leave),
        (cmd, _) if cmd.eq_ignore_ascii_case("/disconnect") => {
            session.disconnect().await;
        }
        (cmd, target) if cmd.eq_ignore_ascii_case("/connect") => {
            if !target.is_empty() {
                match resolve_server_address(target).await {
                    Ok(addr) => *server = addr,
                    Err(err) => {
                        write_stderr(&format!("!!! {err:#}")).await?;
                        return Ok(Input::Continue);
                    }
                }
            }
            if !session.connect(*server).await {
                write_stderr("!!! already connected").await?;
            }
        }
        (cmd, _) if cmd.eq_ignore_ascii_case("/clear") => {
            write_stdout("\x1b[2J\x1b[H").await?;
        }
        _ => {
            session.send(text).await;
        }
    }

    Ok(Input::Continue)
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

async fn write_stderr(line: &str) -> io::Result<()> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(line.as_bytes()).await?;
    stderr.write_all(b"\n").await?;
    stderr.flush().await
}

use std::{path::Path, process::Stdio, time::Duration};

use anyhow::{Context, Result, anyhow};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, ChildStdout, Command},
    time::timeout,
};

const READ_TIMEOUT: Duration = Duration::from_secs(3);

#[tokio::test]
async fn cli_relay_end_to_end() -> Result<()> {
    let binary = assert_cmd::cargo::cargo_bin!("text_relay");

    let (mut server_child, mut server_stdout) = spawn_server(&binary).await?;
    let addr = read_server_addr(&mut server_stdout).await?;

    // Drain additional server logs in the background so the pipe never fills.
    let server_log_task = tokio::spawn(async move {
        drain_stdout(server_stdout).await;
    });

    let mut alice = spawn_client(&binary, &addr).await?;
    let mut bob = spawn_client(&binary, &addr).await?;

    // Bob's banner only proves his dial finished; give the server a moment to
    // register him before the first broadcast pass.
    tokio::time::sleep(Duration::from_millis(200)).await;

    // A multi-word message arrives intact, tagged with Alice's address.
    alice
        .send_line("hello world")
        .await
        .context("alice send line")?;
    let bob_hears_alice =
        read_line_expect(&mut bob.stdout, "waiting for bob to hear alice").await?;
    assert!(
        bob_hears_alice.ends_with(&format!("<{}> hello world", alice.local_addr)),
        "unexpected line: {bob_hears_alice}"
    );
    let alice_echo = read_line_expect(&mut alice.stdout, "waiting for alice echo").await?;
    assert!(
        alice_echo.ends_with(&format!("<{}> hello world", alice.local_addr)),
        "unexpected line: {alice_echo}"
    );

    // Bob replies and both clients see the message, including Bob's self-echo.
    bob.send_line("Hi  Alice,   spaces kept")
        .await
        .context("bob send line")?;
    let expected = format!("<{}> Hi  Alice,   spaces kept", bob.local_addr);
    let alice_hears_bob =
        read_line_expect(&mut alice.stdout, "waiting for alice to hear bob").await?;
    assert!(alice_hears_bob.ends_with(&expected), "{alice_hears_bob}");
    let bob_echo = read_line_expect(&mut bob.stdout, "waiting for bob echo").await?;
    assert!(bob_echo.ends_with(&expected), "{bob_echo}");

    // Each client leaves gracefully.
    for (client, name) in [(&mut alice, "alice"), (&mut bob, "bob")] {
        client.send_line("/quit").await.context("send quit")?;
        let leaving = read_line_expect(&mut client.stdout, "waiting for leave notice").await?;
        assert_eq!(leaving, "*** leaving chat");
        let disconnecting =
            read_line_expect(&mut client.stdout, "waiting for disconnecting").await?;
        assert_eq!(disconnecting, "*** disconnecting");
        let disconnected =
            read_line_expect(&mut client.stdout, "waiting for disconnected").await?;
        assert_eq!(disconnected, "*** disconnected");
        ensure_success(&mut client.child, name).await?;
    }

    // The server stays up after clients disconnect; terminate it manually.
    let _ = server_child.kill().await;
    let _ = server_child.wait().await;
    let _ = server_log_task.await;

    Ok(())
}

struct ClientProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    local_addr: String,
}

impl ClientProcess {
    async fn send_line(&mut self, line: &str) -> Result<()> {
        self.stdin
            .write_all(line.as_bytes())
            .await
            .with_context(|| format!("failed to send line '{line}'"))?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.flush().await?;
        Ok(())
    }
}

async fn spawn_server(binary: &Path) -> Result<(Child, BufReader<ChildStdout>)> {
    let mut cmd = Command::new(binary);
    cmd.arg("server")
        .arg("--listen")
        .arg("127.0.0.1:0")
        .env("NO_COLOR", "1")
        .env("RUST_LOG", "info")
        .stdout(Stdio::piped())
        .stderr(Stdio::null());

    let mut child = cmd.spawn().context("failed to spawn server")?;
    let stdout = child
        .stdout
        .take()
        .context("server stdout missing after spawn")?;

    Ok((child, BufReader::new(stdout)))
}

async fn read_server_addr(reader: &mut BufReader<ChildStdout>) -> Result<String> {
    let line = read_line(reader)
        .await?
        .context("server did not emit listening address")?;
    let trimmed = line.trim();
    let addr = trimmed
        .split_whitespace()
        .last()
        .context("unexpected server banner format")?;
    if !addr.contains(':') {
        return Err(anyhow!("server banner missing socket: {trimmed}"));
    }
    Ok(addr.to_string())
}

async fn spawn_client(binary: &Path, addr: &str) -> Result<ClientProcess> {
    let mut cmd = Command::new(binary);
    cmd.arg("client")
        .arg("--server")
        .arg(addr)
        .env("NO_COLOR", "1")
        .env("RUST_LOG", "off")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null());

    let mut child = cmd.spawn().context("failed to spawn client")?;

    let stdin = child
        .stdin
        .take()
        .context("client stdin missing after spawn")?;
    let stdout = child
        .stdout
        .take()
        .context("client stdout missing after spawn")?;
    let mut stdout = BufReader::new(stdout);

    let connecting = read_line_expect(&mut stdout, "waiting for connecting banner").await?;
    if connecting != format!("*** connecting to {addr}") {
        return Err(anyhow!("unexpected banner '{connecting}'"));
    }

    let connected = read_line_expect(&mut stdout, "waiting for connected banner").await?;
    let prefix = format!("*** connected to {addr} as ");
    let local_addr = connected
        .strip_prefix(&prefix)
        .with_context(|| format!("unexpected banner '{connected}'"))?
        .to_string();

    Ok(ClientProcess {
        child,
        stdin,
        stdout,
        local_addr,
    })
}

async fn read_line_expect(
    reader: &mut BufReader<ChildStdout>,
    description: &str,
) -> Result<String> {
    match read_line(reader).await {
        Ok(Some(line)) => Ok(line),
        Ok(None) => Err(anyhow!("{description}: stream closed")),
        Err(err) => Err(err.context(format!("{description}: failed to read line"))),
    }
}

async fn read_line(reader: &mut BufReader<ChildStdout>) -> Result<Option<String>> {
    let mut line = String::new();
    let read_future = reader.read_line(&mut line);
    let bytes_io = match timeout(READ_TIMEOUT, read_future).await {
        Ok(result) => result,
        Err(_) => return Err(anyhow!("timed out waiting for line")),
    };
    let byte_count = bytes_io?;
    if byte_count == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
}

async fn drain_stdout(mut reader: BufReader<ChildStdout>) {
    let mut buffer = String::new();
    while reader
        .read_line(&mut buffer)
        .await
        .map(|bytes| {
            let has_data = bytes > 0;
            if has_data {
                buffer.clear();
            }
            has_data
        })
        .unwrap_or(false)
    {}
}

async fn ensure_success(child: &mut Child, name: &str) -> Result<()> {
    let status = timeout(READ_TIMEOUT, child.wait())
        .await
        .map_err(|_| anyhow!("{name} did not exit"))?
        .with_context(|| format!("failed to await {name} process"))?;
    if !status.success() {
        return Err(anyhow!("{name} exited with status {status}"));
    }
    Ok(())
}

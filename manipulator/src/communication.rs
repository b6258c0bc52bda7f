use std::path::Path;

use anyhow::{Result, anyhow};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    net::UnixListener,
    sync::mpsc,
};
use tracing::{debug, info, warn};

use crate::{
    commands::parse_command,
    models::{CommandEnvelope, CommandResponse, CommandResult},
};

fn format_reply(result: CommandResult) -> String {
    match result {
        Ok(CommandResponse::Success | CommandResponse::Accepted) => "OK\n".to_string(),
        Ok(CommandResponse::Position(position)) => format!("Position: {}\n", position),
        Err(e) => format!("{}\n", e),
    }
}

async fn handle_line(line: &str, command_tx: &mpsc::Sender<CommandEnvelope>) -> String {
    let (envelope, receiver) = match parse_command(line) {
        Ok(Some(parsed)) => parsed,
        Ok(None) => return "Error: Invalid command format\n".to_string(),
        Err(e) => return format!("{}\n", e),
    };

    if command_tx.send(envelope).await.is_err() {
        return "Error: Failed to process command\n".to_string();
    }

    match receiver.await {
        Ok(result) => format_reply(result),
        Err(_) => "Error: Failed to receive response\n".to_string(),
    }
}

/// Serves one client: one command per line, one reply line per command.
pub async fn handle_client<S>(socket: S, command_tx: mpsc::Sender<CommandEnvelope>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(socket);
    let mut lines = BufReader::new(reader).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("Error reading from socket: {}", e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        debug!(command = %line.trim(), "Received command");
        let reply = handle_line(&line, &command_tx).await;
        if let Err(e) = writer.write_all(reply.as_bytes()).await {
            warn!("Error writing to socket: {}", e);
            break;
        }
    }
}

pub async fn run_communication_layer(
    socket_path: &Path,
    command_tx: mpsc::Sender<CommandEnvelope>,
) -> Result<()> {
    // A stale socket file from a previous run blocks the bind.
    if socket_path.exists() {
        std::fs::remove_file(socket_path)
            .map_err(|e| anyhow!("Failed to remove existing socket file: {}", e))?;
    }

    let listener =
        UnixListener::bind(socket_path).map_err(|e| anyhow!("Failed to bind to socket: {}", e))?;
    info!(path = %socket_path.display(), "Listening for commands");

    loop {
        let (socket, _) = listener
            .accept()
            .await
            .map_err(|e| anyhow!("Failed to accept connection: {}", e))?;

        let command_tx = command_tx.clone();
        tokio::spawn(async move {
            handle_client(socket, command_tx).await;
            debug!("Client disconnected");
        });
    }
}

//! frida-remote
//!
//! Small command-line front end for a remote Frida server. Server address
//! and transport come from `FRIDA_*` environment variables, a JSON config
//! file, or flags, in increasing order of precedence.
//!
//! The peer must speak this crate's JSON bus frames, not raw D-Bus.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::info;
use tracing_subscriber::EnvFilter;

use frida_remote_client::agent::ScriptOptions;
use frida_remote_client::config::TransportKind;
use frida_remote_client::{nodejs, Attachment, Client, ClientConfig, ScriptMessage};

#[derive(Parser, Debug)]
#[command(name = "frida-remote")]
#[command(about = "Inspect and instrument processes through a remote Frida server")]
#[command(long_about = "Inspect and instrument processes through a remote Frida server.\n\n\
The server must speak the JSON bus frames of frida-remote-client; a stock \
frida-server (D-Bus over websocket) needs a bridge in front of it.")]
struct Args {
    /// Server address (host:port)
    #[arg(long, short = 'H')]
    host: Option<String>,

    /// Transport to use (websocket or tcp)
    #[arg(long)]
    transport: Option<TransportKind>,

    /// JSON config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print server metadata
    Info,
    /// List running processes
    Ps,
    /// List installed applications
    Apps,
    /// Attach to a process and load a script into it
    Inject {
        #[arg(long)]
        pid: u32,
        #[arg(long)]
        script: PathBuf,
        /// Run the script inside the target's Node.js runtime
        #[arg(long)]
        node: bool,
    },
    /// Spawn a program with a script loaded before it starts
    Spawn {
        #[arg(long)]
        script: PathBuf,
        #[arg(required = true, last = true)]
        argv: Vec<String>,
    },
    /// Kill a process
    Kill { pid: u32 },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr; stdout carries command output.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(&args).context("Failed to load configuration")?;
    let client = Client::connect(&config)
        .await
        .with_context(|| format!("Failed to connect to {}", config.host))?;

    let result = run(&client, args.command).await;
    client.disconnect().await;
    result
}

fn load_config(args: &Args) -> Result<ClientConfig> {
    let mut config = match &args.config {
        Some(path) => ClientConfig::load(path)?,
        None => ClientConfig::from_env()?,
    };
    if let Some(host) = &args.host {
        config.host.clone_from(host);
    }
    if let Some(transport) = args.transport {
        config.transport = transport;
    }
    Ok(config)
}

async fn run(client: &Client, command: Command) -> Result<()> {
    match command {
        Command::Info => {
            let metadata = client.query_metadata().await.context("QuerySystemParameters failed")?;
            println!("{}", serde_json::to_string_pretty(&metadata)?);
        }
        Command::Ps => {
            for process in client.enumerate_processes().await? {
                println!("{:>7}  {}", process.pid, process.name);
            }
        }
        Command::Apps => {
            for app in client.enumerate_applications().await? {
                let pid = app.pid.map_or_else(|| "-".to_string(), |pid| pid.to_string());
                println!("{pid:>7}  {}  {}", app.name, app.identifier);
            }
        }
        Command::Inject { pid, script, node } => {
            let mut source = read_script(&script)?;
            if node {
                source = nodejs::build_injection_script(&source)?;
            }
            let attachment = client
                .attach_to_process(pid)
                .await
                .with_context(|| format!("Failed to attach to pid {pid}"))?;
            // Subscribe before loading so the script's first messages are kept.
            let messages = attachment.message_channel().await;
            load_script(&attachment, &source).await?;
            follow(client, messages).await;
        }
        Command::Spawn { script, argv } => {
            let source = read_script(&script)?;
            let (program, rest) = argv.split_first().context("No program given")?;
            let spawned = client
                .spawn_paused(program, rest)
                .await
                .with_context(|| format!("Failed to spawn {program}"))?;
            let messages = spawned.attachment.message_channel().await;
            load_script(&spawned.attachment, &source).await?;
            spawned.attachment.resume().await.context("Failed to resume")?;
            info!(pid = spawned.pid, "Spawned and resumed");
            follow(client, messages).await;
        }
        Command::Kill { pid } => {
            client.kill(pid).await.with_context(|| format!("Failed to kill pid {pid}"))?;
        }
    }
    Ok(())
}

fn read_script(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("Failed to read script {}", path.display()))
}

async fn load_script(attachment: &Attachment, source: &str) -> Result<()> {
    let mut script = attachment
        .create_script(source, &ScriptOptions::default())
        .await
        .context("Failed to create script")?;
    script.load().await.context("Script failed to load")?;
    info!(pid = attachment.pid(), script = %script.id(), "Script loaded");
    Ok(())
}

/// Print script messages as JSON lines until Ctrl-C or the connection drops.
async fn follow(client: &Client, mut messages: UnboundedReceiver<ScriptMessage>) {
    loop {
        tokio::select! {
            Some(msg) = messages.recv() => println!("{}", message_line(&msg)),
            () = client.closed() => {
                info!("Server closed the connection");
                return;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                return;
            }
        }
    }
}

fn message_line(msg: &ScriptMessage) -> serde_json::Value {
    let mut line = serde_json::to_value(&msg.message).unwrap_or_default();
    if let Some(object) = line.as_object_mut() {
        object.insert("script".into(), msg.script_id.0.into());
        if let Some(data) = &msg.data {
            object.insert("data_len".into(), data.len().into());
        }
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use frida_remote_client::agent::ScriptId;
    use frida_remote_client::Message;
    use serde_json::json;

    #[test]
    fn spawn_takes_program_after_separator() {
        let args = Args::parse_from([
            "frida-remote",
            "--transport",
            "tcp",
            "spawn",
            "--script",
            "hook.js",
            "--",
            "/usr/bin/node",
            "-e",
            "1",
        ]);
        assert_eq!(args.transport, Some(TransportKind::Tcp));
        match args.command {
            Command::Spawn { script, argv } => {
                assert_eq!(script, PathBuf::from("hook.js"));
                assert_eq!(argv, ["/usr/bin/node", "-e", "1"]);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn flags_override_config() {
        let args = Args::parse_from(["frida-remote", "-H", "10.0.0.2:27042", "ps"]);
        let config = load_config(&args).unwrap();
        assert_eq!(config.host, "10.0.0.2:27042");
    }

    #[test]
    fn message_line_tags_script_and_data() {
        let msg = ScriptMessage {
            script_id: ScriptId(2),
            message: Message::Send { payload: json!("pong") },
            data: Some(vec![1, 2, 3]),
        };
        assert_eq!(
            message_line(&msg),
            json!({"type": "send", "payload": "pong", "script": 2, "data_len": 3})
        );
    }
}

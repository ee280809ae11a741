//! Relay console CLI
//!
//! Registers with a relay server as a control session and issues one
//! operation per invocation: list online endpoints, run a shell command on
//! them, send any other action, or stream everything the relay reports.

use std::collections::HashSet;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use relay_proto::{
    ControlCommand, DEFAULT_PORT, DEFAULT_REPLY_TIMEOUT, Envelope, HostEntry, RelayClient,
    ServerMessage,
};
use serde_json::Value;
use tokio::time::Instant;
use tracing::debug;
use tracing_subscriber::EnvFilter;

const ROSTER_TIMEOUT: Duration = DEFAULT_REPLY_TIMEOUT;

#[derive(Parser)]
#[command(name = "relay")]
#[command(about = "Console for the remote-control relay")]
#[command(version)]
#[command(after_help = "\
Examples:
  relay hosts                                   List online endpoints
  relay exec -t desk-01 -- ipconfig /all        Run a command and print its output
  relay exec -t a -t b --admin -- whoami        Run elevated on two endpoints
  relay send -t desk-01 list_files '{\"path\":\"C:\\\\\"}'
  relay watch                                   Stream every relayed message as JSON
")]
struct Cli {
    /// Relay server address
    #[arg(short, long, global = true, default_value_t = default_server())]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

fn default_server() -> String {
    format!("127.0.0.1:{DEFAULT_PORT}")
}

#[derive(Subcommand)]
enum Commands {
    /// List endpoints currently online
    Hosts {
        /// Print the raw roster as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run a shell command on one or more endpoints
    Exec {
        /// Target endpoint identity (repeatable)
        #[arg(short, long = "target", required = true)]
        targets: Vec<String>,

        /// Ask the endpoint to run the command elevated
        #[arg(long)]
        admin: bool,

        /// Seconds to wait for results
        #[arg(long, default_value_t = 30)]
        wait: u64,

        /// Command line to run
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<String>,
    },

    /// Send an arbitrary action to one or more endpoints
    Send {
        /// Target endpoint identity (repeatable)
        #[arg(short, long = "target", required = true)]
        targets: Vec<String>,

        /// Seconds to keep printing replies
        #[arg(long, default_value_t = 5)]
        wait: u64,

        /// Action name, e.g. `screenshot` or `list_files`
        action: String,

        /// Action parameters as a JSON object
        params: Option<String>,
    },

    /// Print every message the relay sends, one JSON object per line
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Hosts { json } => run_hosts(&cli.server, json).await,
        Commands::Exec {
            targets,
            admin,
            wait,
            command,
        } => run_exec(&cli.server, targets, admin, wait, command.join(" ")).await,
        Commands::Send {
            targets,
            wait,
            action,
            params,
        } => run_send(&cli.server, targets, wait, &action, params.as_deref()).await,
        Commands::Watch => run_watch(&cli.server).await,
    }
}

async fn connect(server: &str) -> Result<RelayClient> {
    RelayClient::connect_controller(server)
        .await
        .with_context(|| format!("Failed to register with relay at {server}. Is it running?"))
}

async fn run_hosts(server: &str, json: bool) -> Result<()> {
    let mut client = connect(server).await?;
    let hosts = client
        .list_hosts(ROSTER_TIMEOUT)
        .await
        .context("List hosts request failed")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&hosts)?);
        return Ok(());
    }

    if hosts.is_empty() {
        println!("No endpoints online.");
        return Ok(());
    }

    println!("\nOnline endpoints:\n");
    for host in &hosts {
        print_host(host);
    }
    println!();
    Ok(())
}

fn print_host(host: &HostEntry) {
    print!("  {:<20} {:<16} {}", host.id, host.ip, host.custom_name);
    if host.custom_name != host.hostname {
        print!(" ({})", host.hostname);
    }
    println!();
    println!("                       {}", host.platform);
}

async fn run_exec(
    server: &str,
    targets: Vec<String>,
    admin: bool,
    wait: u64,
    command: String,
) -> Result<()> {
    let mut client = connect(server).await?;
    let run = ControlCommand::RunCommand {
        command,
        as_admin: admin,
    };
    client
        .send_command(&run, &targets)
        .await
        .context("Failed to send command")?;

    let mut pending: HashSet<String> = targets.into_iter().collect();
    let deadline = Instant::now() + Duration::from_secs(wait);

    while !pending.is_empty() {
        let Some(envelope) = next_reply(&mut client, deadline).await? else {
            break;
        };

        if let Some(agent) = envelope.agent_id().map(str::to_string) {
            if !pending.contains(&agent) {
                continue;
            }
            match envelope.kind() {
                Some("command_result") => {
                    let output = envelope
                        .get("output")
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    println!("[{agent}]\n{output}");
                    pending.remove(&agent);
                }
                Some("error") => {
                    let message = envelope
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown error");
                    eprintln!("[{agent}] error: {message}");
                    pending.remove(&agent);
                }
                _ => {}
            }
        } else if let Ok(ServerMessage::Error { message }) = envelope.parse::<ServerMessage>() {
            eprintln!("relay: {message}");
            if let Some(target) = offline_target(&message) {
                pending.remove(target);
            }
        }
    }

    if !pending.is_empty() {
        let mut missing: Vec<_> = pending.into_iter().collect();
        missing.sort();
        bail!("No result from {} within {wait}s", missing.join(", "));
    }
    Ok(())
}

async fn run_send(
    server: &str,
    targets: Vec<String>,
    wait: u64,
    action: &str,
    params: Option<&str>,
) -> Result<()> {
    let command = parse_command(action, params)?;
    if command.is_presence_request() {
        bail!("'{action}' is answered by the relay itself; use `relay hosts`");
    }

    let mut client = connect(server).await?;
    client
        .send_command(&command, &targets)
        .await
        .context("Failed to send command")?;

    let deadline = Instant::now() + Duration::from_secs(wait);
    while let Some(envelope) = next_reply(&mut client, deadline).await? {
        let relevant = envelope
            .agent_id()
            .is_none_or(|agent| targets.iter().any(|t| t == agent));
        if relevant {
            println!("{}", serde_json::to_string(&envelope)?);
        }
    }
    Ok(())
}

async fn run_watch(server: &str) -> Result<()> {
    let mut client = connect(server).await?;
    client
        .send_command(&ControlCommand::ListHosts, &[])
        .await
        .context("Failed to request roster")?;

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for Ctrl-C")?;
                break;
            }
            next = client.recv() => {
                let Some(envelope) = next else {
                    eprintln!("Relay closed the connection");
                    break;
                };
                if envelope.kind() == Some("ping") {
                    client.pong().await.context("Failed to answer ping")?;
                    continue;
                }
                println!("{}", serde_json::to_string(&envelope)?);
            }
        }
    }
    Ok(())
}

/// Next non-ping envelope before `deadline`, answering pings on the way.
async fn next_reply(client: &mut RelayClient, deadline: Instant) -> Result<Option<Envelope>> {
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(None);
        }
        let Ok(next) = tokio::time::timeout(remaining, client.recv()).await else {
            return Ok(None);
        };
        let Some(envelope) = next else {
            bail!("Relay closed the connection");
        };
        if envelope.kind() == Some("ping") {
            debug!("answering relay ping");
            client.pong().await.context("Failed to answer ping")?;
            continue;
        }
        return Ok(Some(envelope));
    }
}

fn parse_command(action: &str, params: Option<&str>) -> Result<ControlCommand> {
    let mut fields = match params {
        Some(raw) => serde_json::from_str::<Value>(raw).context("Parameters are not valid JSON")?,
        None => Value::Object(serde_json::Map::new()),
    };
    let Some(object) = fields.as_object_mut() else {
        bail!("Parameters must be a JSON object");
    };
    object.insert("action".to_string(), Value::String(action.to_string()));

    let envelope = Envelope::from_value(fields)
        .map_err(|_| anyhow::anyhow!("Parameters must be a JSON object"))?;
    envelope
        .parse::<ControlCommand>()
        .with_context(|| format!("Invalid '{action}' command"))
}

fn offline_target(message: &str) -> Option<&str> {
    message
        .strip_prefix("target ")
        .and_then(|rest| rest.strip_suffix(" is not online"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_command_with_params() {
        let command = parse_command("list_files", Some(r#"{"path":"C:\\"}"#)).unwrap();
        assert_eq!(
            command,
            ControlCommand::ListFiles {
                path: "C:\\".to_string()
            }
        );
    }

    #[test]
    fn test_parse_command_without_params() {
        assert_eq!(
            parse_command("screenshot", None).unwrap(),
            ControlCommand::Screenshot
        );
    }

    #[test]
    fn test_parse_command_rejects_missing_fields() {
        assert!(parse_command("start_video", None).is_err());
        assert!(parse_command("mouse_move", Some(r#"{"x":1}"#)).is_err());
    }

    #[test]
    fn test_parse_command_rejects_non_object() {
        assert!(parse_command("screenshot", Some("[1,2]")).is_err());
        assert!(parse_command("screenshot", Some("not json")).is_err());
    }

    #[test]
    fn test_offline_target() {
        assert_eq!(offline_target("target C is not online"), Some("C"));
        assert_eq!(offline_target("invalid command: x"), None);
    }

    #[test]
    fn test_cli_parses_exec() {
        let cli = Cli::try_parse_from([
            "relay", "exec", "-t", "a", "--target", "b", "--admin", "--", "dir", "/s",
        ])
        .unwrap();
        assert_eq!(cli.server, "127.0.0.1:5000");
        match cli.command {
            Commands::Exec {
                targets,
                admin,
                command,
                ..
            } => {
                assert_eq!(targets, vec!["a", "b"]);
                assert!(admin);
                assert_eq!(command.join(" "), "dir /s");
            }
            _ => panic!("expected exec"),
        }
    }

    #[test]
    fn test_cli_requires_targets() {
        assert!(Cli::try_parse_from(["relay", "exec", "--", "whoami"]).is_err());
    }
}

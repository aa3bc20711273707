use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use room_sync::{
    share_link, RemoteStore, RoomId, RoomSession, Route, SessionConfig, SessionEvent,
};
use sandbox::{ChannelContext, NodeContext, OutputChange, SandboxError, SandboxedExecutor};
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};
use url::Url;

#[derive(Parser)]
#[command(name = "coderoom")]
#[command(about = "Collaborative code rooms with sandboxed execution")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a new room and print its share link
    New {
        /// Origin the link points at
        #[arg(long)]
        origin: Option<String>,
    },

    /// Print the share link for a room
    Share {
        /// Room id
        room: String,

        /// Origin the link points at
        #[arg(long)]
        origin: Option<String>,

        /// Also copy the link to the clipboard
        #[arg(long)]
        copy: bool,
    },

    /// Execute a file in the sandbox and print its output
    Run {
        /// Source file
        file: PathBuf,
    },

    /// Join a room (a fresh one when omitted)
    Join {
        /// Room id or share link
        room: Option<String>,

        /// Room server WebSocket endpoint
        #[arg(short, long)]
        server: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    let config = SessionConfig::load()?;

    match cli.command {
        Commands::New { origin } => new_command(&config, origin),
        Commands::Share { room, origin, copy } => share_command(&config, &room, origin, copy),
        Commands::Run { file } => run_command(&config, file).await,
        Commands::Join { room, server } => join_command(config, room, server).await,
    }
}

fn new_command(config: &SessionConfig, origin: Option<String>) -> Result<()> {
    let room_id = RoomId::generate();
    let origin = origin.unwrap_or_else(|| config.origin.clone());
    println!("{}", share_link(&origin, &room_id));
    Ok(())
}

fn share_command(
    config: &SessionConfig,
    room: &str,
    origin: Option<String>,
    copy: bool,
) -> Result<()> {
    let room_id = parse_room(room)?;
    let origin = origin.unwrap_or_else(|| config.origin.clone());
    let link = share_link(&origin, &room_id);
    println!("{}", link);

    if copy {
        copy_to_clipboard(&link)?;
        eprintln!("Link copied to clipboard");
    }
    Ok(())
}

async fn run_command(config: &SessionConfig, file: PathBuf) -> Result<()> {
    let source = std::fs::read_to_string(&file)
        .with_context(|| format!("Failed to read {}", file.display()))?;

    info!("Running {:?}", file);
    let context = NodeContext::spawn(&config.sandbox)?;
    let mut executor = SandboxedExecutor::new(context);
    executor.run(&source).await?;

    let output = executor.finish().await?;
    println!("{}", output.render());
    Ok(())
}

async fn join_command(
    config: SessionConfig,
    room: Option<String>,
    server: Option<String>,
) -> Result<()> {
    let room_id = room.as_deref().map(parse_room).transpose()?;
    let server = server.unwrap_or_else(|| config.server_url.clone());

    let (remote, room_id) =
        RemoteStore::connect(&server, room_id.as_ref(), config.request_timeout()).await?;

    let executor = session_executor(NodeContext::spawn(&config.sandbox))?;
    let mut session = RoomSession::new(
        Arc::new(remote.clone()),
        Arc::new(remote.clone()),
        executor,
        config,
    );
    session.open(room_id).await?;

    if let Some(link) = session.share_link() {
        println!("Joined {}", link);
    }
    println!("Commands: :run, :load <path>, :show, :who, :quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            event = session.next_event() => match event {
                Some(event) => print_event(&session, &remote, &event),
                None => {
                    warn!("Session ended");
                    break;
                }
            },
            line = lines.next_line() => match line? {
                Some(line) => match handle_input(&mut session, &line).await {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => eprintln!("{:#}", e),
                },
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                debug!("Interrupted");
                break;
            }
        }
    }

    session.close().await;
    println!("Left the room");
    Ok(())
}

/// Apply one line of terminal input; `false` ends the session
async fn handle_input(session: &mut RoomSession, line: &str) -> Result<bool> {
    match line.trim_end() {
        ":quit" => return Ok(false),
        ":run" => session.run().await?,
        ":show" => println!("{}", session.content()),
        ":who" => {
            for entry in session.online() {
                let marker = if entry.session_id == session.session_id() {
                    " (you)"
                } else {
                    ""
                };
                println!("{}{}", entry.session_id, marker);
            }
        }
        cmd if cmd.starts_with(":load ") => {
            let path = cmd.trim_start_matches(":load ").trim();
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path))?;
            session.on_local_edit(content);
        }
        _ => {
            let mut content = session.content().to_string();
            if !content.is_empty() && !content.ends_with('\n') {
                content.push('\n');
            }
            content.push_str(line);
            content.push('\n');
            session.on_local_edit(content);
        }
    }
    Ok(true)
}

/// Editing and sync work without a runtime; only `:run` is lost
fn session_executor(spawned: sandbox::Result<NodeContext>) -> Result<SandboxedExecutor> {
    match spawned {
        Ok(context) => Ok(SandboxedExecutor::new(context)),
        Err(SandboxError::RuntimeMissing) => {
            warn!("{}; joining without code execution", SandboxError::RuntimeMissing);
            let (context, _peer) = ChannelContext::pair();
            Ok(SandboxedExecutor::new(context))
        }
        Err(e) => Err(e.into()),
    }
}

fn print_event(session: &RoomSession, remote: &RemoteStore, event: &SessionEvent) {
    match event {
        SessionEvent::ContentReplaced { content } => {
            println!("--- room content ---\n{}", content);
        }
        SessionEvent::PresenceChanged { online } => println!("{} online", online),
        SessionEvent::Output(OutputChange::Cleared) => println!("--- output ---"),
        SessionEvent::Output(OutputChange::Appended(line)) => println!("{}", line.render()),
        SessionEvent::WriteFailed { room_id, message } => {
            eprintln!("Failed to save room {}: {}", room_id, message);
        }
        SessionEvent::SubscriptionClosed => {
            if remote.is_connected() {
                eprintln!("Room subscription closed");
            } else {
                eprintln!("Lost connection to the room server");
            }
        }
        SessionEvent::SandboxExited => eprintln!("Sandbox exited; :run is unavailable"),
        SessionEvent::Persisted { .. } | SessionEvent::EchoSuppressed => {
            debug!("{:?} ({} chars)", event, session.content().len());
        }
    }
}

/// A bare room id, or a share link pointing at one
fn parse_room(input: &str) -> Result<RoomId> {
    if input.contains("://") {
        let url = Url::parse(input).with_context(|| format!("Invalid link: {}", input))?;
        return match Route::parse(url.path())? {
            Route::Room(room_id) => Ok(room_id),
            Route::Landing => bail!("Link does not name a room: {}", input),
        };
    }

    RoomId::from_user_input(input).with_context(|| format!("Invalid room id: {:?}", input))
}

fn copy_to_clipboard(text: &str) -> Result<()> {
    const TOOLS: &[(&str, &[&str])] = &[
        ("pbcopy", &[]),
        ("wl-copy", &[]),
        ("xclip", &["-selection", "clipboard"]),
        ("clip", &[]),
    ];

    let (path, args) = TOOLS
        .iter()
        .find_map(|(tool, args)| which::which(tool).ok().map(|path| (path, *args)))
        .context("No clipboard tool found (pbcopy, wl-copy, xclip or clip)")?;

    debug!("Copying with {:?}", path);
    let mut child = Command::new(&path)
        .args(args)
        .stdin(Stdio::piped())
        .spawn()
        .with_context(|| format!("Failed to start {}", path.display()))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(text.as_bytes())?;
    }

    let status = child.wait()?;
    if !status.success() {
        bail!("{} exited with {}", path.display(), status);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_room_accepts_ids_and_links() {
        assert_eq!(parse_room(" abc ").unwrap().as_str(), "abc");
        assert_eq!(
            parse_room("http://127.0.0.1:8080/room/abc").unwrap().as_str(),
            "abc"
        );
        assert_eq!(
            parse_room("http://host/room/%C3%A9quipe").unwrap().as_str(),
            "équipe"
        );
    }

    #[test]
    fn test_parse_room_rejects_bad_input() {
        assert!(parse_room("").is_err());
        assert!(parse_room("a/b").is_err());
        assert!(parse_room("http://host/").is_err());
        assert!(parse_room("http://host/settings").is_err());
    }

    #[tokio::test]
    async fn test_missing_runtime_still_yields_executor() {
        let mut executor = session_executor(Err(SandboxError::RuntimeMissing)).unwrap();

        assert!(executor.run("return 1").await.is_err());
        assert!(executor.next_message().await.is_none());
    }

    #[test]
    fn test_other_sandbox_failures_abort_join() {
        let spawned = Err(SandboxError::SpawnFailed("node: permission denied".to_string()));
        assert!(session_executor(spawned).is_err());
    }

    #[test]
    fn test_cli_parses_join() {
        let cli = Cli::try_parse_from(["coderoom", "join", "abc", "--server", "ws://x"]).unwrap();
        match cli.command {
            Commands::Join { room, server } => {
                assert_eq!(room.as_deref(), Some("abc"));
                assert_eq!(server.as_deref(), Some("ws://x"));
            }
            _ => panic!("expected join"),
        }
    }
}

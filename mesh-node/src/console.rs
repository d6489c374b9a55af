//! Terminal front end: stdin commands in, chat lines and finished downloads out.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use mesh_core::{AppEvent, Body, ContentMeta, Envelope, PeerId, Target};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::host::{now_ms, Host};

const HELP: &str = "commands: <text> | /dm <peer> <text> | /share <path> [mime] | /get <content-id> | /peers | /status | /history | /help";
const HISTORY_LEN: usize = 20;

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Say(String),
    Direct(PeerId, String),
    Share { path: PathBuf, mime: Option<String> },
    Get(String),
    Peers,
    Status,
    History,
    Help,
}

fn parse_command(line: &str) -> Result<Option<Command>, &'static str> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Some(Command::Say(line.to_string())));
    };
    let (cmd, args) = rest.split_once(' ').unwrap_or((rest, ""));
    let args = args.trim();
    let command = match cmd {
        "dm" => {
            let (peer, text) = args.split_once(' ').ok_or("usage: /dm <peer> <text>")?;
            Command::Direct(PeerId::from(peer), text.trim().to_string())
        }
        "share" => {
            let mut parts = args.split_whitespace();
            let path = parts.next().ok_or("usage: /share <path> [mime]")?;
            Command::Share {
                path: PathBuf::from(path),
                mime: parts.next().map(str::to_string),
            }
        }
        "get" if !args.is_empty() => Command::Get(args.to_string()),
        "get" => return Err("usage: /get <content-id>"),
        "peers" => Command::Peers,
        "status" => Command::Status,
        "history" => Command::History,
        "help" => Command::Help,
        _ => return Err("unknown command, try /help"),
    };
    Ok(Some(command))
}

fn guess_mime(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("txt") | Some("md") => "text/plain",
        Some("html") => "text/html",
        Some("json") => "application/json",
        Some("pdf") => "application/pdf",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("mp3") => "audio/mpeg",
        Some("ogg") => "audio/ogg",
        Some("mp4") => "video/mp4",
        Some("webm") => "video/webm",
        _ => "application/octet-stream",
    }
}

/// Read commands from stdin until it closes.
pub async fn run_console(host: Arc<Host>) -> io::Result<()> {
    println!("{}", HELP);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match parse_command(&line) {
            Ok(Some(cmd)) => run_command(&host, cmd).await,
            Ok(None) => {}
            Err(usage) => println!("{}", usage),
        }
    }
    debug!("stdin closed");
    Ok(())
}

async fn run_command(host: &Arc<Host>, cmd: Command) {
    match cmd {
        Command::Say(text) => send(host, Target::Public, &text).await,
        Command::Direct(peer, text) => send(host, Target::Peer(peer), &text).await,
        Command::Share { path, mime } => {
            let bytes = match tokio::fs::read(&path).await {
                Ok(b) => b,
                Err(e) => {
                    println!("cannot read {}: {}", path.display(), e);
                    return;
                }
            };
            let mime = mime.unwrap_or_else(|| guess_mime(&path).to_string());
            let name = path.file_name().map(|n| n.to_string_lossy().into_owned());
            let shared = host
                .node
                .lock()
                .await
                .share_content(bytes, &mime, name, Target::Public, now_ms());
            match shared {
                Ok((meta, actions)) => {
                    host.execute(actions);
                    println!(
                        "shared {} as {} (http://127.0.0.1:{}/content/{})",
                        path.display(),
                        meta.content_id,
                        host.cfg.http_port,
                        meta.content_id
                    );
                }
                Err(e) => println!("share failed: {}", e),
            }
        }
        Command::Get(id) => {
            let started = host.node.lock().await.download(&id, now_ms());
            match started {
                Ok(actions) => host.execute(actions),
                Err(e) => println!("{}", e),
            }
        }
        Command::Peers => {
            let peers = host.node.lock().await.overlay().open_peers();
            if peers.is_empty() {
                println!("no peers connected");
            }
            for p in peers {
                println!("  {}", p);
            }
        }
        Command::Status => {
            let s = host.node.lock().await.status();
            println!(
                "{}: hub {:?}, {} open, {} connecting, {} transfers, presence {}",
                s.peer_id,
                s.hub_state,
                s.open_peers,
                s.connecting_peers,
                s.active_tasks,
                if s.presence_online { "up" } else { "down" }
            );
        }
        Command::History => {
            let recent = host.node.lock().await.recent(HISTORY_LEN, &Target::Public, None);
            for env in &recent {
                println!("{}", render_envelope(env));
            }
        }
        Command::Help => println!("{}", HELP),
    }
}

async fn send(host: &Arc<Host>, target: Target, text: &str) {
    let sent = host.node.lock().await.send_text(target, text, now_ms());
    match sent {
        Ok(actions) => host.execute(actions),
        Err(e) => println!("not sent: {}", e),
    }
}

fn render_envelope(env: &Envelope) -> String {
    let scope = match &env.target {
        Target::Public => String::new(),
        Target::Peer(p) => format!(" -> {}", p),
    };
    match &env.body {
        Body::Text(t) => format!("<{}{}> {}", env.sender, scope, t),
        Body::ContentRef(meta) => format!("<{}{}> shared {}", env.sender, scope, describe(meta)),
    }
}

fn describe(meta: &ContentMeta) -> String {
    format!(
        "{} ({} bytes, {}) /get {}",
        meta.name.as_deref().unwrap_or("content"),
        meta.size,
        meta.mime_type,
        meta.content_id
    )
}

/// Where a finished download lands: the announced file name without any directories, else the id.
fn download_path(dir: &Path, meta: &ContentMeta) -> PathBuf {
    let name = meta
        .name
        .as_deref()
        .and_then(|n| Path::new(n).file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| meta.content_id.clone());
    dir.join(name)
}

/// Print chat traffic and write completed downloads under `<data_dir>/downloads`.
pub async fn run_events(cfg: Config, mut events: mpsc::UnboundedReceiver<AppEvent>) {
    let downloads = cfg.data_dir.join("downloads");
    while let Some(event) = events.recv().await {
        match event {
            AppEvent::Envelope(env) => println!("{}", render_envelope(&env)),
            AppEvent::ContentMeta(meta) => println!("* {} offers {}", meta.owner, describe(&meta)),
            AppEvent::ContentReady { meta, bytes } => {
                let path = download_path(&downloads, &meta);
                let written = match tokio::fs::create_dir_all(&downloads).await {
                    Ok(()) => tokio::fs::write(&path, bytes.as_slice()).await,
                    Err(e) => Err(e),
                };
                match written {
                    Ok(()) => println!("* saved {} to {}", meta.content_id, path.display()),
                    Err(e) => warn!(path = %path.display(), error = %e, "cannot save download"),
                }
            }
            AppEvent::PeerListChanged(peers) => info!(peers = peers.len(), "peer list changed"),
            AppEvent::SelfStatusChanged(status) => debug!(hub = ?status.hub_state, open = status.open_peers, "status"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_parse() {
        assert_eq!(parse_command("  "), Ok(None));
        assert_eq!(parse_command("hi all"), Ok(Some(Command::Say("hi all".into()))));
        assert_eq!(
            parse_command("/dm p-b see you  "),
            Ok(Some(Command::Direct(PeerId::from("p-b"), "see you".into())))
        );
        assert_eq!(
            parse_command("/share clip.mp4"),
            Ok(Some(Command::Share {
                path: PathBuf::from("clip.mp4"),
                mime: None
            }))
        );
        assert_eq!(parse_command("/get abc"), Ok(Some(Command::Get("abc".into()))));
        assert!(parse_command("/get").is_err());
        assert!(parse_command("/dm p-b").is_err());
        assert!(parse_command("/nope").is_err());
    }

    #[test]
    fn mime_from_extension() {
        assert_eq!(guess_mime(Path::new("a/B.MP4")), "video/mp4");
        assert_eq!(guess_mime(Path::new("notes")), "application/octet-stream");
    }

    #[test]
    fn download_name_cannot_escape_dir() {
        let meta = ContentMeta {
            content_id: "abc".into(),
            size: 1,
            mime_type: "text/plain".into(),
            owner: PeerId::from("p-a"),
            name: Some("../../etc/passwd".into()),
        };
        assert_eq!(download_path(Path::new("/d"), &meta), PathBuf::from("/d/passwd"));
        let unnamed = ContentMeta { name: None, ..meta };
        assert_eq!(download_path(Path::new("/d"), &unnamed), PathBuf::from("/d/abc"));
    }

    #[test]
    fn envelopes_render() {
        let env = Envelope {
            id: "1".into(),
            sender: PeerId::from("p-a"),
            target: Target::Peer(PeerId::from("p-b")),
            body: Body::Text("hey".into()),
            ts: 1,
            ttl: 3,
        };
        assert_eq!(render_envelope(&env), "<p-a -> p-b> hey");
    }
}

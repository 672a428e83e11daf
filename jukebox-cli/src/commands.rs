//! Subcommand runners and the interactive line commands

use std::error::Error;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use jukebox_core::{
    HostSession, JukeboxConfig, MediaEngine, PeerSession, StreamResolver, TrackEntry, YtDlpResolver,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::display;

type CmdResult = Result<(), Box<dyn Error>>;

/// Seek step for `+` / `-`
const SEEK_STEP: f64 = 10.0;

const HELP: &str = "commands: p pause | n next | + / - seek | v <0-150> volume | a <query> add | q quit";

/// A line typed on stdin
#[derive(Debug, Clone, PartialEq)]
enum LineCommand {
    Pause,
    Next,
    Seek(f64),
    Volume(f64),
    Add(String),
    Quit,
}

fn parse_command(line: &str) -> Option<LineCommand> {
    let line = line.trim();
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    };

    match word {
        "p" => Some(LineCommand::Pause),
        "n" => Some(LineCommand::Next),
        "+" => Some(LineCommand::Seek(SEEK_STEP)),
        "-" => Some(LineCommand::Seek(-SEEK_STEP)),
        "v" => rest.parse().ok().map(LineCommand::Volume),
        "a" if !rest.is_empty() => Some(LineCommand::Add(rest.to_string())),
        "q" => Some(LineCommand::Quit),
        _ => None,
    }
}

/// Resolve `program` the way the shell would
fn find_program(program: &Path) -> bool {
    if program.components().count() > 1 {
        return program.is_file();
    }
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(program).is_file()))
        .unwrap_or(false)
}

/// Report external tools we are going to need but can't find
fn check_tools(config: &JukeboxConfig, needs_engine: bool) {
    let mut tools = vec![config.resolver.as_path()];
    if needs_engine {
        tools.push(config.engine.program.as_path());
    }

    let missing: Vec<String> = tools
        .into_iter()
        .filter(|tool| !find_program(tool))
        .map(|tool| tool.display().to_string())
        .collect();
    if !missing.is_empty() {
        warn!("Missing: {}", missing.join(", "));
    }
}

fn resolver_for(config: &JukeboxConfig) -> Arc<dyn StreamResolver> {
    Arc::new(YtDlpResolver::new(config.resolver.clone()))
}

fn print_status(line: &str) {
    let mut stdout = std::io::stdout();
    let _ = write!(stdout, "\r\x1b[2K{}", line);
    let _ = stdout.flush();
}

/// Run a search in the background and hand its first hit to `found`
fn spawn_add(resolver: &Arc<dyn StreamResolver>, query: String, found: mpsc::UnboundedSender<TrackEntry>) {
    let resolver = Arc::clone(resolver);
    tokio::spawn(async move {
        match resolver.search(&query, 1).await.into_iter().next() {
            Some(entry) => {
                let _ = found.send(entry);
            }
            None => warn!("Nothing found for {:?}", query),
        }
    });
}

pub async fn play(config: JukeboxConfig, url: String) -> CmdResult {
    check_tools(&config, true);

    let mut session = HostSession::new(MediaEngine::new(config.engine.clone()), resolver_for(&config));
    let entry = session.resolver().lookup(&url).await;
    session.play_entry(entry);

    run_host(&session, config.tick_interval).await;
    session.shutdown().await;
    Ok(())
}

pub async fn host(config: JukeboxConfig, urls: Vec<String>) -> CmdResult {
    check_tools(&config, true);

    let mut session = HostSession::new(MediaEngine::new(config.engine.clone()), resolver_for(&config));
    let addr = session.serve(config.port, config.network.clone()).await?;
    println!("Hosting on port {}", addr.port());

    for url in urls {
        let entry = session.resolver().lookup(&url).await;
        session.enqueue(entry);
    }
    session.next();

    run_host(&session, config.tick_interval).await;
    session.shutdown().await;
    Ok(())
}

async fn run_host(session: &HostSession, tick_interval: Duration) {
    println!("{}", HELP);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut ticker = tokio::time::interval(tick_interval);
    let (found_tx, mut found_rx) = mpsc::unbounded_channel();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let report = session.tick().await;
                let clients = session.is_serving().then_some(report.clients);
                print_status(&display::host_status(&report.snapshot, session.is_loading(), clients));
            }
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => match parse_command(&line) {
                    Some(LineCommand::Pause) => session.toggle_pause().await,
                    Some(LineCommand::Next) => {
                        if !session.next() {
                            println!("Queue is empty");
                        }
                    }
                    Some(LineCommand::Seek(delta)) => session.seek(delta).await,
                    Some(LineCommand::Volume(volume)) => session.set_volume(volume).await,
                    Some(LineCommand::Add(query)) => spawn_add(session.resolver(), query, found_tx.clone()),
                    Some(LineCommand::Quit) => break,
                    None if line.trim().is_empty() => {}
                    None => println!("{}", HELP),
                },
                Ok(None) => {
                    debug!("stdin closed, controls disabled");
                    stdin_open = false;
                }
                Err(e) => {
                    warn!("Failed to read stdin: {}", e);
                    stdin_open = false;
                }
            },
            Some(entry) = found_rx.recv() => session.enqueue(entry),
            _ = &mut ctrl_c => break,
        }
    }
    println!();
}

pub async fn join(config: JukeboxConfig, address: String) -> CmdResult {
    check_tools(&config, false);

    let session = PeerSession::new(address.clone(), config.port, config.network.clone());
    if !session.join().await {
        return Err(format!("could not connect to {}:{}", address, config.port).into());
    }
    info!("Joined {}:{}", address, config.port);
    println!("Joined {}:{}. a <query> adds to the shared queue, q quits", address, config.port);

    let resolver = resolver_for(&config);
    let mut updates = session.subscribe();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let (found_tx, mut found_rx) = mpsc::unbounded_channel();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() || !session.connected() {
                    println!("\nHost went away");
                    break;
                }
                let line = display::peer_status(&updates.borrow_and_update());
                print_status(&line);
            }
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => match parse_command(&line) {
                    Some(LineCommand::Add(query)) => spawn_add(&resolver, query, found_tx.clone()),
                    Some(LineCommand::Quit) => break,
                    Some(_) => println!("Only the host controls playback"),
                    None if line.trim().is_empty() => {}
                    None => println!("{}", HELP),
                },
                Ok(None) | Err(_) => stdin_open = false,
            },
            Some(entry) = found_rx.recv() => {
                println!("\nRequested: {}", entry.title);
                session.add(entry).await;
            }
            _ = &mut ctrl_c => break,
        }
    }

    session.leave().await;
    Ok(())
}

pub async fn search(config: JukeboxConfig, query: String, count: usize) -> CmdResult {
    check_tools(&config, false);

    let results = resolver_for(&config).search(&query, count).await;
    if results.is_empty() {
        println!("No results for {:?}", query);
        return Ok(());
    }
    for (index, entry) in results.iter().enumerate() {
        println!("{}", display::entry_row(index, entry));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_command() {
        assert_eq!(parse_command("p"), Some(LineCommand::Pause));
        assert_eq!(parse_command(" n "), Some(LineCommand::Next));
        assert_eq!(parse_command("+"), Some(LineCommand::Seek(10.0)));
        assert_eq!(parse_command("-"), Some(LineCommand::Seek(-10.0)));
        assert_eq!(parse_command("v 80"), Some(LineCommand::Volume(80.0)));
        assert_eq!(parse_command("v loud"), None);
        assert_eq!(
            parse_command("a  never gonna give"),
            Some(LineCommand::Add("never gonna give".to_string()))
        );
        assert_eq!(parse_command("a"), None);
        assert_eq!(parse_command("q"), Some(LineCommand::Quit));
        assert_eq!(parse_command("dance"), None);
    }

    #[test]
    fn test_find_program() {
        assert!(find_program(Path::new("sh")));
        assert!(find_program(Path::new("/bin/sh")));
        assert!(!find_program(Path::new("definitely-not-a-real-tool-xyz")));
        assert!(!find_program(Path::new("/nonexistent/mpv")));
    }
}

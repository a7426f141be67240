use std::{path::PathBuf, time::Duration};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use futures::{stream::BoxStream, StreamExt};
use shared::domain::{
    ConnectionEpoch, DialogRequest, Program, ServerStatus, SidebarInfo, StatusSnapshot,
};
use sync_core::{
    load_settings, load_settings_from, DialogNotice, StatusNotice, SyncFacade, SyncSettings,
    TerminalItem,
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::mpsc,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use url::Url;

/// Time given to the websocket writer to drain queued commands before exit.
const FLUSH_GRACE: Duration = Duration::from_millis(150);

#[derive(Parser, Debug)]
#[command(name = "station-console", about = "Operator console for a test station")]
struct Cli {
    /// Settings file; defaults to ./station.toml when present.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Overrides the hub endpoint, e.g. ws://127.0.0.1:7341/ws.
    #[arg(long)]
    endpoint: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Mirrors the station live and answers dialogs from stdin.
    Watch,
    /// Prints the current status and sidebar over HTTP.
    Snapshot,
    /// Sends one key to the orchestrator's terminal.
    Key { key: String },
    /// Asks the orchestrator to store a new machine code.
    MachineCode { code: String },
    /// Reports the upload server as online or offline.
    ServerStatus { status: ServerStatus },
    /// Selects the test program to run.
    Program { program: Program },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();

    let cli = Cli::parse();
    let mut settings = match &cli.config {
        Some(path) => load_settings_from(path),
        None => load_settings(),
    };
    if let Some(endpoint) = cli.endpoint {
        settings.endpoint_url = endpoint;
    }

    match cli.command {
        Command::Watch => watch(settings).await,
        Command::Snapshot => snapshot(&settings).await,
        Command::Key { key } => send_once(settings, |console| console.send_key(&key)).await,
        Command::MachineCode { code } => {
            send_once(settings, |console| console.request_machine_code_set(&code)).await
        }
        Command::ServerStatus { status } => {
            send_once(settings, |console| console.set_server_status(status)).await
        }
        Command::Program { program } => {
            send_once(settings, |console| console.select_program(program)).await
        }
    }
}

async fn send_once(
    settings: SyncSettings,
    send: impl FnOnce(&SyncFacade) -> Result<(), shared::error::SyncError>,
) -> Result<()> {
    let console = SyncFacade::websocket(settings)?;
    let handle = console.connect().await.context("hub unreachable")?;
    info!(epoch = %handle.epoch, "connected");
    let sent = send(&console);
    tokio::time::sleep(FLUSH_GRACE).await;
    console.dispose().await;
    sent.context("command was not sent")?;
    println!("sent");
    Ok(())
}

async fn snapshot(settings: &SyncSettings) -> Result<()> {
    let base = http_base(&settings.endpoint_url)?;
    let http = reqwest::Client::new();

    let statuses: StatusSnapshot = http
        .get(base.join("status")?)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    let sidebar: SidebarInfo = http
        .get(base.join("sidebar")?)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    print_sidebar(&sidebar);
    for (key, status) in &statuses {
        println!("{key:<24} {status}");
    }
    Ok(())
}

async fn watch(settings: SyncSettings) -> Result<()> {
    let console = SyncFacade::websocket(settings)?;

    let _statuses = console.on_status_change(|notice| match notice {
        StatusNotice::Replay(snapshot) => {
            for (key, status) in snapshot {
                println!("[status] {key} = {status}");
            }
        }
        StatusNotice::Changed(change) => {
            println!("[status] {} {} -> {}", change.key, change.previous, change.current)
        }
    });
    let (dialog_tx, mut dialogs) = mpsc::unbounded_channel();
    let _dialogs = console.on_dialog_request(move |notice| {
        let _ = dialog_tx.send(notice.clone());
    });
    let mut connection = console.watch_connection();
    let mut sidebar = console.watch_sidebar();

    console.connect().await.context("hub unreachable")?;

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut terminal: Option<BoxStream<'static, TerminalItem>> = None;
    let mut following: Option<ConnectionEpoch> = None;
    let mut resubscribe = tokio::time::interval(Duration::from_millis(250));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = resubscribe.tick() => {
                let epoch = console.terminal_epoch();
                if terminal.is_none() && epoch.0 > 0 && following != Some(epoch) {
                    following = Some(epoch);
                    terminal = Some(console.terminal_stream(None));
                }
            }
            item = next_item(&mut terminal) => match item {
                Some(TerminalItem::Chunk(chunk)) => print!("{}", chunk.text),
                Some(gap @ TerminalItem::Gap { .. }) => {
                    if let Some(error) = gap.gap_error() {
                        println!("[terminal] {error}");
                    }
                }
                None => terminal = None,
            },
            Some(notice) = dialogs.recv() => match notice {
                DialogNotice::Raised(pending) => print_dialog(&pending.request),
                DialogNotice::Resolved(response) => {
                    println!("[dialog] answered: {}", response.button_label)
                }
                DialogNotice::Dismissed(_) => println!("[dialog] closed"),
            },
            changed = connection.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = connection.borrow_and_update().clone();
                println!("[link] {state}");
            }
            changed = sidebar.changed() => {
                if changed.is_err() {
                    break;
                }
                let info = sidebar.borrow_and_update().clone();
                print_sidebar(&info);
            }
            line = stdin.next_line() => match line? {
                Some(line) => handle_input(&console, line.trim()),
                None => break,
            },
        }
    }

    console.dispose().await;
    Ok(())
}

async fn next_item(terminal: &mut Option<BoxStream<'static, TerminalItem>>) -> Option<TerminalItem> {
    match terminal {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

/// While a dialog is open, input answers it; otherwise it goes to the
/// orchestrator's terminal as keystrokes.
fn handle_input(console: &SyncFacade, line: &str) {
    let outcome = match console.pending_dialog() {
        Some(pending) => match parse_answer(&pending.request, line) {
            Some(Answer::Button(label)) => console
                .respond_to_dialog(pending.request_id, &label)
                .map(|_| ()),
            Some(Answer::Cancel) => console.cancel_dialog().map(|_| ()),
            None => {
                println!("[dialog] pick 1-{} or c to cancel", pending.request.buttons.len());
                Ok(())
            }
        },
        None if line.is_empty() => Ok(()),
        None => console.send_key(line),
    };
    if let Err(error) = outcome {
        warn!(%error, "input not delivered");
        println!("[error] {error}");
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Answer {
    Button(String),
    Cancel,
}

/// Reads an operator answer: a 1-based button number, a button label
/// (case-insensitive) or `c` to cancel.
fn parse_answer(request: &DialogRequest, input: &str) -> Option<Answer> {
    let input = input.trim();
    if input.eq_ignore_ascii_case("c") {
        return Some(Answer::Cancel);
    }
    if let Ok(index) = input.parse::<usize>() {
        return index
            .checked_sub(1)
            .and_then(|index| request.buttons.get(index))
            .map(|button| Answer::Button(button.label.clone()));
    }
    request
        .buttons
        .iter()
        .find(|button| button.label.eq_ignore_ascii_case(input))
        .map(|button| Answer::Button(button.label.clone()))
}

fn print_dialog(request: &DialogRequest) {
    println!("[dialog]");
    for line in &request.message {
        println!("  {line}");
    }
    for (index, button) in request.buttons.iter().enumerate() {
        let marker = if button.is_primary { "*" } else { " " };
        println!(" {marker}{}) {}", index + 1, button.label);
    }
    println!("  c) cancel");
}

fn print_sidebar(info: &SidebarInfo) {
    println!(
        "[station] machine={} server={} uploads={} device={} serial={} ip={}",
        info.machine_code,
        info.server_status.as_str(),
        info.upload_count,
        info.current_device,
        info.serial_number,
        info.target_ip
    );
}

/// HTTP base of the hub serving `endpoint`: same host and port, `ws`
/// mapped to `http` and `wss` to `https`, path reset to `/`.
fn http_base(endpoint: &str) -> Result<Url> {
    let mut url =
        Url::parse(endpoint).with_context(|| format!("invalid endpoint '{endpoint}'"))?;
    let scheme = match url.scheme() {
        "ws" => "http",
        "wss" => "https",
        other => bail!("endpoint scheme must be ws or wss, got '{other}'"),
    };
    url.set_scheme(scheme)
        .map_err(|()| anyhow!("cannot map '{endpoint}' to http"))?;
    url.set_path("/");
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;

use std::io::{self, BufRead};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::{unbounded, Receiver};
use serde_json::json;
use tracing::{debug, info};

use crate::config;
use crate::controller::{Services, SyncController};
use crate::model::{paths, NewPost, ReactionKind, ReactionOp};
use crate::owldb;
use crate::render::{RenderSink, TerminalRenderer};
use crate::store::{DocumentStore, MemoryStore, Session};

const POLL_INTERVAL: Duration = Duration::from_millis(250);
const DEMO_SETTLE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub config_file: Option<PathBuf>,
    pub workspace: String,
    pub channel: String,
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "owlchat=info".into()),
        )
        .with_writer(io::stderr)
        .try_init();
}

/// Signs in, opens one channel and follows it. Lines read from stdin are
/// posted to the channel; `/quit` or end of input stops.
pub fn run(options: RunOptions) -> Result<()> {
    let cfg = config::load(config::LoadOptions {
        config_file: options.config_file.clone(),
        env_prefix: None,
    })
    .context("load config")?;
    anyhow::ensure!(
        !cfg.session.username.is_empty(),
        "config: session.username is required (set it in {} or OWLCHAT_SESSION__USERNAME)",
        friendly_path(config::default_path().as_ref())
    );

    let client = owldb::Client::new(cfg.store.client_config()).context("create owldb client")?;
    info!(host = %cfg.store.host, user = %cfg.session.username, "connecting");

    let renderer = TerminalRenderer::new(io::stdout());
    let mut controller = SyncController::new(Services::shared(Arc::new(client)), renderer)
        .context("create controller")?;

    let channel = paths::channel(&paths::workspace(&options.workspace), &options.channel);
    controller.login(&cfg.session.username);
    controller.settle(cfg.store.timeout);
    anyhow::ensure!(
        controller.username().is_some(),
        "could not sign in as {}",
        cfg.session.username
    );
    controller.open_channel(&channel);

    let input = spawn_stdin_reader();
    loop {
        controller.poll_timeout(POLL_INTERVAL);
        match input.try_recv() {
            Ok(line) if line.trim() == "/quit" => break,
            Ok(line) if line.trim().is_empty() => {}
            Ok(line) => controller.post_message(&channel, line.trim(), None),
            Err(crossbeam_channel::TryRecvError::Empty) => {}
            Err(crossbeam_channel::TryRecvError::Disconnected) => break,
        }
    }

    controller.logout();
    controller.settle(Duration::from_secs(2));
    Ok(())
}

fn spawn_stdin_reader() -> Receiver<String> {
    let (tx, rx) = unbounded();
    thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
        debug!("stdin closed");
    });
    rx
}

/// Plays a short session against an in-memory store and prints every view.
pub fn run_demo() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let (channel, welcome) = seed_demo(&store).context("seed demo store")?;

    let renderer = TerminalRenderer::new(io::stdout());
    let mut controller = SyncController::new(Services::shared(store.clone()), renderer)
        .context("create controller")?;

    controller.login("owl");
    settle(&mut controller)?;
    controller.open_workspace("owlchat");
    settle(&mut controller)?;
    controller.open_channel(&channel);
    settle(&mut controller)?;
    controller.post_message(&channel, "threads render as an indented tree", Some(&welcome));
    settle(&mut controller)?;
    controller.toggle_reaction(ReactionOp::Add, ReactionKind::Celebrate, "owl", &welcome);
    settle(&mut controller)?;
    controller.create_channel("owlchat", "random");
    settle(&mut controller)?;
    controller.logout();
    settle(&mut controller)?;
    Ok(())
}

fn settle<S: RenderSink>(controller: &mut SyncController<S>) -> Result<()> {
    anyhow::ensure!(controller.settle(DEMO_SETTLE), "demo timed out");
    Ok(())
}

/// Returns the demo channel and its first post.
fn seed_demo(store: &MemoryStore) -> Result<(String, String)> {
    let workspace = paths::workspace("owlchat");
    let channel = paths::channel(&workspace, "general");
    store.create_document(&workspace, &json!({}))?;
    store.create_collection(&paths::channels(&workspace))?;
    store.create_document(&channel, &json!({}))?;
    store.create_collection(&paths::posts(&channel))?;

    let posts = paths::posts(&channel);
    store.authenticate("ana")?;
    let welcome = store
        .append_document(&posts, &NewPost::new("welcome to owlchat", None).into_doc())?
        .uri;
    store.authenticate("bo")?;
    let question = store
        .append_document(&posts, &NewPost::new("how do replies work?", None).into_doc())?
        .uri;
    store.authenticate("ana")?;
    store.append_document(
        &posts,
        &NewPost::new("reply to a post and it nests under it", Some(question)).into_doc(),
    )?;
    store.logout()?;
    Ok((channel, welcome))
}

fn friendly_path(path: Option<&PathBuf>) -> String {
    if let Some(path) = path {
        if let Some(home) = dirs::home_dir() {
            if let Ok(stripped) = path.strip_prefix(&home) {
                let mut display = String::from("~");
                if !stripped.as_os_str().is_empty() {
                    display.push_str(&format!("/{}", stripped.display()));
                }
                return display;
            }
        }
        path.display().to_string()
    } else {
        "~/.config/owlchat/config.yaml".to_string()
    }
}

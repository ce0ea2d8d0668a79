//! Quill headless demo.
//!
//! Opens one document in several editors connected through an in-process
//! hub, makes a few edits on a timer and prints what each editor view would
//! render: online flag, remote peer avatars and the document value.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::info;

use quill_collab::{
    CollaborativeEditor, ContentNode, EditorView, HubConfig, MemoryHub, MemoryStore,
    SessionBinder, SessionConfig, UpdateStore,
};

/// Document shown when the home route is opened.
const DEFAULT_DOCUMENT: &str = "testcollab123";

/// Command line arguments.
#[derive(Parser, Debug)]
#[command(name = "quill")]
#[command(about = "Run several collaborative editors on one document, in-process")]
struct Args {
    /// Route to open: `/document/<id>`, or `/` for the default document
    #[arg(value_name = "PATH", default_value = "/", conflicts_with = "new")]
    path: String,

    /// Open a brand new document with a random id
    #[arg(long)]
    new: bool,

    /// Number of editors sharing the document
    #[arg(short, long, default_value_t = 3, value_parser = clap::value_parser!(u8).range(1..))]
    peers: u8,

    /// Number of edit rounds before exiting
    #[arg(short, long, default_value_t = 5)]
    ticks: u32,

    /// Delay between edit rounds
    #[arg(long, value_name = "MS", default_value_t = 250)]
    interval_ms: u64,

    /// Persist each editor's updates under this directory
    #[cfg(feature = "rocksdb")]
    #[arg(long, value_name = "DIR")]
    data_dir: Option<std::path::PathBuf>,
}

/// Routes understood by the demo.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Route {
    Home,
    Document(String),
}

/// Match `path` against `/` and `/document/<id>`. A trailing slash is
/// tolerated; anything else is unknown.
fn parse_route(path: &str) -> Option<Route> {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return Some(Route::Home);
    }
    let id = trimmed.strip_prefix("/document/")?;
    if id.is_empty() || id.contains('/') {
        return None;
    }
    Some(Route::Document(id.to_owned()))
}

fn resolve_document_id(args: &Args) -> Result<String> {
    if args.new {
        return Ok(uuid::Uuid::new_v4().to_string());
    }
    match parse_route(&args.path) {
        Some(Route::Document(id)) => Ok(id),
        Some(Route::Home) => {
            info!("Try /document/{DEFAULT_DOCUMENT}");
            Ok(DEFAULT_DOCUMENT.to_string())
        }
        None => bail!("unknown route {:?}, expected /document/<id>", args.path),
    }
}

#[cfg(feature = "rocksdb")]
fn open_store(args: &Args, index: u8) -> Result<Arc<dyn UpdateStore>> {
    let Some(dir) = &args.data_dir else {
        return Ok(Arc::new(MemoryStore::new()));
    };
    let config = quill_collab::StoreConfig {
        path: dir.join(format!("editor-{index}")),
        ..quill_collab::StoreConfig::default()
    };
    let store = quill_collab::RocksUpdateStore::open(config)
        .with_context(|| format!("opening store for editor {index}"))?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "rocksdb"))]
fn open_store(_args: &Args, _index: u8) -> Result<Arc<dyn UpdateStore>> {
    Ok(Arc::new(MemoryStore::new()))
}

fn print_view(name: &str, view: &EditorView) {
    let status = if view.online { "online" } else { "offline" };
    println!("── {name} [{status}]");
    if view.show_avatars() {
        let avatars: Vec<String> = view
            .avatars()
            .iter()
            .map(|avatar| format!("{} ({})", avatar.name, avatar.border_color))
            .collect();
        println!("   peers: {}", avatars.join(", "));
    }
    for node in &view.value {
        println!("   {}: {}", node.kind, node.text());
    }
}

/// One edit per tick, round-robin over `editors`, then print every view.
/// Stops early on Ctrl-C. Returns the number of ticks run.
async fn run_ticks(
    hub: &MemoryHub,
    editors: &mut [CollaborativeEditor],
    ticks: u32,
    period: Duration,
) -> Result<u32> {
    if editors.is_empty() {
        return Ok(0);
    }
    let mut interval = tokio::time::interval(period);
    for tick in 0..ticks {
        tokio::select! {
            _ = interval.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                return Ok(tick);
            }
        }

        let author = &editors[tick as usize % editors.len()];
        let line = format!("edit {tick} from {}", author.presence().name);
        if let Some(session) = author.session() {
            session.push_content(&[ContentNode::paragraph(line)])?;
        }
        let delivered = hub.pump();
        log::debug!("Tick {tick}: delivered {delivered} message(s)");

        let document_id = editors[0].document_id().unwrap_or_default().to_owned();
        println!("tick {tick} · /document/{document_id}");
        for editor in editors.iter_mut() {
            editor.load_value()?;
            print_view(&editor.presence().name, &editor.view());
        }
    }
    Ok(ticks)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let document_id = resolve_document_id(&args)?;
    info!("Opening {document_id} in {} editor(s)", args.peers);

    let hub = MemoryHub::with_config(HubConfig::default());
    let mut editors = Vec::with_capacity(usize::from(args.peers));
    for index in 0..args.peers {
        let binder = Arc::new(SessionBinder::new(
            Arc::new(hub.factory()),
            open_store(&args, index)?,
            SessionConfig::default(),
        ));
        let mut editor = CollaborativeEditor::new(binder);
        editor
            .open(&document_id)
            .with_context(|| format!("opening {document_id}"))?;
        editors.push(editor);
        hub.pump();
    }

    let interval = Duration::from_millis(args.interval_ms);
    let completed = run_ticks(&hub, &mut editors, args.ticks, interval).await?;
    info!("Ran {completed} of {} tick(s)", args.ticks);

    for editor in &mut editors {
        editor.close();
    }
    hub.pump();
    info!("Closed {document_id}");
    Ok(())
}

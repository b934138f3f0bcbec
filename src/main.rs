use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};

use notemark::config::{self, Config};
use notemark::locate::{
    RenderedNode, SourceEditor, TextSelection, compute_range_for_block, focus_from_rendered_node,
    locate_source_offset,
};
use notemark::resolve::resolve_target;
use notemark::session::RenderSession;
use notemark::text::byte_to_utf16;
use notemark::{Engine, Workspace, app};

#[derive(Parser)]
#[command(name = "notemark", version, about = "Source-synchronized markdown for linked notes")]
struct Cli {
    /// Workspace directory (default: config `workspace`, else the current directory)
    #[arg(short, long, global = true)]
    workspace: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Render a note to HTML
    Render {
        note: String,
        /// Print the block source map as JSON instead of HTML
        #[arg(long)]
        source_map: bool,
        /// Write the output to a file
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Map between rendered text and note source
    Locate {
        note: String,
        /// Source byte offset to find in the rendered view
        #[arg(long, conflicts_with_all = ["block", "text"])]
        offset: Option<usize>,
        /// Rendered block id (`blk-N`) to find in the source
        #[arg(long)]
        block: Option<String>,
        /// Char offset inside the block's plain text
        #[arg(long, requires = "block")]
        plain_offset: Option<usize>,
        /// Rendered text to find in the source
        #[arg(long)]
        text: Option<String>,
    },
    /// Resolve a wikilink target as seen from a note
    Resolve { note: String, target: String },
    /// List hashtags, or the notes carrying one
    Tags { tag: Option<String> },
    /// List block anchors, optionally for one note
    Blocks { note: Option<String> },
    /// Re-render a note whenever the workspace changes
    Watch {
        note: String,
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Open the config file in $EDITOR
    Config,
}

fn init_tracing(config: &Config) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_filter)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    if let Commands::Config = cli.command {
        return config::open_config_in_editor();
    }

    let cfg = config::load_config()?;
    init_tracing(&cfg);
    let root = cli
        .workspace
        .or_else(|| cfg.workspace.clone())
        .map_or_else(std::env::current_dir, Ok)
        .context("Could not determine the workspace directory")?;

    if let Commands::Watch { note, out } = cli.command {
        return app::run_watch(&root, &note, &cfg, out);
    }

    let workspace = Workspace::load_dir(&root, cfg.save_delay())?;
    match cli.command {
        Commands::Render {
            note,
            source_map,
            out,
        } => {
            let id = note_id(&workspace, &note)?;
            let engine = Engine::new(&cfg.engine_options());
            let rendered = engine.render_note(&workspace, &id, &mut RenderSession::new())?;
            let text = if source_map {
                serde_json::to_string_pretty(&rendered.source_map)
                    .context("Failed to serialize source map")?
            } else {
                rendered.html
            };
            match out {
                Some(path) => fs::write(&path, text)
                    .with_context(|| format!("Failed to write {}", path.display()))?,
                None => println!("{text}"),
            }
        }
        Commands::Locate {
            note,
            offset,
            block,
            plain_offset,
            text,
        } => locate(&workspace, &cfg, &note, offset, block, plain_offset, text)?,
        Commands::Resolve { note, target } => {
            let id = note_id(&workspace, &note)?;
            let info = resolve_target(&target, &workspace, &id);
            println!("{}", info.status_message());
            println!(
                "{}",
                serde_json::to_string_pretty(&info).context("Failed to serialize target")?
            );
        }
        Commands::Tags { tag } => {
            let tags = &workspace.indices().tags;
            match tag {
                Some(tag) => {
                    let tag = tag.trim_start_matches('#');
                    let aggregate = tags
                        .tag(tag)
                        .with_context(|| format!("No note carries #{tag}"))?;
                    for id in &aggregate.note_ids {
                        println!("{id}");
                    }
                }
                None => {
                    for aggregate in tags.tags() {
                        println!(
                            "#{}\t{} in {} notes",
                            aggregate.tag,
                            aggregate.occurrences,
                            aggregate.note_ids.len()
                        );
                    }
                }
            }
        }
        Commands::Blocks { note } => {
            let blocks = &workspace.indices().blocks;
            let ids: Vec<String> = match note {
                Some(note) => vec![note_id(&workspace, &note)?],
                None => workspace.notes().map(|n| n.id.clone()).collect(),
            };
            for id in ids {
                for entry in blocks.entries_for(&id) {
                    println!("{}#^{}\t{}", entry.note_id, entry.raw_label, entry.title);
                }
            }
        }
        Commands::Watch { .. } | Commands::Config => {}
    }
    Ok(())
}

/// Accepts a note id, a wikilink-style name or a path to the file.
fn note_id(workspace: &Workspace, name: &str) -> Result<String> {
    if let Some(note) = workspace.find(name) {
        return Ok(note.id.clone());
    }
    let path = Path::new(name);
    if path.is_file() {
        if let Some(id) = workspace.note_id_for_path(path) {
            return Ok(id);
        }
    }
    bail!("No note named {name}. Try `notemark blocks` to list the workspace.")
}

fn locate(
    workspace: &Workspace,
    cfg: &Config,
    note: &str,
    offset: Option<usize>,
    block: Option<String>,
    plain_offset: Option<usize>,
    text: Option<String>,
) -> Result<()> {
    let id = note_id(workspace, note)?;
    let engine = Engine::new(&cfg.engine_options());
    let rendered = engine.render_note(workspace, &id, &mut RenderSession::new())?;
    let map = rendered
        .source_map
        .with_context(|| format!("{id} rendered without a source map"))?;
    let source = workspace
        .note(&id)
        .and_then(|n| n.content.as_deref())
        .unwrap_or_default();

    if let Some(offset) = offset {
        match locate_source_offset(&map, offset) {
            Some(pos) => println!(
                "{} ({}) plain offset {}",
                pos.block_id, pos.kind, pos.plain_offset
            ),
            None => println!("No rendered block at offset {offset}"),
        }
        return Ok(());
    }

    let range = match (&block, plain_offset, &text) {
        (Some(block), Some(plain), None) => {
            let mapped = map
                .block(block)
                .with_context(|| format!("No block {block} in {id}"))?;
            compute_range_for_block(mapped, plain)
        }
        (block, plain, text) => {
            let node = RenderedNode {
                note_id: Some(id.clone()),
                block_id: block.clone(),
                text: text.clone().unwrap_or_default(),
                selection: text.clone().map(|text| TextSelection {
                    text,
                    plain_offset: plain,
                }),
                ..RenderedNode::default()
            };
            let mut editor = SourceEditor::new(source, 40);
            focus_from_rendered_node(&node, &map, &mut editor, &cfg.focus_options())
                .map(|outcome| outcome.range)
        }
    };
    match range {
        Some(range) => println!(
            "{}..{} (utf-16 {}..{}) {:?}",
            range.start,
            range.end,
            byte_to_utf16(source, range.start),
            byte_to_utf16(source, range.end),
            range.slice(source)
        ),
        None => println!("No source range found"),
    }
    Ok(())
}

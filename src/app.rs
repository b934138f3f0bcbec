use anyhow::{Context, Result};
use notify::{EventKind, RecursiveMode, Watcher};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::render::{Engine, Rendered};
use crate::session::RenderSession;
use crate::store::Workspace;

const RELOAD_DELAY: Duration = Duration::from_millis(150);
const TICK: Duration = Duration::from_millis(50);

#[derive(Default)]
struct FsReload {
    pending: bool,
    deadline: Option<Instant>,
    paths: BTreeSet<PathBuf>,
}

pub struct Watch {
    workspace: Workspace,
    engine: Engine,
    session: RenderSession,
    note_id: String,
    reload: FsReload,
    last: Option<Rendered>,
}

impl Watch {
    pub fn new(workspace: Workspace, engine: Engine, note_id: &str) -> Result<Self> {
        let note_id = workspace
            .find(note_id)
            .map(|note| note.id.clone())
            .with_context(|| format!("No note named {note_id} in the workspace"))?;
        Ok(Self {
            workspace,
            engine,
            session: RenderSession::new(),
            note_id,
            reload: FsReload::default(),
            last: None,
        })
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn last(&self) -> Option<&Rendered> {
        self.last.as_ref()
    }

    /// Renders the watched note. On failure the previous render is kept.
    pub fn render(&mut self) -> Result<&Rendered> {
        let rendered = self
            .engine
            .render_note(&self.workspace, &self.note_id, &mut self.session)?;
        Ok(self.last.insert(rendered))
    }

    fn request_reload(&mut self, now: Instant) {
        self.reload.pending = true;
        self.reload.deadline = Some(now + RELOAD_DELAY);
    }

    pub fn on_fs_event(&mut self, event: notify::Event, now: Instant) {
        if matches!(event.kind, EventKind::Access(_)) {
            return;
        }
        self.reload.paths.extend(event.paths);
        self.request_reload(now);
    }

    /// Applies the changes collected since the last reload once the
    /// deadline passes. Returns the fresh render when the note set changed.
    pub fn handle_pending_reload(&mut self, now: Instant) -> Result<Option<&Rendered>> {
        if !self.reload.pending {
            return Ok(None);
        }
        if self.reload.deadline.is_some_and(|deadline| now < deadline) {
            return Ok(None);
        }
        self.reload.pending = false;
        self.reload.deadline = None;

        let mut changed = Vec::new();
        for path in std::mem::take(&mut self.reload.paths) {
            match self.workspace.reload_path(&path, now) {
                Ok(Some(id)) => changed.push(id),
                Ok(None) => {}
                Err(err) => tracing::warn!(path = %path.display(), "{err:#}"),
            }
        }
        if changed.is_empty() {
            return Ok(None);
        }
        tracing::info!(notes = ?changed, "workspace changed");
        if self.workspace.note(&self.note_id).is_none() {
            anyhow::bail!("{} was removed", self.note_id);
        }
        self.render().map(Some)
    }

    pub fn flush_due(&mut self, now: Instant) -> Result<Vec<String>> {
        self.workspace.flush_due(now)
    }
}

pub fn run_watch(root: &Path, note: &str, config: &Config, out: Option<PathBuf>) -> Result<()> {
    let workspace = Workspace::load_dir(root, config.save_delay())?;
    let engine = Engine::new(&config.engine_options());
    let mut watch = Watch::new(workspace, engine, note)?;
    let rendered = watch.render()?;
    emit(rendered, out.as_deref())?;

    let watch_root = watch
        .workspace()
        .root()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| root.to_path_buf());
    let (tx, rx) = mpsc::channel();
    let mut watcher = notify::recommended_watcher(move |res| {
        let _ = tx.send(res);
    })?;
    watcher.watch(&watch_root, RecursiveMode::Recursive)?;
    tracing::info!(root = %watch_root.display(), "watching");

    loop {
        match rx.recv_timeout(TICK) {
            Ok(Ok(event)) => watch.on_fs_event(event, Instant::now()),
            Ok(Err(err)) => tracing::warn!("watch error: {err}"),
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
        while let Ok(msg) = rx.try_recv() {
            if let Ok(event) = msg {
                watch.on_fs_event(event, Instant::now());
            }
        }

        let now = Instant::now();
        match watch.handle_pending_reload(now) {
            Ok(Some(rendered)) => emit(rendered, out.as_deref())?,
            Ok(None) => {}
            Err(err) => eprintln!("Failed to re-render: {err:#}"),
        }
        watch.flush_due(now)?;
    }
    Ok(())
}

fn emit(rendered: &Rendered, out: Option<&Path>) -> Result<()> {
    let blocks = rendered.source_map.as_ref().map_or(0, |m| m.blocks.len());
    match out {
        Some(path) => {
            fs::write(path, &rendered.html)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!(
                "{} generation {} ({:?}, {blocks} blocks) -> {}",
                rendered.note_id,
                rendered.generation,
                rendered.mode,
                path.display()
            );
        }
        None => {
            println!("{}", rendered.html);
        }
    }
    Ok(())
}

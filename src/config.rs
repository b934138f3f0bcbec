use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use crate::highlight::DEFAULT_CODE_THEME;
use crate::locate::{APPROXIMATE_WINDOW, FocusOptions, SHORT_BLOCK_LIMIT, VISIBLE_TEXT_LIMIT};
use crate::render::{EngineOptions, MAX_EMBED_DEPTH};
use crate::store::DEFAULT_SAVE_DEBOUNCE_MS;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub workspace: Option<PathBuf>,
    pub code_theme: String,
    pub max_embed_depth: usize,
    pub approximate_window: usize,
    pub visible_text_limit: usize,
    pub short_block_limit: usize,
    pub save_debounce_ms: u64,
    pub log_filter: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workspace: None,
            code_theme: DEFAULT_CODE_THEME.to_string(),
            max_embed_depth: MAX_EMBED_DEPTH,
            approximate_window: APPROXIMATE_WINDOW,
            visible_text_limit: VISIBLE_TEXT_LIMIT,
            short_block_limit: SHORT_BLOCK_LIMIT,
            save_debounce_ms: DEFAULT_SAVE_DEBOUNCE_MS,
            log_filter: "warn".to_string(),
        }
    }
}

impl Config {
    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            max_embed_depth: self.max_embed_depth,
            code_theme: self.code_theme.clone(),
        }
    }

    pub fn focus_options(&self) -> FocusOptions {
        FocusOptions {
            use_selection: true,
            window: self.approximate_window,
            visible_text_limit: self.visible_text_limit,
            short_block_limit: self.short_block_limit,
        }
    }

    pub fn save_delay(&self) -> Duration {
        Duration::from_millis(self.save_debounce_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
struct PartialConfig {
    workspace: Option<PathBuf>,
    code_theme: Option<String>,
    max_embed_depth: Option<usize>,
    approximate_window: Option<usize>,
    visible_text_limit: Option<usize>,
    short_block_limit: Option<usize>,
    save_debounce_ms: Option<u64>,
    log_filter: Option<String>,
}

fn or_default<T>(value: Option<T>, default: T, changed: &mut bool) -> T {
    match value {
        Some(v) => v,
        None => {
            *changed = true;
            default
        }
    }
}

impl PartialConfig {
    /// Fills missing keys from the defaults. The flag reports whether any key
    /// was missing. `workspace` has no default and never counts.
    fn apply_defaults(self) -> (Config, bool) {
        let defaults = Config::default();
        let mut changed = false;

        let code_theme = or_default(self.code_theme, defaults.code_theme, &mut changed);
        let max_embed_depth =
            or_default(self.max_embed_depth, defaults.max_embed_depth, &mut changed);
        let approximate_window =
            or_default(self.approximate_window, defaults.approximate_window, &mut changed);
        let visible_text_limit =
            or_default(self.visible_text_limit, defaults.visible_text_limit, &mut changed);
        let short_block_limit =
            or_default(self.short_block_limit, defaults.short_block_limit, &mut changed);
        let save_debounce_ms =
            or_default(self.save_debounce_ms, defaults.save_debounce_ms, &mut changed);
        let log_filter = or_default(self.log_filter, defaults.log_filter, &mut changed);

        (
            Config {
                workspace: self.workspace,
                code_theme,
                max_embed_depth,
                approximate_window,
                visible_text_limit,
                short_block_limit,
                save_debounce_ms,
                log_filter,
            },
            changed,
        )
    }
}

pub fn config_path() -> Result<PathBuf> {
    let base = dirs::config_dir().context("Could not determine config directory")?;
    Ok(base.join("notemark").join("config.toml"))
}

pub fn ensure_config_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    Ok(())
}

pub fn load_config() -> Result<Config> {
    load_config_from(&config_path()?)
}

pub fn load_config_from(path: &Path) -> Result<Config> {
    if !path.exists() {
        let cfg = Config::default();
        write_config_to(path, &cfg)?;
        return Ok(cfg);
    }

    let raw =
        fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let (cfg, changed) = parse_config(&raw)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    if changed {
        tracing::info!(path = %path.display(), "filling missing config keys");
        write_config_to(path, &cfg)?;
    }
    Ok(cfg)
}

fn parse_config(raw: &str) -> Result<(Config, bool)> {
    let partial: PartialConfig = toml::from_str(raw)?;
    Ok(partial.apply_defaults())
}

pub fn write_config(cfg: &Config) -> Result<()> {
    write_config_to(&config_path()?, cfg)
}

fn write_config_to(path: &Path, cfg: &Config) -> Result<()> {
    ensure_config_dir(path)?;
    let text = toml::to_string_pretty(cfg).context("Failed to serialize config")?;
    fs::write(path, text).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

pub fn open_config_in_editor() -> Result<()> {
    let path = config_path()?;
    if !path.exists() {
        write_config(&Config::default())?;
    }

    let editor = env::var("EDITOR").unwrap_or_else(|_| "vi".to_string());
    let mut parts = match shell_words::split(&editor) {
        Ok(p) if !p.is_empty() => p,
        _ => vec![editor],
    };
    let cmd = parts.remove(0);
    let status = Command::new(cmd)
        .args(parts)
        .arg(&path)
        .status()
        .with_context(|| format!("Failed to launch editor for {}", path.display()))?;
    if !status.success() {
        anyhow::bail!("Editor exited with status {}", status);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_keys_are_filled_and_flagged() {
        let (cfg, changed) = parse_config("code_theme = \"InspiredGitHub\"\n").expect("parse");
        assert!(changed);
        assert_eq!(cfg.code_theme, "InspiredGitHub");
        assert_eq!(cfg.max_embed_depth, 3);
        assert_eq!(cfg.approximate_window, 80);
        assert_eq!(cfg.log_filter, "warn");
        assert_eq!(cfg.workspace, None);
    }

    #[test]
    fn complete_files_are_left_alone() {
        let full = toml::to_string_pretty(&Config::default()).expect("serialize");
        let (cfg, changed) = parse_config(&full).expect("parse");
        assert!(!changed);
        assert_eq!(cfg, Config::default());
    }

    #[test]
    fn load_writes_back_defaults() {
        let dir = std::env::temp_dir().join(format!("notemark-config-{}", std::process::id()));
        let path = dir.join("config.toml");
        fs::create_dir_all(&dir).expect("temp dir");
        fs::write(&path, "save_debounce_ms = 50\nworkspace = \"/notes\"\n").expect("seed");

        let cfg = load_config_from(&path).expect("load");
        assert_eq!(cfg.save_delay(), Duration::from_millis(50));
        assert_eq!(cfg.workspace.as_deref(), Some(Path::new("/notes")));
        let written = fs::read_to_string(&path).expect("read back");
        assert!(written.contains("short_block_limit = 240"));
        let _ = fs::remove_dir_all(&dir);
    }
}

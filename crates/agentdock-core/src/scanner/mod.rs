//! Agent directory scanning and classification
//!
//! Every direct subdirectory of the agents root is one candidate agent.
//! Classification is first-match-wins:
//!
//! 1. hidden (`.`/`~`) and ignored folder names are skipped
//! 2. `Dockerfile` plus an entry script -> [`AgentKind::Container`]
//! 3. a JSON file shaped like an n8n export -> [`AgentKind::N8nWorkflow`]
//! 4. a `.vf` file -> [`AgentKind::VoiceflowFlow`]
//! 5. an entry script alone -> [`AgentKind::DirectProcess`]
//! 6. anything else -> [`AgentKind::Unknown`]

mod readme;

pub use readme::{read_summary, summarize, ReadmeSummary};

use crate::error::{Result, ScanError};
use crate::types::{AdapterSettings, AgentDescriptor, AgentKind};
use glob::Pattern;
use std::path::Path;
use tracing::{debug, info, warn};

const DOCKERFILE: &str = "Dockerfile";

/// Scans an agents root into descriptors
pub struct AgentScanner {
    script_extension: String,
    ignored_dirs: Vec<String>,
}

impl AgentScanner {
    pub fn new(script_extension: impl Into<String>, ignored_dirs: Vec<String>) -> Self {
        Self {
            script_extension: script_extension.into(),
            ignored_dirs,
        }
    }

    pub fn from_settings(settings: &AdapterSettings) -> Self {
        Self::new(
            settings.script_extension.clone(),
            settings.ignored_dirs.clone(),
        )
    }

    /// Scan `root` and classify each subdirectory, sorted by id.
    ///
    /// Fails only when `root` itself cannot be read.
    pub fn scan(&self, root: impl AsRef<Path>) -> Result<Vec<AgentDescriptor>> {
        let root = root.as_ref();
        info!("Scanning agents directory: {:?}", root);

        let entries = std::fs::read_dir(root).map_err(|e| ScanError::RootUnreadable {
            path: root.display().to_string(),
            reason: e.to_string(),
        })?;

        let mut descriptors = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }

            let Some(id) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if self.is_skipped(&id) {
                debug!("Skipping directory: {}", id);
                continue;
            }

            match self.describe(&id, &path) {
                Some(descriptor) => descriptors.push(descriptor),
                None => warn!("Skipping unreadable agent directory: {:?}", path),
            }
        }

        descriptors.sort_by(|a, b| a.id.cmp(&b.id));
        info!("Found {} agent directories", descriptors.len());
        Ok(descriptors)
    }

    fn is_skipped(&self, name: &str) -> bool {
        name.starts_with('.')
            || name.starts_with('~')
            || self.ignored_dirs.iter().any(|d| d == name)
    }

    /// Build the descriptor for one agent directory, `None` if unreadable
    fn describe(&self, id: &str, dir: &Path) -> Option<AgentDescriptor> {
        let files = list_files(dir)?;
        let (kind, entry_file) = self.classify(id, dir, &files);

        let summary = files
            .iter()
            .find(|f| f.eq_ignore_ascii_case("README.md"))
            .map(|f| read_summary(&dir.join(f)))
            .unwrap_or_default();

        debug!("Classified {} as {} (entry: {:?})", id, kind, entry_file);

        Some(AgentDescriptor {
            id: id.to_string(),
            kind,
            root_path: dir.to_path_buf(),
            entry_file,
            name: summary.title.unwrap_or_else(|| id.to_string()),
            description: summary.description,
            files,
        })
    }

    /// Decide kind and entry file from the directory's file names
    pub fn classify(&self, id: &str, dir: &Path, files: &[String]) -> (AgentKind, Option<String>) {
        let script = self.entry_script(files);

        if script.is_some() && files.iter().any(|f| f == DOCKERFILE) {
            return (AgentKind::Container, Some(DOCKERFILE.to_string()));
        }

        let workflows: Vec<&String> = files
            .iter()
            .filter(|f| has_extension(f, "json"))
            .filter(|f| is_n8n_workflow(&dir.join(f.as_str())))
            .collect();
        if let Some(file) = prefer_named(id, &workflows) {
            return (AgentKind::N8nWorkflow, Some(file));
        }

        let flows: Vec<&String> = files.iter().filter(|f| has_extension(f, "vf")).collect();
        if let Some(file) = prefer_named(id, &flows) {
            return (AgentKind::VoiceflowFlow, Some(file));
        }

        match script {
            Some(file) => (AgentKind::DirectProcess, Some(file)),
            None => (AgentKind::Unknown, None),
        }
    }

    /// First of `*_agent.<ext>`, `agent.<ext>`, `main.<ext>` present in `files`
    fn entry_script(&self, files: &[String]) -> Option<String> {
        let ext = &self.script_extension;
        let suffixed = Pattern::new(&format!("*_agent.{}", Pattern::escape(ext))).ok();

        if let Some(pattern) = suffixed {
            if let Some(file) = files.iter().find(|f| pattern.matches(f)) {
                return Some(file.clone());
            }
        }

        [format!("agent.{}", ext), format!("main.{}", ext)]
            .into_iter()
            .find(|name| files.contains(name))
    }
}

/// Sorted names of regular files directly inside `dir`
fn list_files(dir: &Path) -> Option<Vec<String>> {
    let mut files = Vec::new();

    for entry in walkdir::WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
    {
        match entry {
            Ok(entry) => {
                if entry.file_type().is_file() {
                    if let Some(name) = entry.file_name().to_str() {
                        files.push(name.to_string());
                    }
                }
            }
            Err(e) if e.depth() == 0 => return None,
            Err(e) => debug!("Skipping unreadable entry: {}", e),
        }
    }

    Some(files)
}

fn has_extension(file: &str, ext: &str) -> bool {
    Path::new(file)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case(ext))
        .unwrap_or(false)
}

/// Prefer a candidate whose name contains the agent id
fn prefer_named(id: &str, candidates: &[&String]) -> Option<String> {
    let id = id.to_lowercase();
    candidates
        .iter()
        .find(|f| f.to_lowercase().contains(&id))
        .or_else(|| candidates.first())
        .map(|f| f.to_string())
}

/// Whether a JSON file has both a `nodes` array and a `connections` object
fn is_n8n_workflow(path: &Path) -> bool {
    let Ok(raw) = std::fs::read_to_string(path) else {
        return false;
    };
    match serde_json::from_str::<serde_json::Value>(&raw) {
        Ok(value) => {
            value.get("nodes").map_or(false, |n| n.is_array())
                && value.get("connections").map_or(false, |c| c.is_object())
        }
        Err(e) => {
            debug!("Ignoring unparseable JSON {:?}: {}", path, e);
            false
        }
    }
}

//! Skill document discovery, manifest, and routing.
//!
//! Skills are human-authored markdown documents with YAML-ish front-matter,
//! identified by a stable path-derived `skill_ref`. The system prompt only
//! ever sees routed *summaries*; full bodies are fetched through the
//! skill-reader tool when the model chooses to.

use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use walkdir::WalkDir;

use crate::error::Result;
use cortex_memory::text::tokenize;

/// One manifest row describing a skill document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillManifestEntry {
    pub skill_ref: String,
    pub title: String,
    pub description: String,
    pub path: String,
    pub version: u32,
    pub last_updated: String,
    pub confidence: f64,
}

/// Derive the stable ref from a path under the skills root:
/// `skills/sqlite/ingest/SKILL.md → sqlite/ingest`.
fn derive_skill_ref(path: &Path, skills_root: &Path) -> String {
    let relative = path.strip_prefix(skills_root).unwrap_or(path);
    let mut parts: Vec<String> = relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy().into_owned())
        .collect();
    if let Some(last) = parts.last().cloned() {
        if last.eq_ignore_ascii_case("skill.md") {
            parts.pop();
        } else if let Some(stem) = last.strip_suffix(".md") {
            if let Some(slot) = parts.last_mut() {
                *slot = stem.to_string();
            }
        }
    }
    if parts.is_empty() {
        "unknown-skill".to_string()
    } else {
        parts.join("/")
    }
}

fn extract_front_matter(text: &str) -> Vec<(String, String)> {
    let mut lines = text.lines();
    if lines.next().map(str::trim) != Some("---") {
        return Vec::new();
    }
    let mut meta = Vec::new();
    for line in lines {
        let trimmed = line.trim();
        if trimmed == "---" {
            return meta;
        }
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let Some((key, value)) = trimmed.split_once(':') else {
            continue;
        };
        let key = key.trim().to_lowercase();
        let value = value.trim().trim_matches('"').trim_matches('\'').to_string();
        if matches!(key.as_str(), "name" | "title" | "description" | "version") && !value.is_empty()
        {
            meta.push((key, value));
        }
    }
    // Unterminated front-matter is treated as absent.
    Vec::new()
}

fn meta_value<'a>(meta: &'a [(String, String)], key: &str) -> Option<&'a str> {
    meta.iter()
        .find(|(meta_key, _)| meta_key == key)
        .map(|(_, value)| value.as_str())
}

fn extract_title_and_description(text: &str) -> (String, String) {
    let meta = extract_front_matter(text);
    let mut title = meta_value(&meta, "title")
        .or_else(|| meta_value(&meta, "name"))
        .unwrap_or("Untitled Skill")
        .to_string();
    if title == "Untitled Skill" {
        for line in text.lines() {
            let stripped = line.trim();
            if let Some(heading) = stripped.strip_prefix('#') {
                title = heading.trim_start_matches('#').trim().to_string();
                break;
            }
        }
    }

    if let Some(description) = meta_value(&meta, "description") {
        return (title, description.to_string());
    }

    let mut prose: Vec<&str> = Vec::new();
    for line in text.lines() {
        let stripped = line.trim();
        if stripped.is_empty()
            || stripped.starts_with('#')
            || stripped.starts_with("- ")
            || stripped.starts_with("* ")
            || stripped == "---"
        {
            continue;
        }
        prose.push(stripped);
        if prose.len() >= 3 {
            break;
        }
    }
    let description = if prose.is_empty() {
        "No description provided.".to_string()
    } else {
        prose.join(" ")
    };
    (title, description)
}

fn extract_version(text: &str) -> u32 {
    let meta = extract_front_matter(text);
    meta_value(&meta, "version")
        .and_then(|raw| raw.trim().parse::<u32>().ok())
        .map_or(1, |version| version.max(1))
}

/// Find every `SKILL.md` under the skills root, sorted by path.
#[must_use]
pub fn discover_skill_files(skills_root: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(skills_root)
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| entry.file_name().to_string_lossy().eq_ignore_ascii_case("skill.md"))
        .map(walkdir::DirEntry::into_path)
        .collect();
    files.sort();
    files
}

/// Scan the skills directory and (re)write the manifest JSON.
pub fn build_skill_manifest(
    skills_root: &Path,
    manifest_path: &Path,
) -> Result<Vec<SkillManifestEntry>> {
    const DEFAULT_CONFIDENCE: f64 = 0.7;

    if let Some(parent) = manifest_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if !skills_root.exists() {
        std::fs::write(manifest_path, "[]\n")?;
        return Ok(Vec::new());
    }

    let mut entries = Vec::new();
    for path in discover_skill_files(skills_root) {
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(error) => {
                warn!(path = %path.display(), %error, "skipping unreadable skill file");
                continue;
            }
        };
        let (title, description) = extract_title_and_description(&text);
        let last_updated = std::fs::metadata(&path)
            .and_then(|metadata| metadata.modified())
            .map(|modified| {
                DateTime::<Utc>::from(modified).to_rfc3339_opts(SecondsFormat::Secs, false)
            })
            .unwrap_or_default();
        entries.push(SkillManifestEntry {
            skill_ref: derive_skill_ref(&path, skills_root),
            title,
            description,
            path: path.display().to_string(),
            version: extract_version(&text),
            last_updated,
            confidence: DEFAULT_CONFIDENCE,
        });
    }

    entries.sort_by(|a, b| a.skill_ref.cmp(&b.skill_ref));
    let mut body = serde_json::to_string_pretty(&entries)?;
    body.push('\n');
    std::fs::write(manifest_path, body)?;
    Ok(entries)
}

/// Render routed summaries for the system prompt (summary metadata only).
#[must_use]
pub fn manifest_summaries_text(entries: &[SkillManifestEntry]) -> String {
    if entries.is_empty() {
        return "No skills available.".to_string();
    }
    let mut lines = vec!["Available skills (summary metadata only):".to_string()];
    for entry in entries {
        lines.push(format!("- ref: {}", entry.skill_ref));
        lines.push(format!("  title: {}", entry.title));
        lines.push(format!("  description: {}", entry.description));
    }
    lines.join("\n")
}

/// Rank manifest entries for a task by token overlap plus a small
/// confidence bonus; stable tiebreak by `skill_ref`.
#[must_use]
pub fn route_manifest_entries(
    task: &str,
    entries: &[SkillManifestEntry],
    top_k: usize,
) -> Vec<SkillManifestEntry> {
    if entries.is_empty() || top_k == 0 {
        return Vec::new();
    }
    let task_tokens = tokenize(task);
    let mut scored: Vec<(f64, &SkillManifestEntry)> = entries
        .iter()
        .map(|entry| {
            let haystack = format!("{} {} {}", entry.title, entry.description, entry.skill_ref);
            let overlap = tokenize(&haystack)
                .intersection(&task_tokens)
                .count() as f64;
            (overlap + 0.1 * entry.confidence, entry)
        })
        .collect();
    scored.sort_by(|a, b| {
        b.0.partial_cmp(&a.0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.1.skill_ref.cmp(&b.1.skill_ref))
    });
    scored
        .into_iter()
        .take(top_k)
        .map(|(_, entry)| entry.clone())
        .collect()
}

/// Resolve a skill body by exact ref.
pub fn resolve_skill_content(
    entries: &[SkillManifestEntry],
    skill_ref: &str,
) -> std::result::Result<String, String> {
    let target = skill_ref.trim();
    if target.is_empty() {
        return Err("Missing required field: skill_ref".to_string());
    }
    let Some(entry) = entries.iter().find(|entry| entry.skill_ref == target) else {
        return Err(format!("Unknown skill_ref: {target:?}"));
    };
    let path = Path::new(&entry.path);
    if !path.exists() {
        return Err(format!("Skill file missing on disk: {}", entry.path));
    }
    std::fs::read_to_string(path).map_err(|error| format!("Failed to read skill file: {error}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_skill(root: &Path, rel_dir: &str, body: &str) -> PathBuf {
        let dir = root.join(rel_dir);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("SKILL.md");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn manifest_derives_refs_and_front_matter() {
        let dir = tempfile::tempdir().unwrap();
        let skills_root = dir.path().join("skills");
        write_skill(
            &skills_root,
            "sqlite/ingest",
            "---\nname: SQLite ingest\ndescription: Load CSV fixtures into tables\nversion: 3\n---\n# Body\n",
        );
        write_skill(&skills_root, "gridtool/basics", "# Gridtool basics\n\nPipeline DSL for CSV.\n");
        let manifest_path = dir.path().join("skills_manifest.json");

        let entries = build_skill_manifest(&skills_root, &manifest_path).unwrap();
        assert_eq!(entries.len(), 2);
        // Sorted by skill_ref.
        assert_eq!(entries[0].skill_ref, "gridtool/basics");
        assert_eq!(entries[1].skill_ref, "sqlite/ingest");
        assert_eq!(entries[1].title, "SQLite ingest");
        assert_eq!(entries[1].version, 3);
        assert_eq!(entries[0].description, "Pipeline DSL for CSV.");
        assert!(manifest_path.exists());
    }

    #[test]
    fn routing_prefers_token_overlap_with_stable_tiebreak() {
        let entries = vec![
            SkillManifestEntry {
                skill_ref: "gridtool/basics".into(),
                title: "Gridtool basics".into(),
                description: "LOAD KEEP TALLY RANK SHOW pipeline".into(),
                path: String::new(),
                version: 1,
                last_updated: String::new(),
                confidence: 0.7,
            },
            SkillManifestEntry {
                skill_ref: "sqlite/ingest".into(),
                title: "SQLite ingest".into(),
                description: "CSV import aggregate totals".into(),
                path: String::new(),
                version: 1,
                last_updated: String::new(),
                confidence: 0.7,
            },
        ];
        let routed = route_manifest_entries("sqlite import aggregate grouped totals", &entries, 1);
        assert_eq!(routed[0].skill_ref, "sqlite/ingest");
        let both = route_manifest_entries("unrelated words entirely", &entries, 2);
        assert_eq!(both.len(), 2);
        assert_eq!(both[0].skill_ref, "gridtool/basics");
    }

    #[test]
    fn resolve_skill_content_errors_are_descriptive() {
        let dir = tempfile::tempdir().unwrap();
        let skills_root = dir.path().join("skills");
        write_skill(&skills_root, "shell/zip", "# Zip\nUse the zip command.\n");
        let manifest = dir.path().join("manifest.json");
        let entries = build_skill_manifest(&skills_root, &manifest).unwrap();

        assert!(resolve_skill_content(&entries, "shell/zip").unwrap().contains("zip"));
        assert!(resolve_skill_content(&entries, "nope").unwrap_err().contains("Unknown skill_ref"));
        assert!(resolve_skill_content(&entries, " ").unwrap_err().contains("Missing required"));
    }

    #[test]
    fn missing_skills_root_yields_empty_manifest_file() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = dir.path().join("learning/manifest.json");
        let entries = build_skill_manifest(&dir.path().join("absent"), &manifest).unwrap();
        assert!(entries.is_empty());
        assert_eq!(std::fs::read_to_string(manifest).unwrap(), "[]\n");
    }
}

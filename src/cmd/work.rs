//! `pcc import`, `pcc enqueue` and `pcc status`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};

use pcc::config::PccConfig;
use pcc::orchestrator::EnqueueOutcome;
use pcc::server::build_services;
use pcc::work_items::spec_file::parse_spec_document;
use pcc_common::WorkItemSpec;

use super::print_json;

/// Markdown files to import: the file itself, or every `.md` directly under
/// a directory, in name order.
fn spec_paths(path: &Path) -> Result<Vec<PathBuf>> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }
    if !path.is_dir() {
        bail!("{} does not exist", path.display());
    }
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(path)
        .with_context(|| format!("Failed to read {}", path.display()))?
    {
        let entry_path = entry?.path();
        if entry_path.is_file() && entry_path.extension().is_some_and(|ext| ext == "md") {
            paths.push(entry_path);
        }
    }
    paths.sort();
    Ok(paths)
}

fn load_specs(path: &Path) -> Result<Vec<WorkItemSpec>> {
    let mut specs = Vec::new();
    for file in spec_paths(path)? {
        let text = std::fs::read_to_string(&file)
            .with_context(|| format!("Failed to read {}", file.display()))?;
        let spec = parse_spec_document(&text)
            .with_context(|| format!("Invalid work order {}", file.display()))?;
        specs.push(spec);
    }
    Ok(specs)
}

pub async fn cmd_import(config: &PccConfig, path: &Path, project: &str) -> Result<()> {
    let specs = load_specs(path)?;
    if specs.is_empty() {
        bail!("No work orders found in {}", path.display());
    }
    let services = build_services(config)?;
    let state = services.state;
    let key = project.to_string();
    let project_id = state
        .db
        .call(move |db| db.resolve_canonical(&key))
        .await?
        .with_context(|| format!("Project {project} not found"))?;
    let items = state.work_items.import(&project_id, specs).await?;
    print_json(&items)
}

pub async fn cmd_enqueue(config: &PccConfig, work_item_id: &str, wait: bool) -> Result<()> {
    let services = build_services(config)?;
    let orchestrator = services.state.orchestrator.clone();
    let outcome = orchestrator.enqueue(work_item_id).await?;
    match &outcome {
        EnqueueOutcome::Started { run } if wait => {
            let timeout = Duration::from_secs(u64::from(config.toml.shift.timeout_minutes) * 60);
            let run = orchestrator.wait(&run.id, timeout).await?;
            print_json(&run)
        }
        _ => print_json(&outcome),
    }
}

pub async fn cmd_status(config: &PccConfig) -> Result<()> {
    let services = build_services(config)?;
    let context = services.state.portfolio.global_context().await?;
    print_json(&context)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_spec_paths_picks_markdown_in_order() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("b.md"), "").unwrap();
        std::fs::write(dir.path().join("a.md"), "").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "").unwrap();

        let paths = spec_paths(dir.path()).unwrap();
        let names: Vec<_> = paths
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.md", "b.md"]);
    }

    #[test]
    fn test_load_specs_reports_the_bad_file() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("bad.md"), "---\npriority: 2\n---\nno title\n").unwrap();
        let err = load_specs(dir.path()).unwrap_err();
        assert!(format!("{err:#}").contains("bad.md"));
    }

    #[test]
    fn test_missing_path_errors() {
        assert!(spec_paths(Path::new("/definitely/not/here")).is_err());
    }
}

//! Work order spec documents: markdown with a YAML frontmatter block.
//!
//! ```markdown
//! ---
//! id: WO-12
//! title: Add OAuth login
//! priority: 2
//! acceptance_criteria:
//!   - users can sign in with GitHub
//! depends_on: [WO-9]
//! ---
//! Free-form notes for the agent.
//! ```

use serde::Serialize;

use pcc_common::{WorkItem, WorkItemSpec};

use crate::errors::WorkItemError;

const FENCE: &str = "---";

/// Split a document into its frontmatter and body.
fn split_frontmatter(text: &str) -> Option<(&str, &str)> {
    let text = text.trim_start_matches('\u{feff}');
    let rest = text.strip_prefix(FENCE)?;
    let rest = rest.strip_prefix("\r\n").or_else(|| rest.strip_prefix('\n'))?;
    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        if line.trim_end() == FENCE {
            let front = &rest[..offset];
            let body = &rest[offset + line.len()..];
            return Some((front, body));
        }
        offset += line.len();
    }
    None
}

pub fn parse_spec_document(text: &str) -> Result<WorkItemSpec, WorkItemError> {
    let (front, body) = split_frontmatter(text).ok_or_else(|| {
        WorkItemError::InvalidSpec("document must start with a --- frontmatter block".to_string())
    })?;
    let mut spec: WorkItemSpec = serde_yaml::from_str(front)
        .map_err(|e| WorkItemError::InvalidSpec(format!("bad frontmatter: {e}")))?;
    spec.body = body.trim().to_string();
    spec.validate().map_err(WorkItemError::InvalidSpec)?;
    Ok(spec)
}

#[derive(Serialize)]
struct Frontmatter<'a> {
    id: &'a str,
    title: &'a str,
    goal: &'a str,
    acceptance_criteria: &'a [String],
    non_goals: &'a [String],
    stop_conditions: &'a [String],
    priority: u8,
    tags: &'a [String],
    depends_on: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    estimate_usd: Option<f64>,
}

pub fn render_spec_document(item: &WorkItem, body: &str) -> Result<String, WorkItemError> {
    let front = Frontmatter {
        id: &item.id,
        title: &item.title,
        goal: &item.goal,
        acceptance_criteria: &item.acceptance_criteria,
        non_goals: &item.non_goals,
        stop_conditions: &item.stop_conditions,
        priority: item.priority,
        tags: &item.tags,
        depends_on: &item.depends_on,
        estimate_usd: item.estimate_usd,
    };
    let yaml = serde_yaml::to_string(&front)
        .map_err(|e| WorkItemError::Other(anyhow::Error::new(e).context("Failed to render spec")))?;
    let mut out = format!("{FENCE}\n{yaml}{FENCE}\n");
    if !body.is_empty() {
        out.push('\n');
        out.push_str(body);
        out.push('\n');
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = "---\nid: WO-12\ntitle: Add OAuth login\npriority: 2\nacceptance_criteria:\n  - users can sign in with GitHub\ndepends_on: [WO-9]\ntags: [auth]\n---\nUse the existing session store.\n";

    #[test]
    fn test_parse_document() {
        let spec = parse_spec_document(DOC).unwrap();
        assert_eq!(spec.id.as_deref(), Some("WO-12"));
        assert_eq!(spec.priority, 2);
        assert_eq!(spec.depends_on, vec!["WO-9"]);
        assert_eq!(spec.acceptance_criteria.len(), 1);
        assert_eq!(spec.body, "Use the existing session store.");
    }

    #[test]
    fn test_missing_frontmatter_rejected() {
        let err = parse_spec_document("# Just a heading\n").unwrap_err();
        assert!(matches!(err, WorkItemError::InvalidSpec(_)));
    }

    #[test]
    fn test_unterminated_frontmatter_rejected() {
        assert!(parse_spec_document("---\ntitle: x\n").is_err());
    }

    #[test]
    fn test_invalid_priority_rejected() {
        let doc = "---\ntitle: x\npriority: 0\n---\n";
        assert!(parse_spec_document(doc).is_err());
    }

    #[test]
    fn test_rendered_document_parses_back() {
        let spec = parse_spec_document(DOC).unwrap();
        let now = chrono::Utc::now();
        let item = WorkItem {
            id: "WO-12".into(),
            project_id: "p".into(),
            title: spec.title.clone(),
            goal: spec.goal.clone(),
            acceptance_criteria: spec.acceptance_criteria.clone(),
            non_goals: vec![],
            stop_conditions: vec![],
            priority: spec.priority,
            tags: spec.tags.clone(),
            depends_on: spec.depends_on.clone(),
            status: pcc_common::WorkItemStatus::Backlog,
            estimate_usd: None,
            spec_path: None,
            created_at: now,
            updated_at: now,
        };
        let rendered = render_spec_document(&item, &spec.body).unwrap();
        let reparsed = parse_spec_document(&rendered).unwrap();
        assert_eq!(reparsed.title, "Add OAuth login");
        assert_eq!(reparsed.body, spec.body);
    }
}

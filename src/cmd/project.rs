//! `pcc project add|list`.

use anyhow::{Result, bail};

use pcc::config::PccConfig;
use pcc::store::NewProject;

use super::super::ProjectCommands;
use super::print_json;

pub async fn cmd_project(config: &PccConfig, command: ProjectCommands) -> Result<()> {
    let db = pcc::server::open_db(config)?;
    match command {
        ProjectCommands::Add {
            name,
            path,
            id,
            priority,
            test_command,
            requires_vm,
        } => {
            if !(1..=5).contains(&priority) {
                bail!("priority must be between 1 and 5, got {priority}");
            }
            let mut new = NewProject::new(&name, &path);
            new.id = id;
            new.priority = priority;
            new.test_command = test_command;
            new.requires_vm = requires_vm;
            let project = db
                .call(move |db| {
                    if let Some(id) = &new.id
                        && db.resolve_canonical(id)?.is_some()
                    {
                        bail!("Project {id} already exists");
                    }
                    db.create_project(&new)
                })
                .await?;
            print_json(&project)
        }
        ProjectCommands::List => {
            let projects = db.call(|db| db.list_projects()).await?;
            print_json(&projects)
        }
    }
}

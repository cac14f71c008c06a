//! CLI command implementations.
//!
//! | Module    | Commands handled                   |
//! |-----------|------------------------------------|
//! | `serve`   | `Init`, `Serve`                    |
//! | `project` | `Project`                          |
//! | `work`    | `Import`, `Enqueue`, `Status`      |
//! | `config`  | `Config`                           |

pub mod config;
pub mod project;
pub mod serve;
pub mod work;

pub use config::cmd_config;
pub use project::cmd_project;
pub use serve::{cmd_init, cmd_serve};
pub use work::{cmd_enqueue, cmd_import, cmd_status};

/// Print a value as pretty JSON on stdout.
pub(crate) fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

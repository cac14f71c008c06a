//! Shared domain types for the project control center.
//!
//! Everything here is plain data: records persisted by the store, the closed
//! enums that name their states, and the event payloads pushed to subscribers.
//! No I/O lives in this crate.

/// Implements `as_str`, `Display` and `FromStr` for a fieldless enum using the
/// snake_case wire names that are also stored in the database.
#[macro_export]
macro_rules! str_enum {
    ($ty:ident, $label:literal, { $($variant:ident => $name:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $name,)+
                }
            }

            pub fn all() -> &'static [$ty] {
                &[$(Self::$variant),+]
            }
        }

        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($name => Ok(Self::$variant),)+
                    _ => Err(format!("Invalid {}: {}", $label, s)),
                }
            }
        }
    };
}

pub mod action;
pub mod budget;
pub mod communication;
pub mod events;
pub mod merge;
pub mod project;
pub mod run;
pub mod shift;
pub mod vm;
pub mod work_item;

pub use action::ActionItem;
pub use budget::{BudgetAllocation, BudgetSnapshot, BudgetStatus, CostEvent};
pub use communication::{
    Communication, CommunicationIntent, CommunicationScope, CommunicationType, EscalationReason,
    EscalationRecord, NewCommunication,
};
pub use events::ControlEvent;
pub use merge::MergeLock;
pub use project::{Project, ProjectStatus};
pub use run::{FailureReason, Run, RunCommand, RunPhase, RunStatus};
pub use shift::{Decision, GlobalSession, Handoff, SessionState, Shift, ShiftAction, ShiftPhase};
pub use vm::{SizeClass, VmRecord, VmStatus};
pub use work_item::{WorkItem, WorkItemEvent, WorkItemPatch, WorkItemSpec, WorkItemStatus};

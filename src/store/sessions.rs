use anyhow::{Context, Result};
use rusqlite::{OptionalExtension, params};

use pcc_common::GlobalSession;

use super::{PccDb, enum_col, json_col, to_json};

const SESSION_COLUMNS: &str = "id, state, goals, constraints, iteration, max_iterations, \
     paused_at, pause_reason, created_at, updated_at";

fn map_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<GlobalSession> {
    Ok(GlobalSession {
        id: row.get(0)?,
        state: enum_col(row, 1)?,
        goals: json_col(row, 2)?,
        constraints: json_col(row, 3)?,
        iteration: row.get(4)?,
        max_iterations: row.get(5)?,
        paused_at: row.get(6)?,
        pause_reason: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

impl PccDb {
    pub fn save_session(&self, session: &GlobalSession) -> Result<()> {
        self.conn
            .execute(
                &format!(
                    "INSERT INTO global_sessions ({SESSION_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                     ON CONFLICT(id) DO UPDATE SET
                        state = excluded.state,
                        goals = excluded.goals,
                        constraints = excluded.constraints,
                        iteration = excluded.iteration,
                        max_iterations = excluded.max_iterations,
                        paused_at = excluded.paused_at,
                        pause_reason = excluded.pause_reason,
                        updated_at = excluded.updated_at"
                ),
                params![
                    session.id,
                    session.state.as_str(),
                    to_json(&session.goals)?,
                    to_json(&session.constraints)?,
                    session.iteration,
                    session.max_iterations,
                    session.paused_at,
                    session.pause_reason,
                    session.created_at,
                    session.updated_at,
                ],
            )
            .context("Failed to save session")?;
        Ok(())
    }

    /// The most recently created session, finished or not.
    pub fn latest_session(&self) -> Result<Option<GlobalSession>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {SESSION_COLUMNS} FROM global_sessions
                     ORDER BY created_at DESC, rowid DESC LIMIT 1"
                ),
                [],
                map_session,
            )
            .optional()
            .context("Failed to query session")
    }

    pub fn get_session(&self, id: &str) -> Result<Option<GlobalSession>> {
        self.conn
            .query_row(
                &format!("SELECT {SESSION_COLUMNS} FROM global_sessions WHERE id = ?1"),
                params![id],
                map_session,
            )
            .optional()
            .context("Failed to query session")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pcc_common::SessionState;

    #[test]
    fn test_save_and_reload_session() {
        let db = PccDb::new_in_memory().unwrap();
        let now = Utc::now();
        let mut session = GlobalSession {
            id: "s1".into(),
            state: SessionState::Briefing,
            goals: vec!["ship auth".into()],
            constraints: vec!["no schema changes".into()],
            iteration: 0,
            max_iterations: 5,
            paused_at: None,
            pause_reason: None,
            created_at: now,
            updated_at: now,
        };
        db.save_session(&session).unwrap();
        session.state = SessionState::Autonomous;
        session.iteration = 2;
        db.save_session(&session).unwrap();
        let latest = db.latest_session().unwrap().unwrap();
        assert_eq!(latest.state, SessionState::Autonomous);
        assert_eq!(latest.iteration, 2);
        assert_eq!(latest.goals, vec!["ship auth"]);
        assert!(db.get_session("nope").unwrap().is_none());
    }
}

//! Project operations.

use rusqlite::{OptionalExtension, params};

use super::models::{Project, ProjectStatus};
use super::{UnitOfWork, now_rfc3339};
use crate::error::{DatabaseError, ServiceResult};

const PROJECT_COLUMNS: &str = "id, name, status, created_at";

impl UnitOfWork<'_> {
    /// Insert a new project in `created` state
    pub fn insert_project(&self, id: &str, name: &str) -> ServiceResult<Project> {
        let created_at = now_rfc3339();
        self.execute(
            "INSERT INTO projects (id, name, status, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![id, name, ProjectStatus::Created.to_string(), created_at],
        )
        .map_err(DatabaseError::Query)?;

        Ok(Project {
            id: id.to_string(),
            name: name.to_string(),
            status: ProjectStatus::Created,
            created_at: super::models::parse_timestamp(&created_at),
        })
    }

    /// Read a project without taking a lease
    pub fn get_project(&self, id: &str) -> ServiceResult<Option<Project>> {
        let project = self
            .query_row(
                &format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE id = ?1"),
                params![id],
                Project::from_row,
            )
            .optional()
            .map_err(DatabaseError::Query)?;
        Ok(project)
    }

    /// Read a project under the exclusive lease of this unit of work
    pub fn lease_project(&self, id: &str) -> ServiceResult<Option<Project>> {
        self.require_lease()?;
        self.get_project(id)
    }

    pub fn set_project_status(&self, id: &str, status: ProjectStatus) -> ServiceResult<bool> {
        let rows = self
            .execute(
                "UPDATE projects SET status = ?1 WHERE id = ?2",
                params![status.to_string(), id],
            )
            .map_err(DatabaseError::Query)?;
        Ok(rows > 0)
    }
}

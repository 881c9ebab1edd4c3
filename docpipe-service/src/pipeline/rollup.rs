//! Project status rollup.

use tracing::{debug, info};

use crate::db::{Document, DocumentStatus, ProjectStatus, UnitOfWork};
use crate::error::ServiceResult;

/// What a rollup decided
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollupOutcome {
    Promoted,
    AlreadyReady,
    Pending { ready: usize, total: usize },
    ProjectMissing,
}

/// A project is complete when it has documents and every one of them is
/// ready with counters that agree with its chunk total. The counters are
/// re-checked rather than trusting the stored status alone.
pub fn project_complete(documents: &[Document]) -> bool {
    !documents.is_empty() && documents.iter().all(document_complete)
}

fn document_complete(document: &Document) -> bool {
    document.status == DocumentStatus::Ready && document.counters_saturated()
}

/// Re-evaluate a project inside the caller's unit of work. Any promotion
/// commits together with whatever change triggered the rollup.
pub(crate) fn rollup_project(uow: &UnitOfWork<'_>, project_id: &str) -> ServiceResult<RollupOutcome> {
    let Some(project) = uow.lease_project(project_id)? else {
        return Ok(RollupOutcome::ProjectMissing);
    };
    if project.status == ProjectStatus::Ready {
        return Ok(RollupOutcome::AlreadyReady);
    }

    let documents = uow.list_project_documents(project_id)?;
    if project_complete(&documents) {
        uow.set_project_status(project_id, ProjectStatus::Ready)?;
        info!(project_id = %project_id, documents = documents.len(), "Project ready");
        return Ok(RollupOutcome::Promoted);
    }

    let ready = documents.iter().filter(|d| document_complete(d)).count();
    debug!(project_id = %project_id, ready, total = documents.len(), "Project still pending");
    Ok(RollupOutcome::Pending {
        ready,
        total: documents.len(),
    })
}

//! The `load` command

use anyhow::{Context, Result};

use super::output::Output;
use super::status::print_report;
use crate::diagnostics::ErrorJournal;
use crate::runtime::DegradationMode;
use crate::session::{workspace_inputs, Session, SessionOptions};
use crate::storage::Workspace;

pub fn run(
    workspace: &mut Workspace,
    output: &Output,
    mode: Option<DegradationMode>,
    max_concurrency: Option<usize>,
) -> Result<()> {
    let settings = &mut workspace.config_mut().settings;
    if let Some(mode) = mode {
        settings.degradation_mode = mode;
    }
    if let Some(max) = max_concurrency {
        settings.max_concurrency = max;
    }
    settings.validate()?;

    let settings = &workspace.config().settings;
    let options = SessionOptions::from(settings);
    let error_retention = settings.error_retention();

    let inputs = workspace_inputs(workspace)?;
    tracing::debug!(
        units = inputs.units.len(),
        rejected = inputs.rejected.len(),
        "collected enabled units"
    );

    let journal = ErrorJournal::new(workspace.errors_path());
    match journal.prune(error_retention) {
        Ok(0) => {}
        Ok(pruned) => tracing::debug!(pruned, "pruned expired error records"),
        Err(e) => tracing::warn!(error = %e, "failed to prune error journal"),
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;

    let mut session = Session::new(options, workspace.metadata_store()?);
    let report = runtime.block_on(session.load_workspace(inputs))?;

    if let Err(e) = report.save(&workspace.status_path()) {
        tracing::warn!(error = %e, "failed to persist status report");
    }
    if let Err(e) = journal.append(&session.errors().entries()) {
        tracing::warn!(error = %e, "failed to persist error records");
    }

    print_report(output, &report);
    Ok(())
}

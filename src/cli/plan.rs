//! The `plan` command

use anyhow::Result;

use super::output::Output;
use crate::session::{workspace_inputs, Session, SessionOptions};
use crate::storage::Workspace;

pub fn run(workspace: &Workspace, output: &Output) -> Result<()> {
    let inputs = workspace_inputs(workspace)?;
    let options = SessionOptions::from(&workspace.config().settings);
    let mut session = Session::new(options, workspace.metadata_store()?);
    let plan = session.plan(&inputs.units)?;

    if output.is_json() {
        output.data(&serde_json::json!({
            "waves": plan.waves,
            "excluded": plan.excluded,
            "rejected": inputs.rejected,
        }));
        return Ok(());
    }

    if plan.waves.is_empty() {
        println!("Nothing to load.");
    }
    for (index, wave) in plan.waves.iter().enumerate() {
        let names: Vec<&str> = wave.iter().map(|id| id.as_str()).collect();
        println!("Wave {}: {}", index, names.join(", "));
    }

    if !plan.excluded.is_empty() {
        output.blank();
        println!("Excluded ({}):", plan.excluded.len());
        for unit in &plan.excluded {
            output.row(&[
                unit.id.as_str(),
                unit.detail.as_deref().unwrap_or("-"),
            ]);
        }
    }

    if !inputs.rejected.is_empty() {
        output.blank();
        println!("Rejected files ({}):", inputs.rejected.len());
        for ctx in &inputs.rejected {
            let path = ctx.snapshot.get("path").map(String::as_str).unwrap_or("-");
            output.row(&[path, ctx.message.as_str()]);
        }
    }

    Ok(())
}

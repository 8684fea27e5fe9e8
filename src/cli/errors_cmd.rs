//! The `errors` command

use anyhow::Result;

use super::output::Output;
use crate::diagnostics::ErrorJournal;
use crate::domain::UnitId;
use crate::storage::Workspace;

pub fn run(workspace: &Workspace, output: &Output, limit: usize, unit: Option<&str>) -> Result<()> {
    let unit = unit.map(UnitId::new).transpose()?;
    let journal = ErrorJournal::new(workspace.errors_path());
    let entries = journal.tail(limit, unit.as_ref())?;

    if output.is_json() {
        output.data(&entries);
    } else if entries.is_empty() {
        println!("No errors recorded.");
    } else {
        for entry in &entries {
            println!("{}", entry);
            for (key, value) in &entry.snapshot {
                println!("    {}: {}", key, value);
            }
        }
    }

    Ok(())
}

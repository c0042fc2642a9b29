//! Snapshot file commands.

use ctxkeeper_session::snapshot_path;

use crate::{AppContext, SnapshotAction};

pub fn handle(action: SnapshotAction, ctx: &AppContext) -> anyhow::Result<()> {
    match action {
        SnapshotAction::Path { conversation } => {
            let dir = ctx.config.snapshot.resolve_directory();
            let path = snapshot_path(&dir, &conversation, &ctx.config.model.name);
            println!("{}", path.display());
            if !path.exists() {
                eprintln!("(no snapshot saved yet)");
            }
        }
    }
    Ok(())
}

use crate::Context;
use crate::cli::RollbackArgs;
use crate::commands::{engine, print_json};
use crate::ui;
use anyhow::{Context as _, Result};
use hostkit::{CancelToken, InstanceId};
use reconcile::{LogProgress, RollbackOptions};

pub fn run(ctx: &Context, args: RollbackArgs) -> Result<()> {
    let engine = engine(&ctx.config)?;
    let report = engine
        .rollback(
            &InstanceId::new(&args.instance),
            &args.checkpoint,
            RollbackOptions {
                delete_home: args.delete_home,
            },
            &CancelToken::new(),
            &LogProgress,
        )
        .with_context(|| format!("Rollback of {} to {} failed", args.instance, args.checkpoint))?;
    if !ctx.quiet {
        ui::rollback_report(&report);
    }
    print_json(&report)
}

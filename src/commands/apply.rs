use crate::Context;
use crate::cli::ApplyArgs;
use crate::commands::{ErrorReport, engine, print_json};
use crate::config::load_template;
use crate::ui;
use anyhow::{Result, bail};
use hostkit::{CancelToken, InstanceId};
use reconcile::{ApplyOptions, ApplyRequest, ApplyResult, LogProgress, WorkerPool};
use serde::Serialize;

/// One instance's entry in the JSON output.
#[derive(Serialize)]
#[serde(untagged)]
enum Outcome {
    Applied(Box<ApplyResult>),
    Failed {
        instance_id: InstanceId,
        error: ErrorReport,
    },
}

pub fn run(ctx: &Context, args: ApplyArgs) -> Result<()> {
    let template = load_template(&args.template)?;
    let engine = engine(&ctx.config)?;
    let options = ApplyOptions {
        package_manager_preference: args.package_manager,
        dry_run: args.dry_run,
        force: args.force,
        continue_on_error: args.continue_on_error,
        delete_home_on_rollback: args.delete_home_on_rollback,
    };
    let token = CancelToken::new();

    let ids: Vec<InstanceId> = args.instances.iter().map(InstanceId::new).collect();
    let results = if let [only] = ids.as_slice() {
        vec![engine.apply(only, &template, &options, &token, &LogProgress)]
    } else {
        let pool = WorkerPool::new(args.jobs.unwrap_or(ctx.config.workers))?;
        log::info!(
            "Applying {} to {} instances on {} workers",
            template.name,
            ids.len(),
            pool.workers()
        );
        let requests = ids
            .iter()
            .map(|id| ApplyRequest {
                instance: id.clone(),
                template: template.clone(),
                options: options.clone(),
            })
            .collect();
        engine.apply_many(&pool, requests, &token, &LogProgress)
    };

    let mut failed = 0;
    let outcomes: Vec<Outcome> = ids
        .into_iter()
        .zip(results)
        .map(|(id, result)| match result {
            Ok(result) => {
                if !ctx.quiet {
                    ui::apply_result(&result);
                }
                Outcome::Applied(Box::new(result))
            }
            Err(e) => {
                failed += 1;
                ui::error(&format!("{id}: {e}"));
                if let reconcile::Error::Conflict { conflicts } = &e {
                    for conflict in conflicts {
                        ui::dim(&conflict.to_string());
                    }
                }
                Outcome::Failed {
                    instance_id: id,
                    error: ErrorReport::from(&e),
                }
            }
        })
        .collect();

    if outcomes.len() == 1 {
        print_json(&outcomes[0])?;
    } else {
        print_json(&outcomes)?;
    }
    if failed > 0 {
        bail!("{failed} of {} apply request(s) failed", outcomes.len());
    }
    Ok(())
}

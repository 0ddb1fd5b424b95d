use crate::Context;
use crate::cli::DiffArgs;
use crate::commands::{engine, print_json};
use crate::config::load_template;
use crate::ui;
use anyhow::Result;
use hostkit::{CancelToken, InstanceId};
use reconcile::DiffOptions;
use serde::Serialize;

pub fn inspect(ctx: &Context, instance: &str) -> Result<()> {
    let engine = engine(&ctx.config)?;
    let inspection = engine.inspect(&InstanceId::new(instance), &CancelToken::new())?;
    if !ctx.quiet {
        let state = &inspection.state;
        ui::header(instance);
        ui::dim(&format!(
            "{} packages, {} services, {} users, {} open ports",
            state.packages.len(),
            state.services.len(),
            state.users.len(),
            state.open_ports.len()
        ));
        for warning in &inspection.warnings {
            ui::warn(&format!("{}: {}", warning.probe, warning.message));
        }
    }
    print_json(&inspection)
}

pub fn diff(ctx: &Context, args: DiffArgs) -> Result<()> {
    let template = load_template(&args.template)?;
    let engine = engine(&ctx.config)?;
    let options = DiffOptions {
        force: args.force,
        package_manager_preference: args.package_manager,
    };
    let diff = engine.diff(
        &InstanceId::new(&args.instance),
        &template,
        &options,
        &CancelToken::new(),
    )?;
    if !ctx.quiet {
        ui::header(&format!("{} ← {}", args.instance, template.name));
        ui::diff(&diff);
    }
    print_json(&diff)
}

#[derive(Serialize)]
struct LayersOutput<'a> {
    instance: &'a str,
    layers: Vec<reconcile::Layer>,
    #[serde(skip_serializing_if = "Option::is_none")]
    checkpoints: Option<Vec<reconcile::Checkpoint>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    state_unknown: Option<String>,
}

pub fn layers(ctx: &Context, instance: &str, checkpoints: bool) -> Result<()> {
    let engine = engine(&ctx.config)?;
    let id = InstanceId::new(instance);
    let output = LayersOutput {
        instance,
        layers: engine.layer_history(&id),
        checkpoints: checkpoints.then(|| engine.ledger().checkpoints(&id)),
        state_unknown: engine.ledger().state_unknown(&id),
    };
    if !ctx.quiet {
        ui::layers(instance, &output.layers);
        if let Some(reason) = &output.state_unknown {
            ui::error(&format!("state unknown, manual intervention required: {reason}"));
        }
    }
    print_json(&output)
}

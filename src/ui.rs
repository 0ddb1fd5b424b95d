//! Human-readable summaries on stderr. Structured results go to stdout.

use colored::Colorize;
use reconcile::{
    ApplyResult, Conflict, Layer, LayerOutcome, LayerStatus, RollbackReport, RollbackStatus,
    StateDiff,
};

/// Print a success message
pub fn success(msg: &str) {
    eprintln!("{} {}", "✓".green(), msg);
}

/// Print a warning message
pub fn warn(msg: &str) {
    eprintln!("{} {}", "⚠".yellow(), msg);
}

/// Print an error message
pub fn error(msg: &str) {
    eprintln!("{} {}", "✗".red(), msg);
}

/// Print a dim/muted message
pub fn dim(msg: &str) {
    eprintln!("  {}", msg.dimmed());
}

/// Print a header/title
pub fn header(title: &str) {
    eprintln!();
    eprintln!("{}", title.bold());
    eprintln!("{}", "─".repeat(title.chars().count()).dimmed());
}

/// Print the lines of a diff, `+` for additions and `-` for removals.
pub fn diff(diff: &StateDiff) {
    for line in diff_lines(diff) {
        match line.chars().next() {
            Some('+') => eprintln!("  {}", line.green()),
            Some('-') => eprintln!("  {}", line.red()),
            Some('~') => eprintln!("  {}", line.yellow()),
            _ => eprintln!("  {line}"),
        }
    }
    for conflict in &diff.conflicts {
        conflict_line(conflict);
    }
    dim(&diff.summary());
}

fn conflict_line(conflict: &Conflict) {
    if conflict.is_blocking() {
        error(&conflict.to_string());
    } else {
        warn(&conflict.to_string());
    }
}

fn diff_lines(diff: &StateDiff) -> Vec<String> {
    let mut lines = Vec::new();
    for user in &diff.users_to_create {
        lines.push(format!("+ user {}", user.name));
    }
    for change in &diff.users_to_modify {
        lines.push(format!("~ user {}", change.desired.name));
    }
    for name in &diff.users_to_delete {
        lines.push(format!("- user {name}"));
    }
    for p in &diff.packages_to_install {
        let constraint = p.constraint.as_deref().unwrap_or("");
        lines.push(format!("+ {} {}{constraint}", p.manager, p.name));
    }
    for p in diff.packages_to_upgrade.iter().chain(&diff.packages_to_downgrade) {
        lines.push(format!(
            "~ {} {} {} -> {}",
            p.manager,
            p.name,
            p.installed.as_deref().unwrap_or("?"),
            p.constraint.as_deref().unwrap_or("latest")
        ));
    }
    for p in &diff.packages_to_remove {
        lines.push(format!("- {} {}", p.manager, p.name));
    }
    for svc in &diff.services_to_configure {
        lines.push(format!("+ service {}", svc.name));
    }
    for name in &diff.services_to_remove {
        lines.push(format!("- service {name}"));
    }
    for port in &diff.ports_to_open {
        lines.push(format!("  port {port} to open"));
    }
    lines
}

pub fn apply_result(result: &ApplyResult) {
    header(&format!("{} ← {}", result.instance_id, result.template_name));
    diff(&result.diff);
    for warning in &result.warnings {
        warn(warning);
    }
    match (&result.plan, result.outcome) {
        (None, _) => dim("dry run: nothing changed"),
        (Some(_), LayerOutcome::Completed) => success(&format!(
            "applied {} step(s), checkpoint {}",
            result.execution_results.len(),
            result.checkpoint_id.as_deref().unwrap_or("-")
        )),
        (Some(_), _) => warn(&format!(
            "applied with warnings, checkpoint {}",
            result.checkpoint_id.as_deref().unwrap_or("-")
        )),
    }
}

pub fn rollback_report(report: &RollbackReport) {
    header(&format!("rollback to {}", report.checkpoint_id));
    for error_line in &report.errors {
        warn(error_line);
    }
    for discrepancy in &report.discrepancies {
        warn(discrepancy);
    }
    match report.status {
        RollbackStatus::Restored => success(&format!("restored ({} steps)", report.plan.len())),
        RollbackStatus::RestoredWithWarnings => {
            warn("restored with discrepancies; the instance differs from the checkpoint");
        }
    }
}

pub fn layers(instance: &str, layers: &[Layer]) {
    header(&format!("{instance}: {} layer(s)", layers.len()));
    for layer in layers {
        let status = match (layer.status, layer.outcome) {
            (LayerStatus::RolledBack, _) => "rolled back".yellow(),
            (_, LayerOutcome::Completed) => "completed".green(),
            (_, LayerOutcome::CompletedWithWarnings) => "completed with warnings".yellow(),
            (_, LayerOutcome::Failed) => "failed".red(),
            (_, LayerOutcome::Refused) => "refused".red(),
        };
        eprintln!(
            "  {} {}@{} {} {}",
            layer.applied_at.format("%Y-%m-%d %H:%M:%S"),
            layer.template_name.bold(),
            layer.template_version,
            status,
            layer.checkpoint_id.as_deref().unwrap_or("").dimmed()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reconcile::{ManagerKind, PackageChange, UserConfig};

    #[test]
    fn test_diff_lines() {
        let diff = StateDiff {
            users_to_create: vec![UserConfig {
                name: "jupyter".into(),
                groups: vec![],
                shell: None,
            }],
            packages_to_install: vec![PackageChange {
                manager: ManagerKind::Conda,
                name: "numpy".into(),
                installed: None,
                constraint: Some("==1.24.4".into()),
            }],
            packages_to_upgrade: vec![PackageChange {
                manager: ManagerKind::Pip,
                name: "pandas".into(),
                installed: Some("2.1.4".into()),
                constraint: None,
            }],
            services_to_remove: vec!["notebook".into()],
            ..Default::default()
        };
        assert_eq!(
            diff_lines(&diff),
            vec![
                "+ user jupyter",
                "+ conda numpy==1.24.4",
                "~ pip pandas 2.1.4 -> latest",
                "- service notebook",
            ]
        );
    }
}

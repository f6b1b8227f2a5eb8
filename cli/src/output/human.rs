//! Human-readable terminal renderer.

use keel_common::{
    Action, ApprovalDecision, ChangeSet, Readiness, RunReport, StateSnapshot, VerificationResult,
};
use owo_colors::OwoColorize as _;

use crate::application::services::status::{LockStatus, TargetStatus};
use crate::domain::config::KeelConfig;
use crate::output::OutputContext;

/// Renders domain types as human-readable terminal output using `OutputContext`.
pub struct HumanRenderer<'a> {
    ctx: &'a OutputContext,
}

impl<'a> HumanRenderer<'a> {
    /// Create a new `HumanRenderer` wrapping the given output context.
    #[must_use]
    pub fn new(ctx: &'a OutputContext) -> Self {
        Self { ctx }
    }

    /// Render the CLI version information.
    pub fn render_version(&self, version: &str) {
        if self.ctx.quiet {
            return;
        }
        self.ctx.info(&format!("keel v{version}"));
    }

    /// Render the outcome of a run. Failures are printed even when quiet.
    pub fn render_report(&self, report: &RunReport) {
        if let Some(failure) = &report.failure {
            self.ctx.error(&format!(
                "run {} failed during {} [{}]: {}",
                report.run_id, failure.stage, failure.code, failure.message
            ));
        }
        if self.ctx.quiet {
            return;
        }

        println!();
        println!(
            "  {} {} {}",
            format!("{} {}", report.kind.as_str(), report.target_key).style(self.ctx.styles.header),
            report.run_id.style(self.ctx.styles.dim),
            report
                .final_state
                .as_str()
                .style(self.ctx.styles.stage(report.final_state)),
        );
        println!();

        if let Some(changes) = &report.change_set {
            self.render_changes(changes);
        }
        if let Some(snapshot) = &report.snapshot {
            self.ctx.kv("Generation:", &snapshot_line(snapshot));
        }
        if let Some(endpoint) = &report.endpoint {
            let readiness = match endpoint.readiness {
                Readiness::Unknown => "unknown",
                Readiness::Pending => "pending",
                Readiness::Ready => "ready",
                Readiness::Failed => "not ready",
            };
            self.ctx
                .kv("Endpoint:", &format!("{} ({readiness})", endpoint.address));
        }
        if let Some(verification) = &report.verification {
            self.render_verification(verification);
        }
        if !report.lock_released {
            self.ctx.warn(&format!(
                "lock on {} was not released; it expires on its own or use: keel unlock {}",
                report.target_key, report.target_key
            ));
        }
        println!();
    }

    fn render_changes(&self, changes: &ChangeSet) {
        println!("  {}", "Changes:".style(self.ctx.styles.bold));
        if changes.is_empty() {
            println!("    {}", "no changes".style(self.ctx.styles.dim));
        }
        for op in &changes.operations {
            let marker = match op.action {
                Action::Create => "+",
                Action::Update => "~",
                Action::Destroy => "-",
                Action::Noop => "=",
            };
            println!(
                "    {} {:<16} {}",
                marker.style(self.ctx.styles.action(op.action)),
                op.resource_kind.as_str(),
                op.action.as_str().style(self.ctx.styles.action(op.action)),
            );
        }
        println!();
    }

    fn render_verification(&self, verification: &VerificationResult) {
        println!("  {}", "Verification:".style(self.ctx.styles.bold));
        for result in &verification.probes {
            let mark = if result.passed {
                "✓".style(self.ctx.styles.success).to_string()
            } else {
                "✗".style(self.ctx.styles.error).to_string()
            };
            let status = result
                .status
                .map_or_else(|| "---".to_string(), |s| s.to_string());
            println!(
                "    {mark} {:<5} {:<20} {status}  {}ms  ({} attempt{})",
                result.probe.method.as_str(),
                result.probe.path,
                result.latency_ms,
                result.attempts,
                if result.attempts == 1 { "" } else { "s" },
            );
            if let Some(error) = &result.error {
                println!("        {}", error.style(self.ctx.styles.dim));
            }
        }
    }

    /// Render stored state, lock and recent runs of a target.
    pub fn render_status(&self, status: &TargetStatus) {
        println!();
        println!(
            "  {}",
            format!("Target {}", status.target).style(self.ctx.styles.header)
        );
        println!();

        match &status.snapshot {
            Some(snapshot) => {
                self.ctx.kv("Generation:", &snapshot_line(snapshot));
                let resources = &snapshot.resources;
                if let Some(pair) = &resources.credential_pair {
                    self.ctx.kv("Key pair:", &pair.name);
                }
                if let Some(policy) = &resources.network_policy {
                    let ports: Vec<String> = policy
                        .ingress
                        .iter()
                        .map(|r| format!("{}/{} from {}", r.port, r.protocol.as_str(), r.source))
                        .collect();
                    self.ctx
                        .kv("Network:", &format!("{} [{}]", policy.id, ports.join(", ")));
                }
                if let Some(instance) = &resources.instance {
                    self.ctx.kv(
                        "Instance:",
                        &format!(
                            "{} {} {}",
                            instance.id,
                            instance.class,
                            instance.address.as_deref().unwrap_or("(no address)")
                        ),
                    );
                }
            }
            None => self.ctx.kv("Generation:", "(never applied)"),
        }

        match &status.lock {
            Some(lock) => self.ctx.kv("Lock:", &lock_line(lock)),
            None => self.ctx.kv("Lock:", "free"),
        }

        if !status.recent_runs.is_empty() {
            println!();
            println!("  {}", "Recent runs:".style(self.ctx.styles.bold));
            for run in &status.recent_runs {
                let code = run
                    .failure
                    .as_ref()
                    .map(|f| format!(" ({})", f.code))
                    .unwrap_or_default();
                println!(
                    "    {}  {:<8} {}{}  {}",
                    run.run_id,
                    run.kind.as_str(),
                    run.final_state
                        .as_str()
                        .style(self.ctx.styles.stage(run.final_state)),
                    code,
                    run.finished_at
                        .format("%Y-%m-%d %H:%M:%S UTC")
                        .style(self.ctx.styles.dim),
                );
            }
        }
        println!();
    }

    /// Render a recorded approval decision.
    pub fn render_decision(&self, decision: &ApprovalDecision) {
        self.ctx.success(&format!(
            "{} {} run {}",
            decision.actor,
            decision.verdict.as_str(),
            decision.run_id
        ));
    }

    /// Render the current keel configuration.
    pub fn render_config(&self, config: &KeelConfig, path: &std::path::Path) {
        println!();
        println!(
            "  {}",
            format!("Configuration ({})", path.display()).style(self.ctx.styles.header)
        );
        println!();
        for (key, value) in config.entries() {
            println!("  {:<32} {value}", format!("{key}:"));
        }
        println!();
        println!("  {}", "Environment:".style(self.ctx.styles.bold));
        for var in ["KEEL_CONFIG", "KEEL_STATE_DB", "KEEL_ACTOR", "NO_COLOR"] {
            println!(
                "    {:<18} {}",
                format!("{var}:"),
                std::env::var(var).unwrap_or_else(|_| "(not set)".to_string())
            );
        }
        println!();
    }
}

fn snapshot_line(snapshot: &StateSnapshot) -> String {
    let mut line = format!(
        "{} (written {})",
        snapshot.generation,
        snapshot.written_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    if snapshot.partial {
        line.push_str(" partial");
    }
    line
}

fn lock_line(lock: &LockStatus) -> String {
    let state = if lock.expired { "expired" } else { "held" };
    format!(
        "{state} by {} until {}",
        lock.lock.holder_id,
        lock.expires_at.format("%Y-%m-%d %H:%M:%S UTC")
    )
}

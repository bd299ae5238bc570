//! Confirmation gate between a Terraform plan and its apply.

use std::io::{BufRead, Write};
use tracing::{info, warn};

use crate::error::{ForgeError, Result};
use crate::planner::parse_plan;
use crate::runner::TerraformRunner;

use super::{OperationPhase, PhaseContext};

/// Asks the operator a question.
#[cfg_attr(test, mockall::automock)]
pub trait Prompter: Send + Sync {
    /// Shows `message` and returns the answer, without the line break.
    ///
    /// # Errors
    ///
    /// Returns an error if the answer cannot be read.
    fn ask(&self, message: &str) -> std::io::Result<String>;
}

/// Reads answers from standard input.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdinPrompter;

impl Prompter for StdinPrompter {
    fn ask(&self, message: &str) -> std::io::Result<String> {
        let mut stdout = std::io::stdout();
        write!(stdout, "{message} ")?;
        stdout.flush()?;

        let mut answer = String::new();
        std::io::stdin().lock().read_line(&mut answer)?;
        Ok(answer.trim_end_matches(['\r', '\n']).to_string())
    }
}

/// Asks for confirmation before destroying critical resources.
///
/// Nothing is asked when `deletions` is empty. Only the exact answer `yes`
/// proceeds.
///
/// # Errors
///
/// Returns `AbortedByUser` on any other answer.
pub fn confirm_critical_deletions(
    prompter: &dyn Prompter,
    phase: &str,
    deletions: &[String],
) -> Result<()> {
    if deletions.is_empty() {
        return Ok(());
    }

    warn!(
        "The {} plan destroys critical resources: {}",
        phase,
        deletions.join(", ")
    );
    let answer = prompter.ask(&format!(
        "The {phase} phase is about to delete {}. Type 'yes' to continue:",
        deletions.join(", ")
    ))?;

    if answer == "yes" {
        info!("Deletion of critical resources confirmed");
        Ok(())
    } else {
        Err(ForgeError::AbortedByUser {
            reason: format!("deletion of {} not confirmed", deletions.join(", ")),
        })
    }
}

/// Plans, gates critical deletions, applies the saved plan and records the
/// outputs.
///
/// In dry-run mode only the plan runs.
///
/// # Errors
///
/// Returns an error if a Terraform command fails or the operator refuses the
/// deletion of critical resources.
pub async fn plan_gate_apply(
    terraform: &TerraformRunner,
    op: &OperationPhase,
    ctx: &PhaseContext,
    prompter: &dyn Prompter,
) -> Result<()> {
    let plan = terraform.plan(&op.plan_file()).await?;
    tokio::fs::write(op.plan.join("plan.txt"), &plan).await?;

    let summary = parse_plan(&plan);
    info!(
        "{} plan: {} to add, {} to change, {} to destroy",
        op.phase,
        summary.add.len(),
        summary.change.len(),
        summary.destroy.len()
    );
    let critical = summary.critical_deletions(ctx.critical_resources(op.phase));

    if ctx.dry_run {
        if !critical.is_empty() {
            warn!(
                "Dry run: the plan would delete critical resources: {}",
                critical.join(", ")
            );
        }
        return Ok(());
    }

    confirm_critical_deletions(prompter, op.phase.key(), &critical)?;
    terraform.apply(&op.plan_file()).await?;
    terraform.output(&op.output_file()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deletions() -> Vec<String> {
        vec![String::from("aws_vpc")]
    }

    #[test]
    fn test_no_deletions_asks_nothing() {
        let mut prompter = MockPrompter::new();
        prompter.expect_ask().never();
        assert!(confirm_critical_deletions(&prompter, "infrastructure", &[]).is_ok());
    }

    #[test]
    fn test_yes_proceeds() {
        let mut prompter = MockPrompter::new();
        prompter
            .expect_ask()
            .times(1)
            .returning(|_| Ok(String::from("yes")));
        assert!(confirm_critical_deletions(&prompter, "infrastructure", &deletions()).is_ok());
    }

    #[test]
    fn test_anything_else_aborts() {
        for answer in ["no", "YES", "y", " yes", ""] {
            let mut prompter = MockPrompter::new();
            prompter
                .expect_ask()
                .times(1)
                .returning(move |_| Ok(answer.to_string()));
            let err = confirm_critical_deletions(&prompter, "kubernetes", &deletions())
                .expect_err("must abort");
            assert!(err.is_aborted_by_user(), "answer {answer:?}");
        }
    }

    #[test]
    fn test_prompt_names_resources() {
        let mut prompter = MockPrompter::new();
        prompter
            .expect_ask()
            .withf(|message| message.contains("aws_vpc") && message.contains("infrastructure"))
            .returning(|_| Ok(String::from("yes")));
        assert!(confirm_critical_deletions(&prompter, "infrastructure", &deletions()).is_ok());
    }
}

//! Terminal output: a spinner that follows a job, and coloured results.

use std::time::Duration;

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::state_machine::{Job, State};

/// Follows one job in the terminal.
///
/// Shows a spinner with the current state while stages run, then a green,
/// yellow or red line depending on where the job settled.
pub struct JobProgress {
    pb: ProgressBar,
    green: Style,
    red: Style,
    yellow: Style,
}

impl JobProgress {
    pub fn start(description: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
            pb.set_style(style);
        }
        pb.set_message(format!("STARTING: {description}"));
        pb.enable_steady_tick(Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
        }
    }

    pub fn update_state(&self, state: State) {
        self.pb.set_message(format!("{state}"));
    }

    /// Clears the spinner and prints the job's outcome.
    pub fn complete(&self, job: &Job) {
        self.pb.finish_and_clear();
        match job.state {
            State::Done => {
                println!("  {} Job {} completed", self.green.apply_to("✓"), job.id);
                if let Some(url) = &job.accumulated.pull_request_url {
                    println!("  Pull request: {url}");
                }
            }
            State::Error => {
                let kind = job
                    .failure_kind
                    .map(|k| k.to_string())
                    .unwrap_or_else(|| "Error".into());
                println!(
                    "  {} Job {} failed ({kind}): {}",
                    self.red.apply_to("✗"),
                    job.id,
                    job.error_message.as_deref().unwrap_or("no message recorded")
                );
            }
            State::AwaitingApproval => {
                println!(
                    "  {} Job {} is waiting for approval: patchwright apply {}",
                    self.yellow.apply_to("⏸"),
                    job.id,
                    job.id
                );
                if let Some(review) = &job.accumulated.review_feedback {
                    for warning in &review.warnings {
                        println!("    {} {warning}", self.yellow.apply_to("!"));
                    }
                    for issue in &review.issues {
                        println!("    {} {}", self.red.apply_to("✗"), issue.message);
                    }
                }
            }
            state => println!("  {} Job {} is in {state}", self.yellow.apply_to("…"), job.id),
        }
    }
}

/// Prints the full job record as pretty JSON, its header coloured by state.
pub fn print_job(job: &Job) {
    let style = match job.state {
        State::Done => Style::new().green(),
        State::Error => Style::new().red(),
        _ => Style::new().yellow(),
    };
    println!("{}", style.apply_to(format!("─── Job {} ───", job.id)));
    println!("{}", serde_json::to_string_pretty(job).unwrap_or_default());
}

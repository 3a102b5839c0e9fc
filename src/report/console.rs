//! Terminal progress and summary output.

use std::sync::Mutex;

use indicatif::{ProgressBar, ProgressStyle};

use super::{Reporter, RunInfo};
use crate::result::{RunResult, TestResult, TestStatus};

/// Console reporter that shows progress in the terminal.
pub struct ConsoleReporter {
    progress: Mutex<Option<ProgressBar>>,
    verbose: bool,
}

impl ConsoleReporter {
    /// Create a new console reporter.
    pub fn new(verbose: bool) -> Self {
        Self {
            progress: Mutex::new(None),
            verbose,
        }
    }

    fn println(&self, line: String) {
        match self.progress.lock().ok().as_deref().and_then(Option::as_ref) {
            Some(pb) => pb.println(line),
            None => println!("{line}"),
        }
    }
}

fn styled_status(result: &TestResult) -> console::StyledObject<String> {
    let label = format!("{:<7}", result.status.to_string());
    match result.status {
        TestStatus::Passed => console::style(label).green(),
        TestStatus::Failed => console::style(label).red(),
        TestStatus::Skipped => console::style(label).yellow(),
        TestStatus::NotRun => console::style(label).red().bold(),
    }
}

impl Reporter for ConsoleReporter {
    fn on_run_start(&self, info: &RunInfo) {
        println!(
            "Running {} test(s) ({} execution(s)) on {} thread(s), run {}",
            info.tests,
            info.total_executions(),
            info.threads,
            info.run_id
        );

        let pb = ProgressBar::new(info.total_executions() as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
        {
            pb.set_style(style.progress_chars("#>-"));
        }

        if let Ok(mut progress) = self.progress.lock() {
            *progress = Some(pb);
        }
    }

    fn on_test_start(&self, test: &str, _iteration: usize, _permutation: usize) {
        if self.verbose {
            self.println(format!("Running: {test}"));
        }
    }

    fn on_test_end(&self, result: &TestResult) {
        if let Ok(progress) = self.progress.lock() {
            if let Some(pb) = progress.as_ref() {
                pb.inc(1);
            }
        }

        if self.verbose || result.status != TestStatus::Passed {
            let mut line = format!("{} {}", styled_status(result), result.name);
            if let Some(detail) = result.detail {
                line.push_str(&format!(" ({detail})"));
            }
            if let Some(summary) = result.error_summary() {
                line.push_str(&format!("\n    {}", console::style(summary).dim()));
            }
            self.println(line);
        }
    }

    fn on_run_end(&self, result: &RunResult) {
        if let Ok(mut progress) = self.progress.lock() {
            if let Some(pb) = progress.take() {
                pb.finish_and_clear();
            }
        }
        print_summary(result);
    }
}

/// Prints a summary of test results to the console.
pub fn print_summary(result: &RunResult) {
    println!();
    println!("Test Results:");
    println!("  Total:   {}", result.total());
    println!("  Passed:  {}", console::style(result.passed()).green());
    println!("  Failed:  {}", console::style(result.failed()).red());
    println!("  Skipped: {}", console::style(result.skipped()).yellow());

    if result.not_run() > 0 {
        println!("  Not Run: {}", console::style(result.not_run()).red().bold());
    }

    println!("  Duration: {:?}", result.duration);

    println!();
    if result.interrupted {
        println!("{}", console::style("Run interrupted.").yellow().bold());
    } else if result.success() {
        println!("{}", console::style("All tests passed!").green().bold());
    } else {
        println!("{}", console::style("Some tests did not pass.").red().bold());
        println!();
        for r in result.all_results() {
            if matches!(r.status, TestStatus::Failed | TestStatus::NotRun) {
                println!(
                    "  - {} [{}] (iteration {}, permutation {})",
                    r.name,
                    r.status_label(),
                    r.iteration,
                    r.permutation
                );
                if let Some(msg) = r.error_summary() {
                    println!("    {}", console::style(msg).dim());
                }
                if let Some(dir) = &r.output_dir {
                    println!("    {}", console::style(dir.display()).dim());
                }
            }
        }
    }
}

use std::io::{self, Write};

use serde::Serialize;

use crate::app::{BatchReport, ProgressEvent, ProgressSink, RunStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Human,
    Json,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_report(report: &BatchReport) -> io::Result<()> {
        Self::print_json(report)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

/// Progress and the final summary go to stderr; stdout may carry reads.
pub struct HumanOutput;

impl HumanOutput {
    pub fn print_summary(report: &BatchReport) {
        let green = "\x1b[32m";
        let yellow = "\x1b[33m";
        let red = "\x1b[31m";
        let reset = "\x1b[0m";

        let failed = report.failures().count();
        eprintln!(
            "{green}runs completed: {}{reset}",
            report.runs.len() - failed
        );
        if failed > 0 {
            eprintln!("{red}runs failed: {failed}{reset}");
        }
        for run in &report.runs {
            let color = match run.status {
                RunStatus::Failed => red,
                RunStatus::Skipped => yellow,
                RunStatus::Downloaded | RunStatus::Extracted => green,
            };
            let method = run
                .method
                .map(|method| format!(" via {method}"))
                .unwrap_or_default();
            eprintln!("{color}{} {:?}{method}{reset}", run.run, run.status);
            for path in &run.outputs {
                eprintln!("{color}   {path}{reset}");
            }
            if let Some(error) = &run.error {
                eprintln!("{color}   {error}{reset}");
            }
        }
    }
}

impl ProgressSink for HumanOutput {
    fn event(&self, event: ProgressEvent) {
        match event.elapsed {
            Some(elapsed) => tracing::info!("{} in {:.1}s", event.message, elapsed.as_secs_f64()),
            None => tracing::info!("{}", event.message),
        }
    }
}

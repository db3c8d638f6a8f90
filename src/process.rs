//! Invocation of the external transfer and extraction binaries.

use std::io;
use std::os::fd::AsFd;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};

use serde::{Deserialize, Serialize};

/// Program path for every external tool. Bare names are looked up on `PATH`
/// by the OS when spawned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolPaths {
    pub prefetch: PathBuf,
    pub aws: PathBuf,
    pub gsutil: PathBuf,
    pub gcloud: PathBuf,
    pub curl: PathBuf,
    pub aria2c: PathBuf,
    pub ascp: PathBuf,
    pub fasterq_dump: PathBuf,
    pub sracat: PathBuf,
    pub pigz: PathBuf,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            prefetch: PathBuf::from("prefetch"),
            aws: PathBuf::from("aws"),
            gsutil: PathBuf::from("gsutil"),
            gcloud: PathBuf::from("gcloud"),
            curl: PathBuf::from("curl"),
            aria2c: PathBuf::from("aria2c"),
            ascp: PathBuf::from("ascp"),
            fasterq_dump: PathBuf::from("fasterq-dump"),
            sracat: PathBuf::from("sracat"),
            pigz: PathBuf::from("pigz"),
        }
    }
}

/// Command line of `cmd` for log messages.
pub fn describe(cmd: &Command) -> String {
    let mut parts = vec![cmd.get_program().to_string_lossy().to_string()];
    parts.extend(cmd.get_args().map(|arg| arg.to_string_lossy().to_string()));
    parts.join(" ")
}

/// Run to completion with stdout and stderr captured. Returns stdout; on a
/// non-zero exit the error is the trimmed stderr.
pub fn run_captured(cmd: &mut Command) -> Result<String, String> {
    tracing::debug!("running command {}", describe(cmd));
    let output = cmd
        .stdin(Stdio::null())
        .output()
        .map_err(|err| spawn_message(cmd, &err))?;
    if output.status.success() {
        return Ok(String::from_utf8_lossy(&output.stdout).to_string());
    }
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    Err(if stderr.is_empty() {
        format!("command failed ({}): {}", output.status, describe(cmd))
    } else {
        stderr
    })
}

/// Run to completion with the tool's own progress output visible on our
/// stderr. Tool stdout is sent to stderr too, keeping stdout free for data.
pub fn run_visible(cmd: &mut Command) -> Result<(), String> {
    tracing::debug!("running command {}", describe(cmd));
    let stdout = stderr_as_stdio().map_err(|err| err.to_string())?;
    let status = cmd
        .stdin(Stdio::null())
        .stdout(stdout)
        .stderr(Stdio::inherit())
        .status()
        .map_err(|err| spawn_message(cmd, &err))?;
    check_status(cmd, status)
}

pub fn spawn(cmd: &mut Command) -> Result<Child, String> {
    tracing::debug!("spawning command {}", describe(cmd));
    cmd.spawn().map_err(|err| spawn_message(cmd, &err))
}

pub fn wait(cmd_line: &str, child: &mut Child) -> Result<(), String> {
    let status = child
        .wait()
        .map_err(|err| format!("waiting for {cmd_line}: {err}"))?;
    if status.success() {
        Ok(())
    } else {
        Err(format!("command {cmd_line} returned with non-zero exit status {status}"))
    }
}

pub fn check_status(cmd: &Command, status: ExitStatus) -> Result<(), String> {
    if status.success() {
        Ok(())
    } else {
        Err(format!("command failed ({status}): {}", describe(cmd)))
    }
}

fn stderr_as_stdio() -> io::Result<Stdio> {
    let fd = io::stderr().as_fd().try_clone_to_owned()?;
    Ok(Stdio::from(fd))
}

fn spawn_message(cmd: &Command, err: &io::Error) -> String {
    if err.kind() == io::ErrorKind::NotFound {
        format!(
            "required tool not found: {}",
            cmd.get_program().to_string_lossy()
        )
    } else {
        format!("failed to start {}: {err}", describe(cmd))
    }
}

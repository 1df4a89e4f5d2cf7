use orca_core::OrcaResult;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use tokio::process::Command;
use tracing::debug;

/// Run `program` with `args` and wait for it to exit.
///
/// Output is discarded. Only a failure to start the process is an error; a
/// non-zero exit is returned to the caller to judge.
pub async fn run_to_completion(
    program: &str,
    args: &[String],
    cwd: Option<&Path>,
) -> OrcaResult<ExitStatus> {
    debug!(program, ?args, "running to completion");
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    let status = cmd.status().await?;
    debug!(program, code = ?status.code(), "process exited");
    Ok(status)
}

/// Build the argument list that runs `command` inside `working_dir` on `host`
/// through `shell` (e.g. `ssh`).
///
/// Returns `(program, args)`.
pub fn remote_command(
    shell: &str,
    host: &str,
    working_dir: &Path,
    command: &[String],
) -> (String, Vec<String>) {
    let quoted: Vec<String> = command.iter().map(|a| shell_quote(a)).collect();
    let script = format!(
        "cd {} && {}",
        shell_quote(&working_dir.to_string_lossy()),
        quoted.join(" ")
    );
    (shell.to_string(), vec![host.to_string(), script])
}

/// Quote `arg` for a POSIX shell, leaving plain words untouched.
pub fn shell_quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./=:,+@%".contains(c));
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

use std::{collections::HashSet, process::Stdio, time::Duration};

use tokio::{process::Command, time::timeout};
use tracing::{debug, info};

use crate::error::ProbeError;

/// External tools the prober may launch.
pub const ALLOWED_COMMANDS: &[&str] = &["smbclient"];

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Runs an allow-listed command with stdin closed, so credential prompts
/// cannot block, and kills it once `timeout_secs` elapses.
pub async fn run_allowlisted(
    cmd: &str,
    args: &[String],
    allowed: &[&str],
    timeout_secs: u64,
) -> Result<CommandOutput, ProbeError> {
    let allowed_set: HashSet<&str> = allowed.iter().copied().collect();
    if !allowed_set.contains(cmd) {
        return Err(ProbeError::NotAllowed(cmd.to_string()));
    }

    info!(command = cmd, args = ?redacted_args(args), "audit: launching external tool");
    let child = Command::new(cmd)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| ProbeError::Spawn {
            command: cmd.to_string(),
            source,
        })?;

    let out = timeout(Duration::from_secs(timeout_secs), child.wait_with_output())
        .await
        .map_err(|_| ProbeError::Timeout(timeout_secs))?
        .map_err(|source| ProbeError::Spawn {
            command: cmd.to_string(),
            source,
        })?;

    debug!(command = cmd, status = ?out.status.code(), "external tool finished");
    Ok(CommandOutput {
        success: out.status.success(),
        stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
    })
}

/// Copy of `args` safe for logs: the password half of a `--user name%password`
/// value is masked.
pub fn redacted_args(args: &[String]) -> Vec<String> {
    let mut out = Vec::with_capacity(args.len());
    let mut mask_next = false;
    for arg in args {
        if mask_next {
            let user = arg.split_once('%').map_or(arg.as_str(), |(user, _)| user);
            out.push(format!("{user}%***"));
            mask_next = false;
            continue;
        }
        if let Some(value) = arg.strip_prefix("--user=") {
            let user = value.split_once('%').map_or(value, |(user, _)| user);
            out.push(format!("--user={user}%***"));
            continue;
        }
        mask_next = arg == "--user" || arg == "-U";
        out.push(arg.clone());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn commands_outside_the_allow_list_are_refused() {
        let err = run_allowlisted("rm", &["-rf".into(), "/tmp/x".into()], ALLOWED_COMMANDS, 5)
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::NotAllowed(cmd) if cmd == "rm"));
    }

    #[test]
    fn audit_args_hide_passwords() {
        let args: Vec<String> = ["//192.0.2.1/public", "--user", "guest%s3cret", "-c", "ls"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let shown = redacted_args(&args);
        assert_eq!(shown, vec!["//192.0.2.1/public", "--user", "guest%***", "-c", "ls"]);
        assert!(!format!("{shown:?}").contains("s3cret"));

        let short = redacted_args(&["-U".to_string(), "admin".to_string()]);
        assert_eq!(short, vec!["-U", "admin%***"]);
        let inline = redacted_args(&["--user=guest%guest".to_string(), "-N".to_string()]);
        assert_eq!(inline, vec!["--user=guest%***", "-N"]);
    }
}

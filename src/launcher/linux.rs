//! Linux VPN launcher: `nmcli con up <connection_id> passwd-file /dev/fd/0`.

use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::CardError;

pub async fn connect(connection_id: &str, code: &str) -> Result<(), CardError> {
    let mut child = Command::new("nmcli")
        .args(["con", "up", connection_id, "passwd-file", "/dev/fd/0"])
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| CardError::LauncherFailure(format!("failed to spawn nmcli: {e}")))?;

    let mut stdin = child
        .stdin
        .take()
        .expect("stdin was requested as piped");
    let secret = format!("vpn.secrets.password:{code}\n");
    stdin
        .write_all(secret.as_bytes())
        .await
        .map_err(|e| CardError::LauncherFailure(format!("failed to write nmcli secret: {e}")))?;
    drop(stdin);

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| CardError::LauncherFailure(format!("nmcli wait failed: {e}")))?;

    if !output.stderr.is_empty() {
        return Err(CardError::LauncherFailure(
            String::from_utf8_lossy(&output.stderr).into_owned(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// `nmcli` is not available in the test sandbox; this asserts the
    /// adapter surfaces a `LauncherFailure` rather than panicking when
    /// the binary can't be spawned.
    #[tokio::test]
    async fn connect_reports_launcher_failure_when_binary_missing() {
        let result = connect_with_binary("definitely-not-a-real-binary", "conn", "123456").await;
        assert!(matches!(result, Err(CardError::LauncherFailure(_))));
    }

    async fn connect_with_binary(
        binary: &str,
        connection_id: &str,
        code: &str,
    ) -> Result<(), CardError> {
        let mut child = Command::new(binary)
            .args(["con", "up", connection_id, "passwd-file", "/dev/fd/0"])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| CardError::LauncherFailure(format!("failed to spawn {binary}: {e}")))?;

        let mut stdin = child.stdin.take().expect("stdin was requested as piped");
        stdin
            .write_all(format!("vpn.secrets.password:{code}\n").as_bytes())
            .await
            .ok();
        drop(stdin);
        child
            .wait_with_output()
            .await
            .map_err(|e| CardError::LauncherFailure(format!("wait failed: {e}")))?;
        Ok(())
    }
}

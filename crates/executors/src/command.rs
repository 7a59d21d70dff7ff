use std::time::Duration;

use command_group::AsyncGroupChild;

const GRACEFUL_EXIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Interrupt the whole process group, then force-kill it if it has not exited
/// within a short grace period.
pub async fn kill_process_group(child: &mut AsyncGroupChild) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use nix::{sys::signal::Signal, unistd::Pid};

        if let Some(pid) = child.id() {
            let pgid = Pid::from_raw(pid as i32);
            if let Err(err) = nix::sys::signal::killpg(pgid, Signal::SIGINT) {
                tracing::debug!("SIGINT to process group {pid} failed: {err}");
            } else if let Ok(Ok(_)) =
                tokio::time::timeout(GRACEFUL_EXIT_TIMEOUT, child.wait()).await
            {
                return Ok(());
            }
        }
    }

    match child.kill().await {
        Ok(()) => {}
        // Already reaped.
        Err(err) if err.kind() == std::io::ErrorKind::InvalidInput => return Ok(()),
        Err(err) => return Err(err),
    }
    child.wait().await.map(|_| ())
}

//! Best-effort cleanup of processes left listening on known ports.

use std::path::Path;
use std::thread;
use std::time::Duration;

use tracing::{debug, info};

use crate::io::process::CommandRunner;

const KILL_TIMEOUT: Duration = Duration::from_secs(10);

pub fn kill_command(port: u16) -> String {
    format!("fuser -k {port}/tcp || true")
}

/// Kill whatever holds each port, then wait `delay` for sockets to close.
///
/// Failures are ignored: a missing `fuser` or a free port are both fine.
pub fn cleanup_ports<R: CommandRunner>(runner: &R, root: &Path, ports: &[u16], delay: Duration) {
    if ports.is_empty() {
        return;
    }
    for &port in ports {
        let result = runner.run(&kill_command(port), root, KILL_TIMEOUT);
        debug!(port, exit_code = result.exit_code, "port cleanup");
    }
    info!(?ports, delay_ms = delay.as_millis() as u64, "cleaned up ports");
    thread::sleep(delay);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::RecordingRunner;

    #[test]
    fn kills_each_port_in_order() {
        let runner = RecordingRunner::succeeding();
        cleanup_ports(&runner, Path::new("/tmp"), &[8080, 3000], Duration::ZERO);
        assert_eq!(
            runner.commands(),
            vec!["fuser -k 8080/tcp || true", "fuser -k 3000/tcp || true"]
        );
    }

    #[test]
    fn no_ports_runs_nothing() {
        let runner = RecordingRunner::succeeding();
        cleanup_ports(&runner, Path::new("/tmp"), &[], Duration::from_secs(60));
        assert!(runner.calls().is_empty());
    }
}

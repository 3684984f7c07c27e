//! Launching and stopping the sidecar process.

use std::{
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use {
    switchboard_channels::{Error, Result},
    tokio::{
        io::{AsyncBufReadExt, AsyncRead, BufReader},
        process::{Child, Command},
    },
    tracing::{debug, error, info, warn},
};

const SIDECAR_DIR_ENV: &str = "SWITCHBOARD_SIDECAR_DIR";
const ENTRY_POINT: &str = "index.js";
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Handle to a running sidecar. The child is killed if the handle is dropped
/// without [`SidecarProcess::stop`].
pub struct SidecarProcess {
    child: Child,
    port: u16,
}

impl SidecarProcess {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// SIGTERM, then kill after a grace period.
    pub async fn stop(&mut self) {
        info!("stopping WhatsApp sidecar");

        #[cfg(unix)]
        if let Some(pid) = self.child.id() {
            use nix::{
                sys::signal::{Signal, kill},
                unistd::Pid,
            };
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }
        #[cfg(not(unix))]
        let _ = self.child.start_kill();

        match tokio::time::timeout(STOP_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => info!(?status, "WhatsApp sidecar exited"),
            Ok(Err(e)) => warn!(error = %e, "error waiting for sidecar"),
            Err(_) => {
                warn!("sidecar ignored SIGTERM, killing");
                let _ = self.child.kill().await;
            },
        }
    }
}

/// Where and how to start the sidecar.
#[derive(Debug, Clone)]
pub struct SidecarLaunch {
    /// Directory holding `package.json` and `index.js`.
    pub dir: PathBuf,
    pub port: u16,
}

fn has_package(dir: &Path) -> bool {
    dir.join("package.json").is_file()
}

/// Locate the sidecar directory: the explicit path, then
/// `SWITCHBOARD_SIDECAR_DIR`, then `sidecar/whatsapp-baileys` next to the
/// executable or under the working directory.
pub fn find_sidecar_dir(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(dir) = explicit {
        return if has_package(dir) {
            Ok(dir.to_path_buf())
        } else {
            Err(Error::unavailable(format!(
                "no package.json in configured sidecar dir {}",
                dir.display()
            )))
        };
    }

    let from_env = std::env::var_os(SIDECAR_DIR_ENV).map(PathBuf::from);
    let near_exe = std::env::current_exe().ok().and_then(|exe| {
        exe.parent()
            .map(|d| d.join("../sidecar/whatsapp-baileys"))
    });
    let candidates = from_env
        .into_iter()
        .chain(near_exe)
        .chain(
            ["sidecar/whatsapp-baileys", "../sidecar/whatsapp-baileys"]
                .into_iter()
                .map(PathBuf::from),
        );

    for dir in candidates {
        if has_package(&dir) {
            return Ok(dir.canonicalize().unwrap_or(dir));
        }
        debug!(path = %dir.display(), "no sidecar here");
    }

    Err(Error::unavailable(format!(
        "WhatsApp sidecar not found; set {SIDECAR_DIR_ENV} or whatsapp.sidecar_dir"
    )))
}

/// Install dependencies if needed and start `node index.js`.
pub async fn start_sidecar(launch: &SidecarLaunch) -> Result<SidecarProcess> {
    let dir = &launch.dir;
    if !dir.join("node_modules").is_dir() {
        info!(path = %dir.display(), "installing sidecar dependencies");
        let output = Command::new("npm")
            .arg("install")
            .arg("--omit=dev")
            .current_dir(dir)
            .output()
            .await?;
        if !output.status.success() {
            return Err(Error::unavailable(format!(
                "npm install failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
    }

    info!(path = %dir.display(), port = launch.port, "starting WhatsApp sidecar");
    let mut child = Command::new("node")
        .arg(ENTRY_POINT)
        .current_dir(dir)
        .env("SWITCHBOARD_SIDECAR_PORT", launch.port.to_string())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(forward_logs(stdout, false));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(forward_logs(stderr, true));
    }

    tokio::time::sleep(Duration::from_millis(500)).await;
    if let Some(status) = child.try_wait()? {
        return Err(Error::unavailable(format!(
            "sidecar exited immediately with {status}"
        )));
    }

    Ok(SidecarProcess {
        child,
        port: launch.port,
    })
}

/// Re-emit sidecar output through tracing. Pino JSON lines keep their level.
async fn forward_logs<R: AsyncRead + Unpin>(pipe: R, is_stderr: bool) {
    let mut lines = BufReader::new(pipe).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let parsed = line
            .starts_with('{')
            .then(|| serde_json::from_str::<serde_json::Value>(&line).ok())
            .flatten();
        let Some(log) = parsed else {
            if is_stderr {
                warn!(target: "whatsapp_sidecar", "{line}");
            } else {
                info!(target: "whatsapp_sidecar", "{line}");
            }
            continue;
        };
        let msg = log.get("msg").and_then(|v| v.as_str()).unwrap_or(&line);
        match log.get("level").and_then(|v| v.as_u64()).unwrap_or(30) {
            0..=20 => debug!(target: "whatsapp_sidecar", "{msg}"),
            21..=30 => info!(target: "whatsapp_sidecar", "{msg}"),
            31..=40 => warn!(target: "whatsapp_sidecar", "{msg}"),
            _ => error!(target: "whatsapp_sidecar", "{msg}"),
        }
    }
}

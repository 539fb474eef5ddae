//! Adapter over the opaque generation process.
//!
//! The collaborator is modelled strictly as start / stream logs / await
//! exit / terminate. There is no control channel: the orchestrator only
//! reads what the process prints and what it leaves on disk.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use vwe_core::{PipelineConfig, SeedLayout, PIXEL_CENTER_RULE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// Bytes read from one output stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogChunk {
    pub stream: LogStream,
    pub bytes: Vec<u8>,
}

/// How the process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exit {
    /// `None` when terminated by a signal.
    pub code: Option<i32>,
}

impl From<ExitStatus> for Exit {
    fn from(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
        }
    }
}

/// Everything the collaborator is told at launch.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub world_name: String,
    pub seed: String,
    pub seed_hash: String,
    pub resolution: usize,
    pub world_radius: f64,
    pub raw_dir: PathBuf,
    pub export_dir: PathBuf,
    pub exports_enabled: bool,
    pub extra_env: BTreeMap<String, String>,
}

impl LaunchSpec {
    pub fn new(config: &PipelineConfig, seed: &str, resolution: usize, layout: &SeedLayout) -> Self {
        Self {
            program: config.collaborator.program.clone(),
            args: config.collaborator.args.clone(),
            working_dir: config.collaborator.working_dir.clone(),
            world_name: config.world.name.clone(),
            seed: seed.to_string(),
            seed_hash: layout.seed_hash().to_string(),
            resolution,
            world_radius: config.world.radius,
            raw_dir: layout.raw(),
            export_dir: layout.extracted(),
            exports_enabled: config.collaborator.exports_enabled,
            extra_env: config.collaborator.env.clone(),
        }
    }

    /// Launch environment. Configured extras cannot override the contract
    /// variables.
    pub fn environment(&self) -> BTreeMap<String, String> {
        let mut env = self.extra_env.clone();
        let contract = [
            ("WORLD_NAME", self.world_name.clone()),
            ("WORLD_SEED", self.seed.clone()),
            ("VWE_SEED_HASH", self.seed_hash.clone()),
            ("VWE_RESOLUTION", self.resolution.to_string()),
            ("VWE_WORLD_RADIUS", self.world_radius.to_string()),
            ("VWE_SAMPLE_RULE", PIXEL_CENTER_RULE.to_string()),
            ("VWE_RAW_DIR", self.raw_dir.display().to_string()),
            ("VWE_DATAEXPORT_DIR", self.export_dir.display().to_string()),
            ("VWE_DATAEXPORT_ENABLED", self.exports_enabled.to_string()),
        ];
        for (key, value) in contract {
            env.insert(key.to_string(), value);
        }
        env
    }
}

/// Starts collaborator processes.
#[async_trait]
pub trait GenerationCollaborator: Send + Sync {
    async fn start(&self, spec: &LaunchSpec) -> std::io::Result<Box<dyn CollaboratorProcess>>;
}

/// A running collaborator.
#[async_trait]
pub trait CollaboratorProcess: Send {
    /// Output produced since the last call. Never blocks.
    fn drain_logs(&mut self) -> Vec<LogChunk>;

    /// Exit status if the process has ended. Never blocks.
    fn try_exit(&mut self) -> std::io::Result<Option<Exit>>;

    /// Wait for the output streams to close and return what remains.
    async fn drain_to_end(&mut self) -> Vec<LogChunk>;

    async fn wait(&mut self) -> std::io::Result<Exit>;

    /// Ask the process to stop, force-killing it after `grace`.
    async fn terminate(&mut self, grace: Duration) -> std::io::Result<()>;
}

/// Spawns the configured program as an OS process.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessCollaborator;

#[async_trait]
impl GenerationCollaborator for ProcessCollaborator {
    async fn start(&self, spec: &LaunchSpec) -> std::io::Result<Box<dyn CollaboratorProcess>> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(spec.environment())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn()?;
        debug!(program = %spec.program, pid = ?child.id(), "collaborator started");

        let (tx, rx) = mpsc::unbounded_channel();
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, LogStream::Stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, LogStream::Stderr, tx));
        }

        Ok(Box::new(OsProcess { child, rx, readers }))
    }
}

fn spawn_reader<R>(mut reader: R, stream: LogStream, tx: mpsc::UnboundedSender<LogChunk>) -> JoinHandle<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; 8192];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let chunk = LogChunk {
                        stream,
                        bytes: buf[..n].to_vec(),
                    };
                    if tx.send(chunk).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(error = %e, ?stream, "collaborator log read failed");
                    break;
                }
            }
        }
    })
}

struct OsProcess {
    child: Child,
    rx: mpsc::UnboundedReceiver<LogChunk>,
    readers: Vec<JoinHandle<()>>,
}

impl OsProcess {
    /// SIGTERM first so the generator can flush its save.
    #[cfg(unix)]
    async fn request_stop(&mut self) {
        let Some(pid) = self.child.id() else {
            return;
        };
        let sent = Command::new("kill")
            .arg("-TERM")
            .arg(pid.to_string())
            .status()
            .await;
        if let Err(e) = sent {
            debug!(error = %e, "SIGTERM delivery failed");
        }
    }

    #[cfg(not(unix))]
    async fn request_stop(&mut self) {
        if let Err(e) = self.child.start_kill() {
            debug!(error = %e, "kill request failed");
        }
    }
}

/// Upper bound on waiting for output streams after exit; a grandchild
/// holding the pipe open must not stall the job.
const STREAM_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

#[async_trait]
impl CollaboratorProcess for OsProcess {
    fn drain_logs(&mut self) -> Vec<LogChunk> {
        let mut chunks = Vec::new();
        while let Ok(chunk) = self.rx.try_recv() {
            chunks.push(chunk);
        }
        chunks
    }

    fn try_exit(&mut self) -> std::io::Result<Option<Exit>> {
        Ok(self.child.try_wait()?.map(Exit::from))
    }

    async fn drain_to_end(&mut self) -> Vec<LogChunk> {
        for reader in self.readers.drain(..) {
            if tokio::time::timeout(STREAM_CLOSE_TIMEOUT, reader).await.is_err() {
                warn!("collaborator output stream did not close");
            }
        }
        self.drain_logs()
    }

    async fn wait(&mut self) -> std::io::Result<Exit> {
        Ok(self.child.wait().await?.into())
    }

    async fn terminate(&mut self, grace: Duration) -> std::io::Result<()> {
        if self.child.try_wait()?.is_some() {
            return Ok(());
        }
        self.request_stop().await;
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => {
                status?;
            }
            Err(_) => {
                warn!(grace_secs = grace.as_secs(), "collaborator ignored SIGTERM, killing");
                self.child.kill().await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(program: &str, args: &[&str]) -> LaunchSpec {
        let layout = SeedLayout::new(std::path::Path::new("/tmp/vwe-test"), "seed");
        let mut config = PipelineConfig::default();
        config.collaborator.program = program.to_string();
        config.collaborator.args = args.iter().map(|s| s.to_string()).collect();
        config
            .collaborator
            .env
            .insert("WORLD_SEED".to_string(), "override".to_string());
        config
            .collaborator
            .env
            .insert("EXTRA".to_string(), "1".to_string());
        LaunchSpec::new(&config, "seed", 128, &layout)
    }

    #[test]
    fn test_environment_contract() {
        let env = spec("true", &[]).environment();
        assert_eq!(env["WORLD_SEED"], "seed");
        assert_eq!(env["VWE_RESOLUTION"], "128");
        assert_eq!(env["VWE_SAMPLE_RULE"], "pixel_center");
        assert_eq!(env["VWE_DATAEXPORT_ENABLED"], "true");
        assert_eq!(env["EXTRA"], "1");
        assert!(env["VWE_DATAEXPORT_DIR"].ends_with("extracted"));
    }

    #[tokio::test]
    async fn test_process_output_and_exit() {
        let collaborator = ProcessCollaborator;
        let mut process = collaborator
            .start(&spec("sh", &["-c", "echo \"seed=$WORLD_SEED\"; echo oops >&2; exit 3"]))
            .await
            .unwrap();
        let exit = process.wait().await.unwrap();
        assert_eq!(exit.code, Some(3));

        let chunks = process.drain_to_end().await;
        let stdout: Vec<u8> = chunks
            .iter()
            .filter(|c| c.stream == LogStream::Stdout)
            .flat_map(|c| c.bytes.clone())
            .collect();
        assert_eq!(String::from_utf8_lossy(&stdout), "seed=seed\n");
        assert!(chunks.iter().any(|c| c.stream == LogStream::Stderr));
    }

    #[tokio::test]
    async fn test_terminate_stops_long_running_process() {
        let mut process = ProcessCollaborator
            .start(&spec("sleep", &["30"]))
            .await
            .unwrap();
        process.terminate(Duration::from_secs(2)).await.unwrap();
        assert!(process.try_exit().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_missing_program_fails_to_start() {
        let result = ProcessCollaborator
            .start(&spec("/nonexistent/vwe-generator", &[]))
            .await;
        assert!(result.is_err());
    }
}

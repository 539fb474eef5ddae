//! Scripted in-memory collaborator (testing only)
//!
//! `ScriptedCollaborator` replays a timeline of log output, file writes and
//! an optional exit against `tokio::time`, so tests can run on a paused
//! clock. It counts every `start` call.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::collaborator::{
    CollaboratorProcess, Exit, GenerationCollaborator, LaunchSpec, LogChunk, LogStream,
};

/// Where a scripted file lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileTarget {
    Raw,
    Export,
}

#[derive(Debug, Clone)]
enum Action {
    Log(LogStream, Vec<u8>),
    Write(FileTarget, String, Vec<u8>),
    Exit(i32),
}

#[derive(Debug, Clone)]
struct Step {
    after: Duration,
    action: Action,
}

/// Timeline replayed by every process the collaborator starts.
#[derive(Debug, Clone, Default)]
pub struct Script {
    steps: Vec<Step>,
    launch_failures: u32,
}

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(mut self, after_ms: u64, action: Action) -> Self {
        self.steps.push(Step {
            after: Duration::from_millis(after_ms),
            action,
        });
        self
    }

    /// Emit `text` on stdout `after_ms` after start.
    pub fn log(self, after_ms: u64, text: &str) -> Self {
        self.push(after_ms, Action::Log(LogStream::Stdout, text.as_bytes().to_vec()))
    }

    pub fn log_stderr(self, after_ms: u64, text: &str) -> Self {
        self.push(after_ms, Action::Log(LogStream::Stderr, text.as_bytes().to_vec()))
    }

    pub fn write(self, after_ms: u64, target: FileTarget, name: &str, contents: &[u8]) -> Self {
        self.push(
            after_ms,
            Action::Write(target, name.to_string(), contents.to_vec()),
        )
    }

    pub fn exit(self, after_ms: u64, code: i32) -> Self {
        self.push(after_ms, Action::Exit(code))
    }

    /// The first `n` starts fail.
    pub fn fail_launches(mut self, n: u32) -> Self {
        self.launch_failures = n;
        self
    }

    /// Generation marker, a valid `n`×`n` export, then the export marker.
    pub fn happy_path(n: usize) -> Self {
        let (biomes, heights) = export_dump(n);
        Script::new()
            .log(10, "Loading world\n")
            .write(20, FileTarget::Raw, "world.db", b"raw save state")
            .log(30, "12:00:01 Game server connected\n")
            .write(40, FileTarget::Export, "biomes.json", &biomes)
            .write(40, FileTarget::Export, "heightmap.json", &heights)
            .log(50, "VWE_DataExporter: ALL EXPORTS COMPLETE\n")
    }
}

/// `biomes.json` and `heightmap.json` for an `n`×`n` world split into an
/// Ocean half and a Meadows half.
pub fn export_dump(n: usize) -> (Vec<u8>, Vec<u8>) {
    let biome_map: Vec<Vec<u32>> = (0..n)
        .map(|_| (0..n).map(|x| if x < n / 2 { 32 } else { 1 }).collect())
        .collect();
    let height_map: Vec<Vec<f32>> = (0..n)
        .map(|z| (0..n).map(|x| (x * 10 + z) as f32).collect())
        .collect();
    let biomes = serde_json::json!({ "resolution": n, "biome_map": biome_map });
    let heights = serde_json::json!({ "resolution": n, "height_map": height_map });
    (
        serde_json::to_vec(&biomes).unwrap_or_default(),
        serde_json::to_vec(&heights).unwrap_or_default(),
    )
}

#[derive(Debug, Default)]
pub struct ScriptedCollaborator {
    script: Script,
    starts: AtomicU32,
    specs: Mutex<Vec<LaunchSpec>>,
}

impl ScriptedCollaborator {
    pub fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script,
            starts: AtomicU32::new(0),
            specs: Mutex::new(Vec::new()),
        })
    }

    /// Number of `start` calls, successful or not.
    pub fn starts(&self) -> u32 {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn launch_specs(&self) -> Vec<LaunchSpec> {
        self.specs.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl GenerationCollaborator for ScriptedCollaborator {
    async fn start(&self, spec: &LaunchSpec) -> std::io::Result<Box<dyn CollaboratorProcess>> {
        let n = self.starts.fetch_add(1, Ordering::SeqCst) + 1;
        if let Ok(mut specs) = self.specs.lock() {
            specs.push(spec.clone());
        }
        if n <= self.script.launch_failures {
            return Err(std::io::Error::other(format!("scripted launch failure {n}")));
        }
        let mut steps = self.script.steps.clone();
        steps.sort_by_key(|s| s.after);
        Ok(Box::new(ScriptedProcess {
            started: Instant::now(),
            steps,
            cursor: 0,
            raw_dir: spec.raw_dir.clone(),
            export_dir: spec.export_dir.clone(),
            buffered: Vec::new(),
            exit: None,
        }))
    }
}

struct ScriptedProcess {
    started: Instant,
    steps: Vec<Step>,
    cursor: usize,
    raw_dir: PathBuf,
    export_dir: PathBuf,
    buffered: Vec<LogChunk>,
    exit: Option<Exit>,
}

impl ScriptedProcess {
    /// Apply every step that is due by now.
    fn advance(&mut self) {
        let until = self.started.elapsed();
        while self.exit.is_none() && self.cursor < self.steps.len() {
            let step = &self.steps[self.cursor];
            if step.after > until {
                break;
            }
            match &step.action {
                Action::Log(stream, bytes) => self.buffered.push(LogChunk {
                    stream: *stream,
                    bytes: bytes.clone(),
                }),
                Action::Write(target, name, contents) => {
                    let dir = match target {
                        FileTarget::Raw => &self.raw_dir,
                        FileTarget::Export => &self.export_dir,
                    };
                    if let Err(e) = std::fs::write(dir.join(name), contents) {
                        tracing::warn!(error = %e, file = %name, "scripted write failed");
                    }
                }
                Action::Exit(code) => self.exit = Some(Exit { code: Some(*code) }),
            }
            self.cursor += 1;
        }
    }
}

#[async_trait]
impl CollaboratorProcess for ScriptedProcess {
    fn drain_logs(&mut self) -> Vec<LogChunk> {
        self.advance();
        std::mem::take(&mut self.buffered)
    }

    fn try_exit(&mut self) -> std::io::Result<Option<Exit>> {
        Ok(self.exit)
    }

    async fn drain_to_end(&mut self) -> Vec<LogChunk> {
        self.drain_logs()
    }

    async fn wait(&mut self) -> std::io::Result<Exit> {
        loop {
            self.advance();
            if let Some(exit) = self.exit {
                return Ok(exit);
            }
            match self.steps.get(self.cursor) {
                Some(step) => tokio::time::sleep_until(self.started + step.after).await,
                // Nothing left to replay: the script never exits by itself.
                None => std::future::pending::<()>().await,
            }
        }
    }

    async fn terminate(&mut self, _grace: Duration) -> std::io::Result<()> {
        if self.exit.is_none() {
            self.exit = Some(Exit { code: None });
        }
        Ok(())
    }
}

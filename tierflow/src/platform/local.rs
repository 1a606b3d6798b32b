//! Local child-process platform.
//!
//! Each remote unit is a child process built from a named [`TaskDefinition`].
//! Its stdout and stderr are appended line by line to `<log_dir>/<task_id>.log`,
//! which is created when the first line arrives. Log cursors are byte offsets
//! into that file and only complete lines are ever returned.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{
    ComputePlatform, LaunchError, LaunchRequest, LaunchedTask, LifecycleReport, LifecycleState,
    LogPage, LogSinkRef, PlatformError,
};

/// How long a stopped process gets to flush its remaining output.
const LOG_PUMP_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Program and environment for one remote unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

impl TaskDefinition {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            working_dir: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Run `script` through `sh -c`.
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new("sh").with_args(["-c".to_string(), script.into()])
    }
}

/// Configuration for [`LocalProcessPlatform`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalPlatformConfig {
    /// Directory holding one log file per task.
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// Registered task definitions, by key.
    #[serde(default)]
    pub task_definitions: BTreeMap<String, TaskDefinition>,
    /// Upper bound on bytes returned by one log read.
    #[serde(default = "default_max_page_bytes")]
    pub max_page_bytes: usize,
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("task-logs")
}

fn default_max_page_bytes() -> usize {
    256 * 1024
}

impl Default for LocalPlatformConfig {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
            task_definitions: BTreeMap::new(),
            max_page_bytes: default_max_page_bytes(),
        }
    }
}

#[derive(Debug)]
struct LocalTask {
    report: Mutex<LifecycleReport>,
    cancellation_token: CancellationToken,
}

impl LocalTask {
    fn new() -> Self {
        Self {
            report: Mutex::new(LifecycleReport::new(LifecycleState::Running)),
            cancellation_token: CancellationToken::new(),
        }
    }

    fn set_state(&self, state: LifecycleState) {
        let mut report = self.report.lock();
        if !report.state.is_terminal() {
            report.state = state;
        }
    }

    fn finish(&self, exit_code: Option<i32>, stop_reason: Option<String>) {
        let mut report = self.report.lock();
        report.state = LifecycleState::Stopped;
        report.exit_code = exit_code;
        report.stop_reason = stop_reason;
    }
}

/// Runs remote units as local child processes.
pub struct LocalProcessPlatform {
    config: LocalPlatformConfig,
    tasks: DashMap<String, Arc<LocalTask>>,
}

impl LocalProcessPlatform {
    pub fn new(config: LocalPlatformConfig) -> Self {
        Self {
            config,
            tasks: DashMap::new(),
        }
    }

    pub fn config(&self) -> &LocalPlatformConfig {
        &self.config
    }

    /// Number of tasks still tracked (not yet released).
    pub fn tracked_tasks(&self) -> usize {
        self.tasks.len()
    }

    fn build_command(definition: &TaskDefinition, request: &LaunchRequest) -> Command {
        let mut cmd = Command::new(&definition.program);
        cmd.args(&definition.args)
            .envs(&definition.env)
            .env("TIERFLOW_BUCKET", &request.file.bucket)
            .env("TIERFLOW_KEY", &request.file.key)
            .env("TIERFLOW_SIZE_BYTES", request.file.size_bytes.to_string())
            .env("TIERFLOW_FINGERPRINT", &request.file.fingerprint)
            .env("TIERFLOW_TASK_SIZE", request.tier.as_str())
            .env("TIERFLOW_LAUNCH_PATH", request.launch_path.as_str())
            .env("TIERFLOW_CORRELATION_ID", &request.correlation_id)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &definition.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

#[async_trait]
impl ComputePlatform for LocalProcessPlatform {
    async fn launch(&self, request: &LaunchRequest) -> Result<LaunchedTask, LaunchError> {
        let definition = self
            .config
            .task_definitions
            .get(&request.task_definition_key)
            .ok_or_else(|| LaunchError::NoTaskDefinition {
                tier: request.tier,
                key: request.task_definition_key.clone(),
            })?;

        tokio::fs::create_dir_all(&self.config.log_dir)
            .await
            .map_err(|e| {
                LaunchError::Placement(format!(
                    "cannot create log directory {}: {e}",
                    self.config.log_dir.display()
                ))
            })?;

        let task_id = format!("task-{}", Uuid::new_v4().simple());
        let log_path = self.config.log_dir.join(format!("{task_id}.log"));

        let mut child = Self::build_command(definition, request)
            .spawn()
            .map_err(|e| {
                LaunchError::Rejected(format!("failed to spawn '{}': {e}", definition.program))
            })?;

        let task = Arc::new(LocalTask::new());
        let pump = spawn_log_pump(&mut child, log_path.clone());
        spawn_process_waiter(child, pump, task.clone(), task_id.clone());
        self.tasks.insert(task_id.clone(), task);

        info!(
            task_id = %task_id,
            definition = %request.task_definition_key,
            file = %request.file,
            "Launched local task"
        );

        Ok(LaunchedTask {
            task_id,
            log_sink: LogSinkRef::new(log_path.to_string_lossy()),
        })
    }

    async fn poll_lifecycle(&self, task_id: &str) -> Result<LifecycleReport, PlatformError> {
        self.tasks
            .get(task_id)
            .map(|task| task.report.lock().clone())
            .ok_or_else(|| PlatformError::TaskNotFound(task_id.to_string()))
    }

    async fn terminate(&self, task_id: &str) -> Result<(), PlatformError> {
        let task = self
            .tasks
            .get(task_id)
            .map(|task| task.clone())
            .ok_or_else(|| PlatformError::TaskNotFound(task_id.to_string()))?;
        task.set_state(LifecycleState::Stopping);
        task.cancellation_token.cancel();
        Ok(())
    }

    async fn read_logs(
        &self,
        sink: &LogSinkRef,
        token: Option<&str>,
    ) -> Result<LogPage, PlatformError> {
        let offset = parse_offset(token)?;
        read_complete_lines(Path::new(sink.as_str()), offset, self.config.max_page_bytes).await
    }

    async fn release(&self, task_id: &str) {
        self.tasks.remove(task_id);
    }
}

fn parse_offset(token: Option<&str>) -> Result<u64, PlatformError> {
    match token {
        None => Ok(0),
        Some(raw) => raw
            .parse()
            .map_err(|_| PlatformError::InvalidCursor(raw.to_string())),
    }
}

async fn read_complete_lines(
    path: &Path,
    offset: u64,
    max_bytes: usize,
) -> Result<LogPage, PlatformError> {
    let mut file = match File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(PlatformError::SinkNotFound(path.display().to_string()));
        }
        Err(e) => return Err(e.into()),
    };
    file.seek(SeekFrom::Start(offset)).await?;

    let mut buffer = Vec::new();
    file.take(max_bytes as u64).read_to_end(&mut buffer).await?;

    // A line longer than a whole page is returned as-is so the cursor can move.
    let consumed = match buffer.iter().rposition(|b| *b == b'\n') {
        Some(pos) => pos + 1,
        None if buffer.len() >= max_bytes => buffer.len(),
        None => 0,
    };

    let lines = String::from_utf8_lossy(&buffer[..consumed])
        .lines()
        .map(str::to_owned)
        .collect();

    Ok(LogPage {
        lines,
        next_token: Some((offset + consumed as u64).to_string()),
    })
}

/// Copy stdout and stderr into the task's log file, one line at a time.
///
/// The file is created on the first line so an idle task has no sink yet.
fn spawn_log_pump(child: &mut Child, log_path: PathBuf) -> JoinHandle<()> {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    if let Some(stdout) = child.stdout.take() {
        forward_lines(stdout, tx.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        forward_lines(stderr, tx.clone());
    }
    drop(tx);

    tokio::spawn(async move {
        let mut file: Option<File> = None;
        while let Some(line) = rx.recv().await {
            if file.is_none() {
                match OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&log_path)
                    .await
                {
                    Ok(opened) => file = Some(opened),
                    Err(e) => {
                        warn!(path = %log_path.display(), error = %e, "Failed to open task log");
                        continue;
                    }
                }
            }
            if let Some(out) = file.as_mut() {
                let mut bytes = line.into_bytes();
                bytes.push(b'\n');
                if let Err(e) = out.write_all(&bytes).await {
                    warn!(path = %log_path.display(), error = %e, "Failed to write task log");
                    continue;
                }
                if let Err(e) = out.flush().await {
                    warn!(path = %log_path.display(), error = %e, "Failed to flush task log");
                }
            }
        }
    })
}

fn forward_lines<R>(reader: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).is_err() {
                break;
            }
        }
    });
}

/// Wait for the process to exit (or kill it on termination) and record the
/// terminal report once its output has been flushed.
fn spawn_process_waiter(
    mut child: Child,
    pump: JoinHandle<()>,
    task: Arc<LocalTask>,
    task_id: String,
) {
    tokio::spawn(async move {
        let (exit_code, stop_reason) = tokio::select! {
            _ = task.cancellation_token.cancelled() => {
                if let Err(e) = child.kill().await {
                    warn!(task_id = %task_id, error = %e, "Failed to kill task process");
                }
                let code = child.wait().await.ok().and_then(exit_code_of);
                (code, Some("terminated".to_string()))
            }
            status = child.wait() => {
                match status {
                    Ok(status) => (exit_code_of(status), None),
                    Err(e) => {
                        error!(task_id = %task_id, error = %e, "Error waiting for task process");
                        (None, Some(format!("wait failed: {e}")))
                    }
                }
            }
        };

        if tokio::time::timeout(LOG_PUMP_DRAIN_TIMEOUT, pump).await.is_err() {
            warn!(task_id = %task_id, "Task output still open after exit; log tail may be incomplete");
        }

        debug!(task_id = %task_id, exit_code = ?exit_code, "Local task stopped");
        task.finish(exit_code, stop_reason);
    });
}

/// Exit code of a finished process; signal deaths map to `128 + signal`.
fn exit_code_of(status: ExitStatus) -> Option<i32> {
    if let Some(code) = status.code() {
        return Some(code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        status.signal().map(|signal| 128 + signal)
    }
    #[cfg(not(unix))]
    {
        None
    }
}

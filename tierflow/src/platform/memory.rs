//! Scripted in-memory platform.
//!
//! Every launched task replays a [`TaskScript`]: each lifecycle poll consumes one
//! step and appends the step's log lines to the task's sink. The last step
//! repeats once the script is exhausted, so a script ending in `running` models
//! a task that never finishes.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, VecDeque};

use super::{
    ComputePlatform, LaunchError, LaunchRequest, LaunchedTask, LifecycleReport, LifecycleState,
    LogPage, LogSinkRef, PlatformError,
};

const DEFAULT_PAGE_LINES: usize = 100;

/// What a single lifecycle poll observes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStep {
    Report(LifecycleReport),
    TransientError,
}

#[derive(Debug, Clone)]
struct ScriptStep {
    step: PollStep,
    lines: Vec<String>,
}

/// Lifecycle script for one task.
#[derive(Debug, Clone, Default)]
pub struct TaskScript {
    steps: Vec<ScriptStep>,
    log_read_faults: usize,
}

impl TaskScript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs once, then stops with `exit_code`.
    pub fn completes_with(exit_code: i32) -> Self {
        Self::new()
            .running(Vec::<String>::new())
            .exit(Some(exit_code), Vec::<String>::new())
    }

    pub fn pending(self) -> Self {
        self.push(PollStep::Report(LifecycleReport::new(LifecycleState::Pending)), Vec::new())
    }

    pub fn running<I, S>(self, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let lines = lines.into_iter().map(Into::into).collect();
        self.push(PollStep::Report(LifecycleReport::new(LifecycleState::Running)), lines)
    }

    pub fn transient_error(self) -> Self {
        self.push(PollStep::TransientError, Vec::new())
    }

    pub fn exit<I, S>(self, exit_code: Option<i32>, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let lines = lines.into_iter().map(Into::into).collect();
        self.push(PollStep::Report(LifecycleReport::stopped(exit_code)), lines)
    }

    /// The first `count` log reads for this task fail transiently.
    pub fn with_log_read_faults(mut self, count: usize) -> Self {
        self.log_read_faults = count;
        self
    }

    fn push(mut self, step: PollStep, lines: Vec<String>) -> Self {
        self.steps.push(ScriptStep { step, lines });
        self
    }
}

#[derive(Debug)]
struct ScriptedTask {
    script: TaskScript,
    position: usize,
    sink: String,
    terminated: bool,
}

#[derive(Debug, Default)]
struct Inner {
    scripts: VecDeque<TaskScript>,
    launch_failures: VecDeque<LaunchError>,
    tasks: HashMap<String, ScriptedTask>,
    sinks: HashMap<String, Vec<String>>,
    log_read_faults: HashMap<String, usize>,
    polls: HashMap<String, usize>,
    launches: Vec<LaunchRequest>,
    terminate_calls: Vec<String>,
    released: Vec<String>,
    next_id: u64,
}

/// Platform that replays scripted lifecycles.
#[derive(Debug)]
pub struct InMemoryPlatform {
    definitions: Option<BTreeSet<String>>,
    page_lines: usize,
    inner: Mutex<Inner>,
}

impl Default for InMemoryPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryPlatform {
    /// A platform accepting any task-definition key.
    pub fn new() -> Self {
        Self {
            definitions: None,
            page_lines: DEFAULT_PAGE_LINES,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Only the given task-definition keys are registered.
    pub fn with_definitions<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            definitions: Some(keys.into_iter().map(Into::into).collect()),
            ..Self::new()
        }
    }

    pub fn with_page_lines(mut self, page_lines: usize) -> Self {
        self.page_lines = page_lines.max(1);
        self
    }

    /// Queue the script for the next launch. Launches without a queued script
    /// complete with exit code 0.
    pub fn push_script(&self, script: TaskScript) {
        self.inner.lock().scripts.push_back(script);
    }

    /// Make the next launch fail with `error`.
    pub fn fail_next_launch(&self, error: LaunchError) {
        self.inner.lock().launch_failures.push_back(error);
    }

    pub fn launches(&self) -> Vec<LaunchRequest> {
        self.inner.lock().launches.clone()
    }

    pub fn terminate_calls(&self) -> Vec<String> {
        self.inner.lock().terminate_calls.clone()
    }

    /// Lifecycle polls issued for a task id, counted across its release.
    pub fn poll_calls(&self, task_id: &str) -> usize {
        self.inner.lock().polls.get(task_id).copied().unwrap_or(0)
    }

    pub fn released(&self) -> Vec<String> {
        self.inner.lock().released.clone()
    }

    /// Create an empty sink.
    pub fn create_sink(&self, sink: &LogSinkRef) {
        self.inner
            .lock()
            .sinks
            .entry(sink.as_str().to_string())
            .or_default();
    }

    /// Append lines to a sink, creating it when needed.
    pub fn append_to_sink<I, S>(&self, sink: &LogSinkRef, lines: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inner
            .lock()
            .sinks
            .entry(sink.as_str().to_string())
            .or_default()
            .extend(lines.into_iter().map(Into::into));
    }

    pub fn sink_lines(&self, sink: &LogSinkRef) -> Vec<String> {
        self.inner
            .lock()
            .sinks
            .get(sink.as_str())
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl ComputePlatform for InMemoryPlatform {
    async fn launch(&self, request: &LaunchRequest) -> Result<LaunchedTask, LaunchError> {
        let mut inner = self.inner.lock();
        inner.launches.push(request.clone());

        if let Some(error) = inner.launch_failures.pop_front() {
            return Err(error);
        }
        if let Some(definitions) = &self.definitions
            && !definitions.contains(&request.task_definition_key)
        {
            return Err(LaunchError::NoTaskDefinition {
                tier: request.tier,
                key: request.task_definition_key.clone(),
            });
        }

        inner.next_id += 1;
        let task_id = format!("mem-task-{}", inner.next_id);
        let sink = format!("mem://logs/{task_id}");
        let script = inner
            .scripts
            .pop_front()
            .unwrap_or_else(|| TaskScript::completes_with(0));

        if script.log_read_faults > 0 {
            inner
                .log_read_faults
                .insert(sink.clone(), script.log_read_faults);
        }
        inner.tasks.insert(
            task_id.clone(),
            ScriptedTask {
                script,
                position: 0,
                sink: sink.clone(),
                terminated: false,
            },
        );

        Ok(LaunchedTask {
            task_id,
            log_sink: LogSinkRef::new(sink),
        })
    }

    async fn poll_lifecycle(&self, task_id: &str) -> Result<LifecycleReport, PlatformError> {
        let mut inner = self.inner.lock();
        let Inner {
            tasks,
            sinks,
            polls,
            ..
        } = &mut *inner;
        *polls.entry(task_id.to_string()).or_default() += 1;
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| PlatformError::TaskNotFound(task_id.to_string()))?;

        if task.terminated {
            return Ok(LifecycleReport::stopped(None).with_stop_reason("terminated"));
        }

        let Some(last) = task.script.steps.len().checked_sub(1) else {
            return Ok(LifecycleReport::stopped(Some(0)));
        };
        let index = task.position.min(last);
        let step = &task.script.steps[index];
        if task.position <= last {
            if !step.lines.is_empty() {
                sinks
                    .entry(task.sink.clone())
                    .or_default()
                    .extend(step.lines.iter().cloned());
            }
            task.position += 1;
        }

        match &step.step {
            PollStep::Report(report) => Ok(report.clone()),
            PollStep::TransientError => Err(PlatformError::Transient(format!(
                "scripted poll failure for {task_id}"
            ))),
        }
    }

    async fn terminate(&self, task_id: &str) -> Result<(), PlatformError> {
        let mut inner = self.inner.lock();
        inner.terminate_calls.push(task_id.to_string());
        let task = inner
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| PlatformError::TaskNotFound(task_id.to_string()))?;
        task.terminated = true;
        Ok(())
    }

    async fn read_logs(
        &self,
        sink: &LogSinkRef,
        token: Option<&str>,
    ) -> Result<LogPage, PlatformError> {
        let mut inner = self.inner.lock();
        if let Some(remaining) = inner.log_read_faults.get_mut(sink.as_str())
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(PlatformError::Transient(format!(
                "scripted log read failure for {sink}"
            )));
        }

        let start = match token {
            None => 0,
            Some(raw) => raw
                .parse::<usize>()
                .map_err(|_| PlatformError::InvalidCursor(raw.to_string()))?,
        };
        let lines = inner
            .sinks
            .get(sink.as_str())
            .ok_or_else(|| PlatformError::SinkNotFound(sink.to_string()))?;

        let start = start.min(lines.len());
        let end = (start + self.page_lines).min(lines.len());
        Ok(LogPage {
            lines: lines[start..end].to_vec(),
            next_token: Some(end.to_string()),
        })
    }

    async fn release(&self, task_id: &str) {
        let mut inner = self.inner.lock();
        inner.tasks.remove(task_id);
        inner.released.push(task_id.to_string());
    }
}

//! Subprocess-backed agent provider.
//!
//! Each agent runs in its own process group inside the task worktree with a cleared
//! environment plus an allow-list. Output is read line by line; stdout lines feed the
//! question detector. A supervisor task owns the child and is the only place that
//! unregisters it, so `Exited` is sent exactly once.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use familiar_core::completion::{extract_files_changed, extract_summary, is_completion_line};
use familiar_core::duration::format_duration;
use familiar_core::{
    AgentProcessRecord, AgentResult, Detection, Id, OutputStream, QuestionDetector, QuestionType,
};
use nix::sys::signal::Signal;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    AgentConfig, AgentError, AgentEvent, AgentProvider, OutputBuffer, OutputLine, Result,
    SpawnedAgent, MAX_RESPONSE_BYTES,
};
use crate::procinfo;
use crate::questions::QuestionStore;
use crate::records::ProcessRecordStore;

/// Interval between "agent still running" log lines.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for output readers after the process exits.
const IO_CAPTURE_TIMEOUT: Duration = Duration::from_secs(5);

/// How often an adopted process is probed for liveness.
const ADOPTED_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Environment variables passed through to every agent.
const SAFE_ENV: &[&str] = &[
    "PATH", "HOME", "USER", "LOGNAME", "LANG", "LC_ALL", "LC_CTYPE", "TERM", "SHELL", "TMPDIR",
];

#[derive(Debug, Clone)]
pub struct ProcessProviderConfig {
    pub bin: PathBuf,
    pub args: Vec<String>,
    /// Extra environment variable names passed through.
    pub env_allow: Vec<String>,
    pub idle_timeout: Duration,
    pub grace_period: Duration,
    pub max_lines: usize,
    pub max_bytes: usize,
}

impl Default for ProcessProviderConfig {
    fn default() -> Self {
        Self {
            bin: PathBuf::from("claude"),
            args: Vec::new(),
            env_allow: Vec::new(),
            idle_timeout: Duration::from_secs(5 * 60),
            grace_period: Duration::from_secs(5),
            max_lines: super::DEFAULT_MAX_LINES,
            max_bytes: super::DEFAULT_MAX_BYTES,
        }
    }
}

impl ProcessProviderConfig {
    pub fn from_config(config: &familiar_core::Config) -> Self {
        Self {
            bin: config.agent_bin.clone(),
            args: config.agent_args.clone(),
            env_allow: config.agent_env.clone(),
            idle_timeout: config.idle_timeout,
            ..Self::default()
        }
    }
}

#[derive(Debug)]
struct AgentEntry {
    task_id: String,
    step_task_id: String,
    pid: AtomicU32,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    buffer: Arc<Mutex<OutputBuffer>>,
    pending_question: Mutex<Option<Id>>,
    terminate: CancellationToken,
    reason: Mutex<Option<String>>,
    /// Cancelled once the process has exited and the entry is unregistered.
    exited: CancellationToken,
}

impl AgentEntry {
    fn new(task_id: &str, step_task_id: &str, buffer: OutputBuffer) -> Self {
        Self {
            task_id: task_id.to_string(),
            step_task_id: step_task_id.to_string(),
            pid: AtomicU32::new(0),
            stdin: tokio::sync::Mutex::new(None),
            buffer: Arc::new(Mutex::new(buffer)),
            pending_question: Mutex::new(None),
            terminate: CancellationToken::new(),
            reason: Mutex::new(None),
            exited: CancellationToken::new(),
        }
    }

    fn pid(&self) -> u32 {
        self.pid.load(Ordering::SeqCst)
    }

    fn request_termination(&self, reason: &str) {
        lock(&self.reason).get_or_insert_with(|| reason.to_string());
        self.terminate.cancel();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
struct Shared {
    config: ProcessProviderConfig,
    questions: Arc<QuestionStore>,
    records: ProcessRecordStore,
    detector: QuestionDetector,
    agents: Mutex<HashMap<String, Arc<AgentEntry>>>,
    /// Output of the most recent finished agent per task.
    finished: Mutex<HashMap<String, Arc<Mutex<OutputBuffer>>>>,
}

impl Shared {
    /// Reserve the task's slot in the process table.
    fn reserve(&self, entry: Arc<AgentEntry>) -> Result<()> {
        let mut agents = lock(&self.agents);
        if agents.contains_key(&entry.task_id) {
            return Err(AgentError::AlreadyRunning(entry.task_id.clone()));
        }
        agents.insert(entry.task_id.clone(), entry);
        Ok(())
    }

    /// Remove `entry` if it is still the registered agent for its task.
    fn unregister(&self, entry: &Arc<AgentEntry>) {
        {
            let mut agents = lock(&self.agents);
            if agents
                .get(&entry.task_id)
                .is_some_and(|current| Arc::ptr_eq(current, entry))
            {
                agents.remove(&entry.task_id);
            }
        }
        lock(&self.finished).insert(entry.task_id.clone(), Arc::clone(&entry.buffer));
        entry.exited.cancel();
    }

    fn entry(&self, task_id: &str) -> Option<Arc<AgentEntry>> {
        lock(&self.agents).get(task_id).cloned()
    }

    fn command_line(&self) -> String {
        let mut parts = vec![self.config.bin.display().to_string()];
        parts.extend(self.config.args.iter().cloned());
        parts.join(" ")
    }
}

/// Runs agents as local subprocesses.
#[derive(Debug, Clone)]
pub struct ProcessProvider {
    shared: Arc<Shared>,
}

impl ProcessProvider {
    pub fn new(
        config: ProcessProviderConfig,
        questions: Arc<QuestionStore>,
        records: ProcessRecordStore,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                questions,
                records,
                detector: QuestionDetector::new(),
                agents: Mutex::new(HashMap::new()),
                finished: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn build_command(&self, config: &AgentConfig) -> Command {
        let settings = &self.shared.config;
        let mut cmd = Command::new(&settings.bin);
        cmd.args(&settings.args)
            .arg(&config.prompt)
            .current_dir(&config.worktree)
            .env_clear()
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);

        let allowed = SAFE_ENV
            .iter()
            .copied()
            .chain(settings.env_allow.iter().map(String::as_str));
        for name in allowed {
            if let Some(value) = std::env::var_os(name) {
                cmd.env(name, value);
            }
        }
        cmd.env("FAMILIAR_TASK_ID", &config.task_id)
            .env("FAMILIAR_STEP_TASK_ID", &config.step_task_id);
        cmd
    }
}

#[async_trait]
impl AgentProvider for ProcessProvider {
    async fn spawn(&self, config: AgentConfig) -> Result<SpawnedAgent> {
        if !config.worktree.is_dir() {
            return Err(AgentError::WorktreeMissing(config.worktree.clone()));
        }

        let shared = &self.shared;
        let entry = Arc::new(AgentEntry::new(
            &config.task_id,
            &config.step_task_id,
            OutputBuffer::new(shared.config.max_lines, shared.config.max_bytes),
        ));
        shared.reserve(Arc::clone(&entry))?;

        let mut child = match self.build_command(&config).spawn() {
            Ok(child) => child,
            Err(e) => {
                lock(&shared.agents).remove(&config.task_id);
                entry.exited.cancel();
                return Err(if e.kind() == std::io::ErrorKind::NotFound {
                    AgentError::BinaryNotFound(shared.config.bin.display().to_string())
                } else {
                    AgentError::Io(e)
                });
            }
        };

        let pid = child.id().unwrap_or_default();
        entry.pid.store(pid, Ordering::SeqCst);
        *entry.stdin.lock().await = child.stdin.take();

        let command = shared.command_line();
        info!(
            task_id = %config.task_id,
            step_task_id = %config.step_task_id,
            pid,
            command = %command,
            worktree = %config.worktree.display(),
            "agent spawned"
        );

        let record = AgentProcessRecord {
            task_id: config.task_id.clone(),
            pid,
            started_at: Utc::now(),
            start_ticks: procinfo::read_stat(pid).map(|s| s.start_ticks),
            command: shared.config.bin.display().to_string(),
            args: shared.config.args.clone(),
            worktree_path: config.worktree.display().to_string(),
        };
        if let Err(e) = shared.records.save(&record).await {
            warn!(task_id = %config.task_id, error = %e, "failed to persist agent record");
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(AgentEvent::Spawned { pid, command });

        let (line_tx, line_rx) = mpsc::channel(256);
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(read_lines(stdout, OutputStream::Stdout, line_tx.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(read_lines(stderr, OutputStream::Stderr, line_tx)));
        }

        tokio::spawn(supervise(
            Arc::clone(&self.shared),
            entry,
            child,
            line_rx,
            readers,
            tx,
        ));

        Ok(SpawnedAgent { pid, events: rx })
    }

    async fn respond(&self, task_id: &str, text: &str) -> Result<()> {
        if text.len() > MAX_RESPONSE_BYTES {
            return Err(AgentError::ResponseTooLarge {
                size: text.len(),
                max: MAX_RESPONSE_BYTES,
            });
        }
        let entry = self
            .shared
            .entry(task_id)
            .ok_or_else(|| AgentError::AgentNotFound(task_id.to_string()))?;
        if entry.exited.is_cancelled() || entry.terminate.is_cancelled() {
            return Err(AgentError::NotRunning(task_id.to_string()));
        }

        let mut line: String = text.chars().filter(|c| !c.is_control()).collect();
        line.push('\n');

        let mut stdin = entry.stdin.lock().await;
        let Some(pipe) = stdin.as_mut() else {
            return Err(AgentError::StdinClosed(task_id.to_string()));
        };
        let written = async {
            pipe.write_all(line.as_bytes()).await?;
            pipe.flush().await
        }
        .await;
        if let Err(e) = written {
            *stdin = None;
            debug!(task_id, error = %e, "agent stdin write failed");
            return Err(AgentError::StdinClosed(task_id.to_string()));
        }
        drop(stdin);

        lock(&entry.pending_question).take();
        debug!(task_id, bytes = line.len(), "answer written to agent");
        Ok(())
    }

    async fn terminate(&self, task_id: &str, reason: &str) -> Result<()> {
        let entry = self
            .shared
            .entry(task_id)
            .ok_or_else(|| AgentError::AgentNotFound(task_id.to_string()))?;
        info!(task_id, pid = entry.pid(), reason, "terminating agent");
        entry.request_termination(reason);
        Ok(())
    }

    async fn terminate_all(&self, reason: &str) {
        let entries: Vec<Arc<AgentEntry>> = lock(&self.shared.agents).values().cloned().collect();
        if entries.is_empty() {
            return;
        }
        info!(count = entries.len(), reason, "terminating all agents");
        for entry in &entries {
            entry.request_termination(reason);
        }
        let all_exited =
            futures_util::future::join_all(entries.iter().map(|e| e.exited.cancelled()));
        let bound = self.shared.config.grace_period + IO_CAPTURE_TIMEOUT;
        if tokio::time::timeout(bound, all_exited).await.is_err() {
            warn!("agents still running after shutdown grace period");
        }
    }

    async fn adopt(&self, record: AgentProcessRecord) -> Result<()> {
        let entry = Arc::new(AgentEntry::new(
            &record.task_id,
            &format!("{}/recovered", record.task_id),
            OutputBuffer::new(self.shared.config.max_lines, self.shared.config.max_bytes),
        ));
        entry.pid.store(record.pid, Ordering::SeqCst);
        self.shared.reserve(Arc::clone(&entry))?;
        info!(task_id = %record.task_id, pid = record.pid, "adopted agent process");
        tokio::spawn(supervise_adopted(Arc::clone(&self.shared), entry));
        Ok(())
    }

    async fn is_available(&self) -> bool {
        let bin = self.shared.config.bin.clone();
        tokio::task::spawn_blocking(move || find_executable(&bin).is_some())
            .await
            .unwrap_or(false)
    }

    fn is_running(&self, task_id: &str) -> bool {
        self.shared
            .entry(task_id)
            .is_some_and(|e| !e.exited.is_cancelled())
    }

    fn running_step(&self, task_id: &str) -> Option<String> {
        self.shared
            .entry(task_id)
            .filter(|e| !e.exited.is_cancelled())
            .map(|e| e.step_task_id.clone())
    }

    fn output_tail(&self, task_id: &str, n: usize) -> Option<Vec<OutputLine>> {
        if let Some(entry) = self.shared.entry(task_id) {
            return Some(lock(&entry.buffer).tail(n));
        }
        let finished = lock(&self.shared.finished).get(task_id).cloned()?;
        let tail = lock(&finished).tail(n);
        Some(tail)
    }
}

/// Forward lines from a pipe. Invalid UTF-8 is replaced rather than ending the stream.
async fn read_lines<R: AsyncRead + Unpin>(
    reader: R,
    stream: OutputStream,
    tx: mpsc::Sender<(OutputStream, String)>,
) {
    let mut reader = BufReader::new(reader);
    let mut raw = Vec::with_capacity(1024);
    loop {
        raw.clear();
        match reader.read_until(b'\n', &mut raw).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&raw);
                let line = line.trim_end_matches(['\n', '\r']).to_string();
                if tx.send((stream, line)).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!(error = %e, "agent output read failed");
                break;
            }
        }
    }
}

/// Per-line handling shared by the live loop and the post-exit drain.
async fn handle_line(
    shared: &Shared,
    entry: &AgentEntry,
    tx: &mpsc::UnboundedSender<AgentEvent>,
    stream: OutputStream,
    line: String,
    completion_found: &mut bool,
) {
    lock(&entry.buffer).push(stream, line.as_str());

    let detection = if stream == OutputStream::Stdout {
        if is_completion_line(&line) {
            *completion_found = true;
        }
        shared.detector.detect(&line)
    } else {
        None
    };

    let _ = tx.send(AgentEvent::Output { stream, line });

    if let Some(detection) = detection {
        record_question(shared, entry, tx, detection).await;
    }
}

async fn record_question(
    shared: &Shared,
    entry: &AgentEntry,
    tx: &mpsc::UnboundedSender<AgentEvent>,
    detection: Detection,
) {
    match shared
        .questions
        .create(&entry.task_id, &entry.step_task_id, detection)
        .await
    {
        Ok(Some(question)) => {
            info!(
                task_id = %entry.task_id,
                question_id = %question.id,
                question_type = question.question_type.as_str(),
                "agent asked a question"
            );
            *lock(&entry.pending_question) = Some(question.id.clone());
            let _ = tx.send(AgentEvent::Question(question));
        }
        Ok(None) => debug!(task_id = %entry.task_id, "question suppressed; one already pending"),
        Err(e) => warn!(task_id = %entry.task_id, error = %e, "failed to record question"),
    }
}

fn signal_agent(pid: u32, sig: Signal) {
    if procinfo::signal_group(pid, sig).is_err() {
        if let Err(e) = procinfo::signal(pid, sig) {
            debug!(pid, signal = ?sig, error = %e, "signal not delivered");
        }
    }
}

async fn supervise(
    shared: Arc<Shared>,
    entry: Arc<AgentEntry>,
    mut child: Child,
    mut lines: mpsc::Receiver<(OutputStream, String)>,
    readers: Vec<JoinHandle<()>>,
    tx: mpsc::UnboundedSender<AgentEvent>,
) {
    let pid = entry.pid();
    let started = Instant::now();
    let idle_timeout = shared.config.idle_timeout;
    let far_future = tokio::time::Instant::now() + Duration::from_secs(365 * 24 * 3600);

    let mut completion_found = false;
    let mut lines_open = true;
    let mut idle_deadline = tokio::time::Instant::now() + idle_timeout;
    let mut idle_fired = false;
    let mut grace_deadline: Option<tokio::time::Instant> = None;
    let mut killed = false;
    let mut heartbeat = tokio::time::interval_at(
        tokio::time::Instant::now() + HEARTBEAT_INTERVAL,
        HEARTBEAT_INTERVAL,
    );

    let status: std::io::Result<ExitStatus> = loop {
        tokio::select! {
            line = lines.recv(), if lines_open => match line {
                Some((stream, line)) => {
                    idle_deadline = tokio::time::Instant::now() + idle_timeout;
                    idle_fired = false;
                    handle_line(&shared, &entry, &tx, stream, line, &mut completion_found).await;
                }
                None => lines_open = false,
            },
            status = child.wait() => break status,
            () = entry.terminate.cancelled(), if grace_deadline.is_none() => {
                signal_agent(pid, Signal::SIGTERM);
                grace_deadline = Some(tokio::time::Instant::now() + shared.config.grace_period);
            }
            () = tokio::time::sleep_until(grace_deadline.unwrap_or(far_future)), if grace_deadline.is_some() && !killed => {
                warn!(task_id = %entry.task_id, pid, "agent ignored SIGTERM; killing");
                signal_agent(pid, Signal::SIGKILL);
                killed = true;
            }
            () = tokio::time::sleep_until(idle_deadline), if !idle_fired => {
                idle_fired = true;
                warn!(
                    task_id = %entry.task_id,
                    idle = %format_duration(idle_timeout),
                    "agent produced no output; possibly stalled"
                );
                let detection = Detection {
                    question_type: QuestionType::Blocked,
                    text: format!(
                        "No output for {}. The agent may be stalled or waiting for input.",
                        format_duration(idle_timeout)
                    ),
                    options: None,
                };
                record_question(&shared, &entry, &tx, detection).await;
            }
            _ = heartbeat.tick() => {
                info!(
                    task_id = %entry.task_id,
                    pid,
                    elapsed_sec = started.elapsed().as_secs(),
                    "agent still running"
                );
            }
        }
    };

    // Drain whatever the readers still hold. Grandchildren may keep pipes open, so
    // the drain is bounded.
    if lines_open {
        let drain = async {
            while let Some((stream, line)) = lines.recv().await {
                handle_line(&shared, &entry, &tx, stream, line, &mut completion_found).await;
            }
        };
        if tokio::time::timeout(IO_CAPTURE_TIMEOUT, drain).await.is_err() {
            warn!(task_id = %entry.task_id, "output capture timed out after exit");
        }
    }
    for reader in readers {
        reader.abort();
    }
    entry.stdin.lock().await.take();

    let exit_code = match &status {
        Ok(status) => status.code(),
        Err(e) => {
            warn!(task_id = %entry.task_id, error = %e, "failed to wait for agent");
            None
        }
    };
    let terminated = lock(&entry.reason).clone();
    let stdout = lock(&entry.buffer).stdout_text();
    let result = AgentResult {
        success: exit_code == Some(0) && completion_found && terminated.is_none(),
        exit_code,
        completion_found,
        files_changed: extract_files_changed(&stdout),
        summary: extract_summary(&stdout),
        duration_ms: started.elapsed().as_millis() as u64,
        terminated,
    };

    info!(
        task_id = %entry.task_id,
        pid,
        exit_code = ?result.exit_code,
        success = result.success,
        duration_ms = result.duration_ms,
        "agent exited"
    );

    if let Err(e) = shared.records.remove(&entry.task_id).await {
        warn!(task_id = %entry.task_id, error = %e, "failed to remove agent record");
    }
    shared.unregister(&entry);
    let _ = tx.send(AgentEvent::Exited(result));
}

/// Watch a process we did not spawn. Its pipes are gone, so only liveness and
/// termination are supervised.
async fn supervise_adopted(shared: Arc<Shared>, entry: Arc<AgentEntry>) {
    let pid = entry.pid();
    let mut grace_deadline: Option<tokio::time::Instant> = None;
    let mut killed = false;

    loop {
        if !procinfo::is_running(pid) || procinfo::read_stat(pid).is_some_and(|s| s.is_zombie()) {
            break;
        }
        if entry.terminate.is_cancelled() {
            match grace_deadline {
                None => {
                    signal_agent(pid, Signal::SIGTERM);
                    grace_deadline =
                        Some(tokio::time::Instant::now() + shared.config.grace_period);
                }
                Some(deadline) if !killed && tokio::time::Instant::now() >= deadline => {
                    signal_agent(pid, Signal::SIGKILL);
                    killed = true;
                }
                Some(_) => {}
            }
        }
        tokio::select! {
            () = tokio::time::sleep(ADOPTED_POLL_INTERVAL) => {}
            () = entry.terminate.cancelled(), if grace_deadline.is_none() => {}
        }
    }

    info!(task_id = %entry.task_id, pid, "adopted agent exited");
    if let Err(e) = shared.records.remove(&entry.task_id).await {
        warn!(task_id = %entry.task_id, error = %e, "failed to remove agent record");
    }
    shared.unregister(&entry);
}

/// Resolve `bin` the way `execvp` would: a path with a separator is used as is,
/// anything else is searched on `PATH`.
fn find_executable(bin: &Path) -> Option<PathBuf> {
    use std::os::unix::fs::PermissionsExt;

    let is_executable = |p: &Path| {
        std::fs::metadata(p).is_ok_and(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
    };

    if bin.components().count() > 1 {
        return is_executable(bin).then(|| bin.to_path_buf());
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(bin))
        .find(|candidate| is_executable(candidate))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        questions: Arc<QuestionStore>,
        records: ProcessRecordStore,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let questions = Arc::new(QuestionStore::open(dir.path().join("questions")).unwrap());
            let records = ProcessRecordStore::open(dir.path().join("agents")).unwrap();
            std::fs::create_dir_all(dir.path().join("wt")).unwrap();
            Self {
                dir,
                questions,
                records,
            }
        }

        /// Provider that runs `script` under `/bin/sh`; the prompt arrives as `$1`.
        fn provider(&self, script: &str, tweak: impl FnOnce(&mut ProcessProviderConfig)) -> ProcessProvider {
            let path = self.dir.path().join("agent.sh");
            std::fs::write(&path, script).unwrap();
            let mut config = ProcessProviderConfig {
                bin: PathBuf::from("/bin/sh"),
                args: vec![path.display().to_string()],
                grace_period: Duration::from_millis(300),
                ..ProcessProviderConfig::default()
            };
            tweak(&mut config);
            ProcessProvider::new(config, Arc::clone(&self.questions), self.records.clone())
        }

        fn agent(&self, task_id: &str) -> AgentConfig {
            AgentConfig {
                task_id: task_id.to_string(),
                step_task_id: format!("{task_id}/implement"),
                worktree: self.dir.path().join("wt"),
                prompt: "do the thing".to_string(),
            }
        }
    }

    async fn collect(mut events: mpsc::UnboundedReceiver<AgentEvent>) -> Vec<AgentEvent> {
        let mut out = Vec::new();
        let deadline = Duration::from_secs(20);
        tokio::time::timeout(deadline, async {
            while let Some(event) = events.recv().await {
                out.push(event);
            }
        })
        .await
        .expect("agent did not finish");
        out
    }

    fn exited(events: &[AgentEvent]) -> &AgentResult {
        match events.last() {
            Some(AgentEvent::Exited(result)) => result,
            other => panic!("expected Exited last, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn events_are_ordered_and_success_needs_completion_marker() {
        let fx = Fixture::new();
        let provider = fx.provider(
            "echo \"prompt: $1\"\necho 'Modified src/lib.rs'\necho 'Summary: did it'\necho '<promise>COMPLETE</promise>'\n",
            |_| {},
        );
        let spawned = provider.spawn(fx.agent("T1")).await.unwrap();
        let events = collect(spawned.events).await;

        assert!(matches!(events[0], AgentEvent::Spawned { pid, .. } if pid == spawned.pid));
        let outputs: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                AgentEvent::Output { line, .. } => Some(line.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(outputs[0], "prompt: do the thing");

        let result = exited(&events);
        assert!(result.success);
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.files_changed, vec!["src/lib.rs"]);
        assert_eq!(result.summary, "did it");
        assert!(!provider.is_running("T1"));
        assert!(fx.records.list().unwrap().is_empty());
        assert_eq!(provider.output_tail("T1", 1).unwrap()[0].line, "<promise>COMPLETE</promise>");
    }

    #[tokio::test]
    async fn zero_exit_without_marker_is_not_success() {
        let fx = Fixture::new();
        let provider = fx.provider("echo done\n", |_| {});
        let events = collect(provider.spawn(fx.agent("T1")).await.unwrap().events).await;
        let result = exited(&events);
        assert_eq!(result.exit_code, Some(0));
        assert!(!result.completion_found);
        assert!(!result.success);
    }

    #[tokio::test]
    async fn second_spawn_for_same_task_is_rejected() {
        let fx = Fixture::new();
        let provider = fx.provider("sleep 30\n", |_| {});
        let first = provider.spawn(fx.agent("T1")).await.unwrap();
        assert!(provider.is_running("T1"));
        assert_eq!(fx.records.list().unwrap().len(), 1);

        let err = provider.spawn(fx.agent("T1")).await.unwrap_err();
        assert!(matches!(err, AgentError::AlreadyRunning(ref t) if t == "T1"));

        provider.terminate("T1", "test over").await.unwrap();
        let events = collect(first.events).await;
        assert_eq!(exited(&events).terminated.as_deref(), Some("test over"));
        assert!(!exited(&events).success);
    }

    #[tokio::test]
    async fn confirmation_question_is_recorded_once_and_answer_reaches_stdin() {
        let fx = Fixture::new();
        let provider = fx.provider(
            "echo 'Continue with changes? (y/n)'\necho 'Continue with changes? (y/n)'\nread answer\necho \"got $answer\"\necho '<promise>COMPLETE</promise>'\n",
            |_| {},
        );
        let mut spawned = provider.spawn(fx.agent("T1")).await.unwrap();

        let question = loop {
            match spawned.events.recv().await {
                Some(AgentEvent::Question(q)) => break q,
                Some(_) => {}
                None => panic!("agent exited before asking"),
            }
        };
        assert_eq!(question.question_type, QuestionType::Confirmation);
        assert_eq!(question.options, Some(vec!["y".to_string(), "n".to_string()]));

        provider.respond("T1", "y\u{7}").await.unwrap();
        let rest = collect(spawned.events).await;
        assert!(rest.iter().any(|e| matches!(e, AgentEvent::Output { line, .. } if line == "got y")));
        assert!(!rest.iter().any(|e| matches!(e, AgentEvent::Question(_))));
        assert!(exited(&rest).success);
        assert_eq!(fx.questions.list_for_task("T1").len(), 1);
    }

    #[tokio::test]
    async fn respond_validates_target_and_size() {
        let fx = Fixture::new();
        let provider = fx.provider("sleep 30\n", |_| {});
        assert!(provider.respond("nope", "y").await.unwrap_err().is_not_found());

        let spawned = provider.spawn(fx.agent("T1")).await.unwrap();
        let huge = "x".repeat(MAX_RESPONSE_BYTES + 1);
        assert!(matches!(
            provider.respond("T1", &huge).await,
            Err(AgentError::ResponseTooLarge { .. })
        ));
        provider.terminate_all("shutdown").await;
        collect(spawned.events).await;
    }

    #[tokio::test]
    async fn stubborn_agent_is_killed_after_grace_period() {
        let fx = Fixture::new();
        let provider = fx.provider("trap '' TERM\nwhile true; do sleep 1; done\n", |_| {});
        let spawned = provider.spawn(fx.agent("T1")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let started = Instant::now();
        provider.terminate("T1", "cancelled").await.unwrap();
        let events = collect(spawned.events).await;
        let result = exited(&events);
        assert_eq!(result.exit_code, None);
        assert_eq!(result.terminated.as_deref(), Some("cancelled"));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn idle_agent_gets_a_stalled_question() {
        let fx = Fixture::new();
        let provider = fx.provider("sleep 2\n", |c| c.idle_timeout = Duration::from_millis(200));
        let events = collect(provider.spawn(fx.agent("T1")).await.unwrap().events).await;
        let questions: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                AgentEvent::Question(q) => Some(q),
                _ => None,
            })
            .collect();
        assert_eq!(questions.len(), 1);
        assert_eq!(questions[0].question_type, QuestionType::Blocked);
        assert!(questions[0].text.contains("stalled"));
    }

    #[tokio::test]
    async fn environment_is_allow_listed() {
        let fx = Fixture::new();
        let provider = fx.provider(
            "echo \"task=$FAMILIAR_TASK_ID step=$FAMILIAR_STEP_TASK_ID\"\necho \"manifest=${CARGO_MANIFEST_DIR:-unset}\"\n",
            |_| {},
        );
        let events = collect(provider.spawn(fx.agent("T9")).await.unwrap().events).await;
        let lines: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                AgentEvent::Output { line, .. } => Some(line.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(lines, vec!["task=T9 step=T9/implement", "manifest=unset"]);
    }

    #[tokio::test]
    async fn missing_binary_and_worktree_are_reported() {
        let fx = Fixture::new();
        let provider = fx.provider("", |c| {
            c.bin = PathBuf::from("/nonexistent/agent-binary");
            c.args.clear();
        });
        assert!(!provider.is_available().await);
        let err = provider.spawn(fx.agent("T1")).await.unwrap_err();
        assert!(matches!(err, AgentError::BinaryNotFound(_)));
        // The reservation was released.
        assert!(!provider.is_running("T1"));

        let mut missing = fx.agent("T2");
        missing.worktree = fx.dir.path().join("nope");
        assert!(matches!(
            provider.spawn(missing).await,
            Err(AgentError::WorktreeMissing(_))
        ));

        let sh = fx.provider("", |_| {});
        assert!(sh.is_available().await);
    }
}

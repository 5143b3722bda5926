use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use psgate_core::config::LimitsConfig;
use psgate_core::types::{
    AdaptiveParams, ExecutionOutcome, ExecutionRequest, OverflowStrategy, ProcessSample,
    TerminationReason,
};

use crate::shell::{ShellFlavor, ShellSpec, SELF_DESTRUCT_EXIT};

/// Synthetic exit code reported when overflow forces an early response.
const OVERFLOW_EXIT: i32 = 137;
/// Cadence of the adaptive-extension check.
const ADAPTIVE_TICK_MS: u64 = 250;
/// How long a graceful stop gets before escalating to a tree kill.
const KILL_VERIFY_MS: u64 = 1_500;
/// Short delay before the hard kill when `hardKillOnOverflow` is set.
const HARD_KILL_DELAY_MS: u64 = 500;
/// How much earlier than the watchdog the in-process timer fires.
const SELF_DESTRUCT_LEAD_MS: u64 = 500;

pub struct SupervisorOptions {
    pub limits: LimitsConfig,
    pub disable_self_destruct: bool,
    pub capture_process_metrics: bool,
}

impl SupervisorOptions {
    pub fn new(limits: LimitsConfig) -> Self {
        Self {
            limits,
            disable_self_destruct: false,
            capture_process_metrics: false,
        }
    }
}

/// Runs one command in a supervised child process: concurrent chunked
/// stdout/stderr readers, an external watchdog with optional adaptive
/// extension, output caps with overflow strategies, and at-most-once
/// termination classification.
pub struct Supervisor {
    shell: ShellSpec,
    options: SupervisorOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamKind {
    Stdout,
    Stderr,
}

struct Chunk {
    kind: StreamKind,
    data: Vec<u8>,
}

/// Per-execution mutable state. `termination` is assigned exactly once
/// through `assign_termination`; later candidates are diagnostic only.
struct ExecState {
    stdout_chunks: Vec<String>,
    stderr_chunks: Vec<String>,
    total_bytes: u64,
    line_count: u64,
    overflow: bool,
    truncated: bool,
    discard: bool,
    timed_out: bool,
    watchdog_triggered: bool,
    internal_self_destruct: bool,
    kill_escalated: bool,
    adaptive_extensions: u32,
    exit_code: Option<i32>,
    termination: Option<TerminationReason>,
    sample: Option<ProcessSample>,
}

impl ExecState {
    fn new() -> Self {
        Self {
            stdout_chunks: Vec::new(),
            stderr_chunks: Vec::new(),
            total_bytes: 0,
            line_count: 0,
            overflow: false,
            truncated: false,
            discard: false,
            timed_out: false,
            watchdog_triggered: false,
            internal_self_destruct: false,
            kill_escalated: false,
            adaptive_extensions: 0,
            exit_code: None,
            termination: None,
            sample: None,
        }
    }

    fn assign_termination(&mut self, reason: TerminationReason) {
        if self.termination.is_none() {
            self.termination = Some(reason);
        }
    }
}

impl Supervisor {
    pub fn new(shell: ShellSpec, options: SupervisorOptions) -> Self {
        Self { shell, options }
    }

    pub fn shell(&self) -> &ShellSpec {
        &self.shell
    }

    /// Execute one request to completion. Policy has already been
    /// enforced; everything that reaches this point is allowed to spawn.
    pub async fn execute(&self, req: ExecutionRequest) -> ExecutionOutcome {
        let configured_ms = req.timeout_sec.max(1) * 1_000;
        let adaptive = req.adaptive;
        let max_total_ms = adaptive
            .map(|a| a.max_total_sec * 1_000)
            .unwrap_or(configured_ms)
            .max(configured_ms);

        let self_destruct = self.self_destruct_after(configured_ms, max_total_ms, adaptive);
        let args = self.shell.args(&req.command_text, self_destruct);

        let mut cmd = Command::new(&self.shell.program);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &req.cwd {
            cmd.current_dir(cwd);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "Spawn failed");
                return spawn_failed_outcome(&req, configured_ms, max_total_ms, e.to_string());
            }
        };

        let start = Instant::now();
        let mut state = ExecState::new();
        let mut effective_ms = configured_ms;
        let mut last_activity = start;
        let mut streams_closed = false;

        let chunk_size = (self.options.limits.chunk_kb.max(1) * 1024) as usize;
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel::<Chunk>(32);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(read_stream(
                stdout,
                StreamKind::Stdout,
                tx.clone(),
                chunk_size,
                cancel.clone(),
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(read_stream(
                stderr,
                StreamKind::Stderr,
                tx.clone(),
                chunk_size,
                cancel.clone(),
            ));
        }
        drop(tx);

        let pid = child.id();
        let mut ticker = tokio::time::interval(Duration::from_millis(ADAPTIVE_TICK_MS));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let max_bytes = self.options.limits.max_output_kb * 1024;
        let max_lines = self.options.limits.max_lines;

        enum LoopEnd {
            Exited(Option<i32>),
            Watchdog,
            OverflowReturn,
            OverflowTerminate,
        }

        let ended = loop {
            let deadline =
                tokio::time::Instant::from_std(start + Duration::from_millis(effective_ms));
            tokio::select! {
                maybe = rx.recv(), if !streams_closed => {
                    match maybe {
                        Some(chunk) => {
                            last_activity = Instant::now();
                            if self.options.capture_process_metrics && state.sample.is_none() {
                                state.sample = pid.and_then(sample_process);
                            }
                            consume_chunk(&mut state, chunk, max_bytes, max_lines);
                            if state.overflow && state.termination.is_none() {
                                match req.overflow_strategy {
                                    OverflowStrategy::Return => break LoopEnd::OverflowReturn,
                                    OverflowStrategy::Terminate => break LoopEnd::OverflowTerminate,
                                    OverflowStrategy::Truncate => {
                                        // Keep draining so the child is not
                                        // blocked on a full pipe; drop the data.
                                        state.discard = true;
                                        state.truncated = true;
                                    }
                                }
                            }
                        }
                        None => streams_closed = true,
                    }
                }
                status = child.wait() => {
                    let code = status.ok().and_then(|s| s.code());
                    break LoopEnd::Exited(code);
                }
                _ = tokio::time::sleep_until(deadline) => {
                    break LoopEnd::Watchdog;
                }
                _ = ticker.tick(), if adaptive.is_some() => {
                    if let Some(params) = adaptive {
                        maybe_extend(
                            &mut effective_ms,
                            &mut state.adaptive_extensions,
                            start,
                            last_activity,
                            params,
                            max_total_ms,
                        );
                    }
                }
            }
        };

        match ended {
            LoopEnd::Exited(code) => {
                state.exit_code = code;
                if code == Some(SELF_DESTRUCT_EXIT)
                    && self.shell.flavor == ShellFlavor::PowerShell
                    && !self.options.disable_self_destruct
                {
                    state.internal_self_destruct = true;
                    state.timed_out = true;
                }
                drain_remaining(&mut rx, &mut state, max_bytes, max_lines).await;
            }
            LoopEnd::Watchdog => {
                state.timed_out = true;
                state.watchdog_triggered = true;
                self.capture_sample(&mut state, pid);
                let (code, escalated) =
                    stop_child(&mut child, Duration::from_millis(KILL_VERIFY_MS)).await;
                state.exit_code = code;
                state.kill_escalated = escalated;
                if code == Some(SELF_DESTRUCT_EXIT)
                    && self.shell.flavor == ShellFlavor::PowerShell
                {
                    state.internal_self_destruct = true;
                }
                drain_remaining(&mut rx, &mut state, max_bytes, max_lines).await;
            }
            LoopEnd::OverflowReturn => {
                // Respond now; the child is detached and killed in the
                // background so the caller never waits on teardown.
                self.capture_sample(&mut state, pid);
                state.truncated = true;
                state.assign_termination(TerminationReason::OutputOverflow);
                state.exit_code = Some(OVERFLOW_EXIT);
                cancel.cancel();
                tokio::spawn(kill_detached(child));
            }
            LoopEnd::OverflowTerminate => {
                self.capture_sample(&mut state, pid);
                state.truncated = true;
                state.assign_termination(TerminationReason::OutputOverflow);
                let verify = if self.options.limits.hard_kill_on_overflow {
                    Duration::from_millis(HARD_KILL_DELAY_MS)
                } else {
                    Duration::from_millis(KILL_VERIFY_MS)
                };
                let (code, escalated) = stop_child(&mut child, verify).await;
                state.exit_code = code;
                state.kill_escalated = escalated;
                drain_remaining(&mut rx, &mut state, max_bytes, max_lines).await;
            }
        }

        if state.overflow {
            state.assign_termination(TerminationReason::OutputOverflow);
        }
        if state.timed_out {
            state.assign_termination(TerminationReason::Timeout);
        }
        if state.exit_code == Some(0) {
            state.assign_termination(TerminationReason::Completed);
        }
        state.assign_termination(TerminationReason::Killed);

        let termination = state.termination.unwrap_or(TerminationReason::Killed);
        let duration_ms = (start.elapsed().as_millis() as u64).max(1);

        debug!(
            termination = %termination,
            exit_code = ?state.exit_code,
            duration_ms,
            total_bytes = state.total_bytes,
            "Execution finished"
        );

        ExecutionOutcome {
            success: termination == TerminationReason::Completed,
            exit_code: state.exit_code,
            stdout_chunks: state.stdout_chunks,
            stderr_chunks: state.stderr_chunks,
            total_bytes: state.total_bytes,
            duration_ms,
            configured_timeout_ms: configured_ms,
            effective_timeout_ms: effective_ms,
            adaptive_extensions: state.adaptive_extensions,
            adaptive_extended: state.adaptive_extensions > 0,
            adaptive_max_total_ms: max_total_ms,
            timed_out: state.timed_out,
            overflow: state.overflow,
            overflow_strategy: req.overflow_strategy,
            truncated: state.truncated,
            termination_reason: termination,
            internal_self_destruct: state.internal_self_destruct,
            watchdog_triggered: state.watchdog_triggered,
            kill_escalated: state.kill_escalated,
            reason: None,
            process_sample: state.sample,
        }
    }

    fn self_destruct_after(
        &self,
        configured_ms: u64,
        max_total_ms: u64,
        adaptive: Option<AdaptiveParams>,
    ) -> Option<Duration> {
        if self.options.disable_self_destruct || self.shell.flavor != ShellFlavor::PowerShell {
            return None;
        }
        // With adaptive extension armed, the in-process timer targets the
        // hard ceiling; the external watchdog handles everything earlier.
        let target = if adaptive.is_some() { max_total_ms } else { configured_ms };
        Some(Duration::from_millis(
            target.saturating_sub(SELF_DESTRUCT_LEAD_MS).max(100),
        ))
    }

    fn capture_sample(&self, state: &mut ExecState, pid: Option<u32>) {
        if self.options.capture_process_metrics {
            if let Some(s) = pid.and_then(sample_process) {
                state.sample = Some(s);
            }
        }
    }
}

/// Read one stream into fixed-size chunks until EOF or cancellation.
async fn read_stream<R: AsyncRead + Unpin>(
    mut reader: R,
    kind: StreamKind,
    tx: mpsc::Sender<Chunk>,
    chunk_size: usize,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; chunk_size];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            read = reader.read(&mut buf) => match read {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.send(Chunk { kind, data: buf[..n].to_vec() }).await.is_err() {
                        break;
                    }
                }
            }
        }
    }
}

fn consume_chunk(state: &mut ExecState, chunk: Chunk, max_bytes: u64, max_lines: u64) {
    if state.discard {
        return;
    }
    let n = chunk.data.len() as u64;
    let newlines = chunk.data.iter().filter(|b| **b == b'\n').count() as u64;
    state.total_bytes += n;
    state.line_count += newlines;

    let text = String::from_utf8_lossy(&chunk.data).into_owned();
    match chunk.kind {
        StreamKind::Stdout => state.stdout_chunks.push(text),
        StreamKind::Stderr => state.stderr_chunks.push(text),
    }

    if state.total_bytes > max_bytes || state.line_count > max_lines {
        state.overflow = true;
    }
}

/// Collect whatever the readers already produced after the child is
/// gone. The channel closes once both readers hit EOF.
async fn drain_remaining(
    rx: &mut mpsc::Receiver<Chunk>,
    state: &mut ExecState,
    max_bytes: u64,
    max_lines: u64,
) {
    while let Some(chunk) = rx.recv().await {
        consume_chunk(state, chunk, max_bytes, max_lines);
        if state.overflow && !state.truncated {
            state.discard = true;
            state.truncated = true;
        }
    }
}

fn maybe_extend(
    effective_ms: &mut u64,
    extensions: &mut u32,
    start: Instant,
    last_activity: Instant,
    params: AdaptiveParams,
    max_total_ms: u64,
) {
    let elapsed = start.elapsed().as_millis() as u64;
    let remaining = effective_ms.saturating_sub(elapsed);
    let idle = last_activity.elapsed().as_millis() as u64;

    if remaining > params.extend_window_ms || idle > params.extend_window_ms {
        return;
    }
    // Near the ceiling a partial step is skipped rather than shortened.
    if *effective_ms + params.extend_step_ms > max_total_ms {
        return;
    }
    *effective_ms += params.extend_step_ms;
    *extensions += 1;
    debug!(effective_ms = *effective_ms, "Adaptive timeout extension");
}

/// Graceful stop, then a process-tree kill if the child outlives the
/// verification window. Repeated kills are idempotent.
async fn stop_child(child: &mut Child, verify: Duration) -> (Option<i32>, bool) {
    signal_graceful(child);
    match tokio::time::timeout(verify, child.wait()).await {
        Ok(Ok(status)) => (status.code(), false),
        Ok(Err(_)) => (None, false),
        Err(_) => {
            signal_hard(child);
            let code = child.wait().await.ok().and_then(|s| s.code());
            (code, true)
        }
    }
}

/// Background teardown for the `return` overflow strategy.
async fn kill_detached(mut child: Child) {
    signal_graceful(&child);
    tokio::time::sleep(Duration::from_millis(HARD_KILL_DELAY_MS)).await;
    signal_hard(&mut child);
    let _ = child.wait().await;
}

#[cfg(unix)]
fn signal_graceful(child: &Child) {
    if let Some(pid) = child.id() {
        // The child leads its own process group, so the negative pid
        // reaches the whole tree.
        unsafe {
            libc::kill(-(pid as libc::pid_t), libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
fn signal_graceful(_child: &Child) {}

#[cfg(unix)]
fn signal_hard(child: &mut Child) {
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(-(pid as libc::pid_t), libc::SIGKILL);
        }
    }
    let _ = child.start_kill();
}

#[cfg(not(unix))]
fn signal_hard(child: &mut Child) {
    let _ = child.start_kill();
}

fn spawn_failed_outcome(
    req: &ExecutionRequest,
    configured_ms: u64,
    max_total_ms: u64,
    message: String,
) -> ExecutionOutcome {
    ExecutionOutcome {
        success: false,
        exit_code: None,
        stdout_chunks: Vec::new(),
        stderr_chunks: vec![message],
        total_bytes: 0,
        duration_ms: 1,
        configured_timeout_ms: configured_ms,
        effective_timeout_ms: configured_ms,
        adaptive_extensions: 0,
        adaptive_extended: false,
        adaptive_max_total_ms: max_total_ms,
        timed_out: false,
        overflow: false,
        overflow_strategy: req.overflow_strategy,
        truncated: false,
        termination_reason: TerminationReason::Killed,
        internal_self_destruct: false,
        watchdog_triggered: false,
        kill_escalated: false,
        reason: Some("spawn_failed".into()),
        process_sample: None,
    }
}

#[cfg(target_os = "linux")]
fn sample_process(pid: u32) -> Option<ProcessSample> {
    let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    // comm can contain spaces; fields are stable after the closing paren.
    let rest = stat.rsplit_once(')')?.1;
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let utime: f64 = fields.get(11)?.parse().ok()?;
    let stime: f64 = fields.get(12)?.parse().ok()?;
    let cpu_seconds = (utime + stime) / 100.0;

    let status = std::fs::read_to_string(format!("/proc/{}/status", pid)).ok()?;
    let rss_kb: f64 = status
        .lines()
        .find(|l| l.starts_with("VmRSS:"))?
        .split_whitespace()
        .nth(1)?
        .parse()
        .ok()?;
    Some(ProcessSample {
        cpu_seconds,
        working_set_mb: rss_kb / 1024.0,
    })
}

#[cfg(not(target_os = "linux"))]
fn sample_process(_pid: u32) -> Option<ProcessSample> {
    None
}

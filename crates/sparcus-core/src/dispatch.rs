//! Handler execution with timeout and output caps.
//!
//! Each matched handler is launched with no arguments. Its inputs are the
//! six `EVENT_*` variables, set on the child's environment only, and the
//! same values as a JSON object on standard input. The parent process
//! environment is never touched, so concurrent dispatches cannot see each
//! other's parameters.
//!
//! - Per-handler timeout with SIGTERM → SIGKILL escalation on the child's
//!   process group
//! - Per-stream output cap
//! - Launch failures, non-zero exits and timeouts are recorded in the
//!   [`Event`] and never stop the remaining handlers

use serde::{Deserialize, Serialize};
use sparcus_common::{format_number, RequestPath};
use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::events::{Event, EventLog};
use crate::store::TimeSeriesStore;

/// Default handler timeout in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Default cap on captured bytes per output stream.
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 64 * 1024;

/// Grace period between SIGTERM and SIGKILL in milliseconds.
const SIGTERM_GRACE_MS: u64 = 500;

/// Average windows exported to handlers.
pub const AVERAGE_WINDOWS: [usize; 3] = [3, 5, 10];

/// Errors launching or waiting on a handler.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("failed to spawn handler {path}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to wait for handler {path}: {source}")]
    Wait {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Dispatch limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchConfig {
    pub timeout: Duration,
    pub max_output_bytes: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }
}

/// Parameters handed to every handler fired by one write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerContext {
    /// Raw submitted value (`EVENT_VALUE`).
    pub value: String,
    /// Lower-cased slash path (`EVENT_PATH`).
    pub path: String,
    /// Dotted key (`EVENT_PATH_DOTTED`).
    pub key: String,
    /// `EVENT_VALUE_AVG_3`; empty when no numeric samples exist.
    pub avg_3: String,
    pub avg_5: String,
    pub avg_10: String,
}

impl TriggerContext {
    /// Build the context for a write that has already been stored.
    pub fn build(store: &TimeSeriesStore, path: &RequestPath, raw_value: &str) -> Self {
        let key = path.key();
        let [avg_3, avg_5, avg_10] = AVERAGE_WINDOWS.map(|window| {
            store
                .average(&key, window)
                .map(format_number)
                .unwrap_or_default()
        });

        Self {
            value: raw_value.to_string(),
            path: path.as_str().to_string(),
            key: key.as_str().to_string(),
            avg_3,
            avg_5,
            avg_10,
        }
    }

    /// The child environment variables.
    pub fn env_vars(&self) -> [(&'static str, &str); 6] {
        [
            ("EVENT_VALUE", self.value.as_str()),
            ("EVENT_PATH", self.path.as_str()),
            ("EVENT_PATH_DOTTED", self.key.as_str()),
            ("EVENT_VALUE_AVG_3", self.avg_3.as_str()),
            ("EVENT_VALUE_AVG_5", self.avg_5.as_str()),
            ("EVENT_VALUE_AVG_10", self.avg_10.as_str()),
        ]
    }
}

/// How a handler run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Success,
    Failed,
    Timeout,
    SpawnError,
}

impl DispatchOutcome {
    pub fn of(event: &Event) -> Self {
        if event.error.is_some() {
            DispatchOutcome::SpawnError
        } else if event.timed_out {
            DispatchOutcome::Timeout
        } else if event.exit_code == Some(0) {
            DispatchOutcome::Success
        } else {
            DispatchOutcome::Failed
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchOutcome::Success => "success",
            DispatchOutcome::Failed => "failed",
            DispatchOutcome::Timeout => "timeout",
            DispatchOutcome::SpawnError => "spawn_error",
        }
    }
}

/// Captured result of one child process.
#[derive(Debug, Default)]
struct Captured {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    exit_code: Option<i32>,
    truncated: bool,
    timed_out: bool,
}

/// Runs handlers and records their outcomes.
#[derive(Debug, Clone, Default)]
pub struct TriggerDispatcher {
    config: DispatchConfig,
}

impl TriggerDispatcher {
    pub fn new(config: DispatchConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Run every handler in order, appending one event per handler to `log`.
    ///
    /// Returns the appended events.
    pub fn dispatch(
        &self,
        handlers: &[PathBuf],
        ctx: &TriggerContext,
        log: &EventLog,
    ) -> Vec<Event> {
        handlers
            .iter()
            .map(|handler| {
                let event = self.run(handler, ctx);
                log.append(event.clone());
                event
            })
            .collect()
    }

    /// Run a single handler to completion. Never fails; problems are
    /// recorded on the returned event.
    pub fn run(&self, handler: &Path, ctx: &TriggerContext) -> Event {
        let mut event = Event::started(ctx.key.clone(), handler.display().to_string());
        let start = Instant::now();

        debug!(
            handler = %handler.display(),
            key = %ctx.key,
            timeout_ms = self.config.timeout.as_millis() as u64,
            "running handler"
        );

        match self.execute(handler, ctx) {
            Ok(captured) => {
                event.stdout = String::from_utf8_lossy(&captured.stdout).into_owned();
                event.stderr = String::from_utf8_lossy(&captured.stderr).into_owned();
                event.exit_code = captured.exit_code;
                event.truncated = captured.truncated;
                event.timed_out = captured.timed_out;
            }
            Err(e) => {
                warn!(handler = %handler.display(), error = %e, "handler failed to run");
                event.error = Some(e.to_string());
            }
        }

        event.duration_ms = start.elapsed().as_millis() as u64;

        match DispatchOutcome::of(&event) {
            DispatchOutcome::Success => info!(
                handler = %handler.display(),
                duration_ms = event.duration_ms,
                "handler completed"
            ),
            DispatchOutcome::Failed => warn!(
                handler = %handler.display(),
                exit_code = ?event.exit_code,
                duration_ms = event.duration_ms,
                "handler exited with failure"
            ),
            DispatchOutcome::Timeout => warn!(
                handler = %handler.display(),
                duration_ms = event.duration_ms,
                "handler timed out"
            ),
            DispatchOutcome::SpawnError => {}
        }

        event
    }

    fn execute(&self, handler: &Path, ctx: &TriggerContext) -> Result<Captured, DispatchError> {
        let mut command = Command::new(handler);
        command
            .envs(ctx.env_vars())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);

        let mut child = command.spawn().map_err(|e| DispatchError::Spawn {
            path: handler.to_path_buf(),
            source: e,
        })?;

        if let Some(stdin) = child.stdin.take() {
            write_context(stdin, ctx);
        }

        execute_with_timeout(
            &mut child,
            self.config.timeout,
            self.config.max_output_bytes,
        )
        .map_err(|e| DispatchError::Wait {
            path: handler.to_path_buf(),
            source: e,
        })
    }
}

/// Write the context JSON on a helper thread so a handler that never reads
/// stdin cannot block capture.
fn write_context(mut stdin: std::process::ChildStdin, ctx: &TriggerContext) {
    let payload = match serde_json::to_vec(ctx) {
        Ok(payload) => payload,
        Err(e) => {
            error!(error = %e, "failed to encode handler context");
            return;
        }
    };
    thread::spawn(move || {
        if let Err(e) = stdin.write_all(&payload) {
            if e.kind() != std::io::ErrorKind::BrokenPipe {
                debug!(error = %e, "failed to write handler stdin");
            }
        }
    });
}

/// Execute a child process with timeout and output capture.
fn execute_with_timeout(
    child: &mut Child,
    timeout: Duration,
    max_output: usize,
) -> std::io::Result<Captured> {
    let deadline = Instant::now() + timeout;
    let mut captured = Captured {
        stdout: Vec::with_capacity(max_output.min(8192)),
        stderr: Vec::with_capacity(max_output.min(8192)),
        ..Captured::default()
    };

    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();
    let mut chunk = vec![0u8; 8192];

    loop {
        if Instant::now() >= deadline {
            captured.timed_out = true;
            kill_with_grace(child, Duration::from_millis(SIGTERM_GRACE_MS));
            break;
        }

        let mut did_read = false;
        if let Some(out) = stdout.as_mut() {
            did_read |= read_chunk(out, &mut chunk, &mut captured.stdout, max_output, &mut captured.truncated);
        }
        if let Some(err) = stderr.as_mut() {
            did_read |= read_chunk(err, &mut chunk, &mut captured.stderr, max_output, &mut captured.truncated);
        }

        match child.try_wait()? {
            Some(status) => {
                if let Some(out) = stdout.as_mut() {
                    drain_to_limit(out, &mut captured.stdout, max_output, &mut captured.truncated);
                }
                if let Some(err) = stderr.as_mut() {
                    drain_to_limit(err, &mut captured.stderr, max_output, &mut captured.truncated);
                }
                captured.exit_code = status.code();
                trace!(exit_code = ?captured.exit_code, "handler exited");
                return Ok(captured);
            }
            None if !did_read => thread::sleep(Duration::from_millis(10)),
            None => {}
        }
    }

    // Timed out; reap and keep whatever was captured.
    captured.exit_code = child.wait().ok().and_then(|s| s.code());
    Ok(captured)
}

/// One non-blocking read into `buf`, respecting `max`. Returns whether any
/// bytes arrived.
fn read_chunk<R: Read + AsRawFd>(
    stream: &mut R,
    chunk: &mut [u8],
    buf: &mut Vec<u8>,
    max: usize,
    truncated: &mut bool,
) -> bool {
    match try_read_nonblocking(stream, chunk) {
        Ok(n) if n > 0 => {
            append_limited(buf, &chunk[..n], max, truncated);
            true
        }
        _ => false,
    }
}

fn append_limited(buf: &mut Vec<u8>, data: &[u8], max: usize, truncated: &mut bool) {
    let space = max.saturating_sub(buf.len());
    let to_copy = data.len().min(space);
    buf.extend_from_slice(&data[..to_copy]);
    if data.len() > space {
        *truncated = true;
    }
}

/// Drain whatever is immediately available after exit.
///
/// Non-blocking so a grandchild still holding the pipe open cannot hang us.
fn drain_to_limit<R: Read + AsRawFd>(
    stream: &mut R,
    buf: &mut Vec<u8>,
    max: usize,
    truncated: &mut bool,
) {
    let mut chunk = vec![0u8; 8192];
    while !*truncated {
        match try_read_nonblocking(stream, &mut chunk) {
            Ok(0) | Err(_) => break,
            Ok(n) => append_limited(buf, &chunk[..n], max, truncated),
        }
    }
}

/// SIGTERM the child's process group, then SIGKILL once `grace` runs out.
/// Returns whether the child exited within the grace period.
fn kill_with_grace(child: &mut Child, grace: Duration) -> bool {
    let pgid = child.id() as i32;

    unsafe {
        libc::kill(-pgid, libc::SIGTERM);
    }
    debug!(pid = pgid, "sent SIGTERM to handler group");

    let deadline = Instant::now() + grace;
    loop {
        match child.try_wait() {
            Ok(Some(_)) => {
                trace!(pid = pgid, "handler exited after SIGTERM");
                return true;
            }
            Ok(None) if Instant::now() < deadline => thread::sleep(Duration::from_millis(10)),
            Ok(None) => break,
            Err(e) => {
                error!(pid = pgid, error = %e, "failed to check handler status");
                break;
            }
        }
    }

    warn!(pid = pgid, "handler did not exit after SIGTERM, sending SIGKILL");
    unsafe {
        libc::kill(-pgid, libc::SIGKILL);
    }
    false
}

/// Read without blocking. Returns `Ok(0)` when no data is available.
fn try_read_nonblocking<R: Read + AsRawFd>(
    stream: &mut R,
    buf: &mut [u8],
) -> std::io::Result<usize> {
    let fd = stream.as_raw_fd();

    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(std::io::Error::last_os_error());
    }

    let was_nonblocking = (flags & libc::O_NONBLOCK) != 0;
    if !was_nonblocking {
        let result = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
        if result < 0 {
            return Err(std::io::Error::last_os_error());
        }
    }

    let result = stream.read(buf);

    if !was_nonblocking {
        unsafe {
            libc::fcntl(fd, libc::F_SETFL, flags);
        }
    }

    match result {
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(0),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sparcus_common::ReadingKey;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn context(value: &str) -> TriggerContext {
        let store = TimeSeriesStore::new();
        let path = RequestPath::parse("sensors/temp").unwrap();
        for v in ["1", "2", "3"] {
            store.update(&path.key(), v);
        }
        TriggerContext::build(&store, &path, value)
    }

    fn dispatcher(timeout_ms: u64, max_output_bytes: usize) -> TriggerDispatcher {
        TriggerDispatcher::new(DispatchConfig {
            timeout: Duration::from_millis(timeout_ms),
            max_output_bytes,
        })
    }

    #[test]
    fn test_context_averages() {
        let ctx = context("3");
        assert_eq!(ctx.path, "sensors/temp");
        assert_eq!(ctx.key, "sensors.temp");
        assert_eq!(ctx.avg_3, "2.000000");
        assert_eq!(ctx.avg_5, "1.200000");
        assert_eq!(ctx.avg_10, "0.600000");
    }

    #[test]
    fn test_context_without_numbers_has_empty_averages() {
        let store = TimeSeriesStore::new();
        let path = RequestPath::parse("door").unwrap();
        store.update(&ReadingKey::parse("door").unwrap(), "open");
        let ctx = TriggerContext::build(&store, &path, "open");
        assert_eq!(ctx.avg_3, "");
        assert_eq!(ctx.avg_10, "");
    }

    #[test]
    fn test_env_vars_reach_child() {
        let dir = TempDir::new().unwrap();
        let handler = script(
            dir.path(),
            "env.sh",
            r#"echo "$EVENT_VALUE|$EVENT_PATH|$EVENT_PATH_DOTTED|$EVENT_VALUE_AVG_3|$EVENT_VALUE_AVG_5|$EVENT_VALUE_AVG_10""#,
        );
        let event = dispatcher(5000, 4096).run(&handler, &context("3"));
        assert_eq!(event.exit_code, Some(0));
        assert_eq!(
            event.stdout.trim(),
            "3|sensors/temp|sensors.temp|2.000000|1.200000|0.600000"
        );
        assert_eq!(event.uri, "sensors.temp");
        assert!(std::env::var("EVENT_VALUE").is_err());
    }

    #[test]
    fn test_context_json_on_stdin() {
        let dir = TempDir::new().unwrap();
        let handler = script(dir.path(), "cat.sh", "cat");
        let event = dispatcher(5000, 4096).run(&handler, &context("hello"));
        let parsed: TriggerContext = serde_json::from_str(&event.stdout).unwrap();
        assert_eq!(parsed, context("hello"));
    }

    #[test]
    fn test_nonzero_exit_recorded() {
        let dir = TempDir::new().unwrap();
        let handler = script(dir.path(), "fail.sh", "echo oops >&2\nexit 42");
        let event = dispatcher(5000, 4096).run(&handler, &context("1"));
        assert_eq!(event.exit_code, Some(42));
        assert_eq!(event.stderr.trim(), "oops");
        assert_eq!(DispatchOutcome::of(&event), DispatchOutcome::Failed);
    }

    #[test]
    fn test_spawn_failure_recorded() {
        let event = dispatcher(5000, 4096).run(Path::new("/nonexistent/handler"), &context("1"));
        assert!(event.error.is_some());
        assert_eq!(event.exit_code, None);
        assert_eq!(DispatchOutcome::of(&event), DispatchOutcome::SpawnError);
    }

    #[test]
    fn test_timeout_kills_handler() {
        let dir = TempDir::new().unwrap();
        let handler = script(dir.path(), "hang.sh", "echo started\nsleep 10");
        let start = Instant::now();
        let event = dispatcher(200, 4096).run(&handler, &context("1"));
        assert!(event.timed_out);
        assert!(start.elapsed() < Duration::from_secs(3));
        assert_eq!(DispatchOutcome::of(&event), DispatchOutcome::Timeout);
    }

    fn spawn_grouped(program: &str, args: &[&str]) -> Child {
        Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .spawn()
            .unwrap()
    }

    #[test]
    fn test_kill_returns_once_handler_exits() {
        let mut child = spawn_grouped("sleep", &["30"]);
        let start = Instant::now();
        assert!(kill_with_grace(&mut child, Duration::from_secs(5)));
        assert!(start.elapsed() < Duration::from_secs(2));
        assert!(child.try_wait().unwrap().is_some());
    }

    #[test]
    fn test_kill_escalates_when_sigterm_ignored() {
        let mut child = spawn_grouped("sh", &["-c", "trap '' TERM; while :; do sleep 1; done"]);
        // Let the shell install its trap before signalling.
        thread::sleep(Duration::from_millis(200));
        let start = Instant::now();
        assert!(!kill_with_grace(&mut child, Duration::from_millis(300)));
        assert!(start.elapsed() >= Duration::from_millis(300));
        assert!(child.wait().unwrap().code().is_none());
    }

    #[test]
    fn test_output_truncation() {
        let dir = TempDir::new().unwrap();
        let handler = script(dir.path(), "noisy.sh", "yes | head -n 10000");
        let event = dispatcher(5000, 100).run(&handler, &context("1"));
        assert!(event.truncated);
        assert!(event.stdout.len() <= 100);
    }

    #[test]
    fn test_dispatch_continues_after_failure() {
        let dir = TempDir::new().unwrap();
        let handlers = vec![
            PathBuf::from("/nonexistent/first"),
            script(dir.path(), "b.sh", "exit 1"),
            script(dir.path(), "c.sh", "echo done"),
        ];
        let log = EventLog::new(10);
        let events = dispatcher(5000, 4096).dispatch(&handlers, &context("1"), &log);

        assert_eq!(events.len(), 3);
        assert_eq!(log.len(), 3);
        let outcomes: Vec<_> = events.iter().map(DispatchOutcome::of).collect();
        assert_eq!(
            outcomes,
            vec![
                DispatchOutcome::SpawnError,
                DispatchOutcome::Failed,
                DispatchOutcome::Success
            ]
        );
        assert_eq!(log.all()[2].stdout.trim(), "done");
    }
}

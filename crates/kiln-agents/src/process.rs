// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Shared subprocess supervisor.
//!
//! All adapters drive their CLI through [`drive`]: spawn with a sanitized
//! environment, consume stdout line by line, hand assembled records to the
//! adapter's [`RecordParser`], and classify the exit.  The supervisor owns
//! the hard parts — multi-line record reassembly, garbage tolerance,
//! cooperative cancellation with a bounded kill grace, and the guarantee
//! that every stream ends with exactly one terminal `Status`.
//!
//! Parser state machine per run:
//!
//! ```text
//!   Idle ──first parseable record──▶ Streaming ──parseable──▶ Streaming
//!     │                                 │  unparseable: buffer ≤ 64 KiB, then discard
//!     │                                 └──subprocess exit──▶ Terminal
//!     └───────── cancellation ──▶ Terminating ──grace──▶ Terminal{cancelled}
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use kiln_protocol::{CanonicalEvent, ErrorKind, Phase};

use crate::adapter::{Availability, EventStream};

/// Unparseable output is buffered up to this many bytes waiting for a record
/// boundary, then discarded with a warning.
const GARBAGE_LIMIT_BYTES: usize = 64 * 1024;

/// Ring kept from the end of stderr for exit diagnostics.
const STDERR_TAIL_BYTES: usize = 8 * 1024;

/// Environment variables every adapter subprocess inherits.
const BASE_ENV: &[&str] = &["PATH", "HOME"];

// ── Record parsing contract ───────────────────────────────────────────────────

/// Outcome of feeding one assembled chunk of output to a dialect parser.
#[derive(Debug)]
pub enum Parsed {
    /// A complete native record; emit these canonical events.
    Events(Vec<CanonicalEvent>),
    /// Not (yet) a complete record; the supervisor buffers the chunk and
    /// retries with the accumulated block on the next line.
    Incomplete,
}

/// Per-adapter dialect parser.  Implementations are plain state machines;
/// all I/O and lifecycle handling lives in the supervisor.
pub trait RecordParser: Send {
    /// Try to parse one record (a line, or an accumulated multi-line block).
    fn parse_record(&mut self, record: &str) -> Parsed;

    /// Classify a failure from discarded output and the stderr tail when the
    /// subprocess died before emitting a single parseable event.  `None`
    /// falls back to `crashed_before_first_event`.
    fn classify_failure(&self, _garbage: &str, _stderr_tail: &str) -> Option<ErrorKind> {
        None
    }
}

// ── Invocation ────────────────────────────────────────────────────────────────

/// A fully built CLI invocation, ready to spawn.
pub struct CliInvocation {
    pub program: String,
    pub args: Vec<String>,
    pub workspace: PathBuf,
    /// Adapter-specific environment variables passed through from the
    /// parent, on top of the base set (`PATH`, `HOME`).
    pub env_passthrough: &'static [&'static str],
    /// Payload written to the child's stdin, when the CLI takes the
    /// instruction that way.  stdin is closed afterwards either way.
    pub stdin_payload: Option<String>,
    pub cancel: CancellationToken,
    pub cancel_grace: Duration,
}

fn sanitized_env(passthrough: &[&str]) -> HashMap<String, String> {
    let mut env = HashMap::new();
    for key in BASE_ENV.iter().chain(passthrough.iter()) {
        if let Ok(value) = std::env::var(key) {
            env.insert((*key).to_string(), value);
        }
    }
    // Keep CLIs from emitting ANSI sequences into the record stream.
    env.insert("TERM".to_string(), "dumb".to_string());
    env.insert("NO_COLOR".to_string(), "1".to_string());
    env
}

fn build_command(inv: &CliInvocation) -> Command {
    let mut cmd = Command::new(&inv.program);
    cmd.args(&inv.args);
    cmd.current_dir(&inv.workspace);
    cmd.env_clear();
    cmd.envs(sanitized_env(inv.env_passthrough));
    cmd.stdin(if inv.stdin_payload.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    // When the returned stream is dropped mid-run the child must not outlive
    // it; tokio sends SIGKILL before releasing the handle.
    cmd.kill_on_drop(true);
    // setsid() gives the child its own process group so the soft interrupt
    // reaches the whole tree (CLIs spawn their own tool subprocesses).
    #[cfg(unix)]
    unsafe {
        cmd.pre_exec(|| {
            libc::setsid();
            Ok(())
        });
    }
    cmd
}

#[cfg(unix)]
fn interrupt(child: &Child) {
    if let Some(pid) = child.id() {
        // Negative pid targets the process group created by setsid().
        unsafe {
            libc::kill(-(pid as i32), libc::SIGINT);
        }
    }
}

#[cfg(not(unix))]
fn interrupt(_child: &Child) {
    // No soft interrupt available; the grace window expires into a kill.
}

// ── Supervisor ────────────────────────────────────────────────────────────────

/// Spawn the CLI and translate its output through `parser` into a canonical
/// event stream.  The stream is lazy (nothing happens until polled), finite,
/// and always ends with exactly one terminal `Status`.
pub fn drive(inv: CliInvocation, parser: impl RecordParser + 'static) -> EventStream {
    Box::pin(async_stream::stream! {
        let mut parser = parser;
        let cancel = inv.cancel.clone();
        let grace = inv.cancel_grace;
        let stdin_payload = inv.stdin_payload.clone();
        let program = inv.program.clone();

        let mut child = match build_command(&inv).spawn() {
            Ok(child) => child,
            Err(e) => {
                let kind = if e.kind() == std::io::ErrorKind::NotFound {
                    ErrorKind::CliNotInstalled
                } else {
                    ErrorKind::SpawnFailed
                };
                yield CanonicalEvent::error(kind, format!("spawning {program}: {e}"));
                yield CanonicalEvent::status(Phase::Failed { kind });
                return;
            }
        };

        // Feed the instruction over stdin, then close it so the CLI sees EOF.
        if let Some(payload) = stdin_payload {
            if let Some(mut stdin) = child.stdin.take() {
                use tokio::io::AsyncWriteExt;
                if let Err(e) = stdin.write_all(payload.as_bytes()).await {
                    debug!("writing instruction to {program} stdin: {e}");
                }
                drop(stdin);
            }
        }

        // Drain stderr concurrently, keeping only the tail for diagnostics.
        let stderr_tail = Arc::new(Mutex::new(Vec::<u8>::new()));
        if let Some(mut stderr) = child.stderr.take() {
            let tail = stderr_tail.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    match stderr.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            let mut tail = tail.lock().await;
                            tail.extend_from_slice(&buf[..n]);
                            let excess = tail.len().saturating_sub(STDERR_TAIL_BYTES);
                            if excess > 0 {
                                tail.drain(..excess);
                            }
                        }
                    }
                }
            });
        }

        let stdout = match child.stdout.take() {
            Some(stdout) => stdout,
            None => {
                yield CanonicalEvent::error(ErrorKind::Internal, "child stdout not captured");
                yield CanonicalEvent::status(Phase::Failed { kind: ErrorKind::Internal });
                return;
            }
        };
        let mut lines = BufReader::new(stdout).lines();

        let mut pending = String::new();
        let mut garbage = String::new();
        let mut saw_record = false;
        let mut terminal_sent = false;
        let mut last_error_kind: Option<ErrorKind> = None;
        let mut cancelled = false;

        loop {
            let line = tokio::select! {
                biased;
                _ = cancel.cancelled(), if !cancelled => {
                    cancelled = true;
                    debug!(%program, "cancellation requested, interrupting process group");
                    interrupt(&child);
                    // Bounded grace, then hard kill.  Remaining output is
                    // discarded — the terminal event is always `cancelled`.
                    if tokio::time::timeout(grace, child.wait()).await.is_err() {
                        warn!(%program, "grace expired, killing");
                        let _ = child.kill().await;
                    }
                    break;
                }
                line = lines.next_line() => line,
            };

            let line = match line {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    debug!(%program, "stdout read error: {e}");
                    break;
                }
            };

            // Record reassembly: a line either parses on its own, parses as
            // the tail of a buffered multi-line block, or joins the buffer.
            // When a buffered block never completes but the new line parses
            // alone, the block was garbage — discard it and take the line.
            let candidate = if pending.is_empty() {
                line.clone()
            } else {
                format!("{pending}\n{line}")
            };
            let parsed = match parser.parse_record(&candidate) {
                Parsed::Events(events) => {
                    pending.clear();
                    Some(events)
                }
                Parsed::Incomplete if !pending.is_empty() => match parser.parse_record(&line) {
                    Parsed::Events(events) => {
                        warn!(%program, bytes = pending.len(), "discarding unparseable output");
                        garbage.push_str(&pending);
                        pending.clear();
                        Some(events)
                    }
                    Parsed::Incomplete => {
                        pending = candidate;
                        None
                    }
                },
                Parsed::Incomplete => {
                    pending = candidate;
                    None
                }
            };
            if let Some(events) = parsed {
                saw_record = true;
                for event in events {
                    if terminal_sent {
                        // Invariant: nothing follows the terminal status.
                        debug!(%program, "dropping event after terminal status");
                        continue;
                    }
                    if let CanonicalEvent::Error { kind, .. } = &event {
                        last_error_kind = Some(*kind);
                    }
                    if event.is_terminal() {
                        terminal_sent = true;
                    }
                    yield event;
                }
            }
            if pending.len() > GARBAGE_LIMIT_BYTES {
                warn!(%program, bytes = pending.len(), "discarding unparseable output");
                garbage.push_str(&pending);
                pending.clear();
            }
            if garbage.len() > GARBAGE_LIMIT_BYTES {
                garbage.clear();
            }
        }

        if !pending.is_empty() {
            debug!(%program, bytes = pending.len(), "discarding trailing partial record");
            garbage.push_str(&pending);
        }

        // Reap.  On the cancel path the child has already been waited/killed.
        let status = child.wait().await.ok();
        let stderr_tail = String::from_utf8_lossy(&stderr_tail.lock().await).to_string();

        if cancelled {
            if !terminal_sent {
                yield CanonicalEvent::status(Phase::Cancelled);
            }
            return;
        }
        if terminal_sent {
            return;
        }

        // The stream ended without a native terminal record: classify.
        let exit_ok = status.map(|s| s.success()).unwrap_or(false);
        if exit_ok && saw_record {
            yield CanonicalEvent::status(Phase::Complete);
        } else if saw_record {
            let kind = last_error_kind.unwrap_or(ErrorKind::Protocol);
            yield CanonicalEvent::status(Phase::Failed { kind });
        } else {
            let kind = parser
                .classify_failure(&garbage, &stderr_tail)
                .unwrap_or(ErrorKind::CrashedBeforeFirstEvent);
            let detail = if stderr_tail.is_empty() {
                format!("{program} exited with {status:?} before emitting any event")
            } else {
                format!(
                    "{program} exited with {status:?} before emitting any event: {}",
                    stderr_tail.trim_end()
                )
            };
            yield CanonicalEvent::error(kind, detail);
            yield CanonicalEvent::status(Phase::Failed { kind });
        }
    })
}

// ── Version probe ─────────────────────────────────────────────────────────────

/// Run `<program> --version` with a short timeout.  Missing binary or
/// non-zero exit is reported as not installed.
pub async fn probe_version(program: &str) -> Availability {
    let mut cmd = Command::new(program);
    cmd.arg("--version");
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::null());
    cmd.kill_on_drop(true);

    let result = tokio::time::timeout(Duration::from_secs(5), cmd.output()).await;
    match result {
        Ok(Ok(output)) if output.status.success() => {
            let version = String::from_utf8_lossy(&output.stdout)
                .lines()
                .next()
                .unwrap_or("")
                .trim()
                .to_string();
            Availability::installed(version)
        }
        Ok(Ok(output)) => Availability::missing(format!(
            "{program} --version exited with {}",
            output.status
        )),
        Ok(Err(e)) => Availability::missing(format!("{program}: {e}")),
        Err(_) => Availability::missing(format!("{program} --version timed out")),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

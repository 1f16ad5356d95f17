//! `ProcessRunner` — launches one command per attempt and turns whatever
//! happens to it into an [`ExecOutcome`].
//!
//! The runner never returns an error: start failures, abnormal exits and
//! cancellation all become a status plus a line in the log.

use std::{process::Stdio, time::Duration};

use crondeck_core::{STATUS_ERROR, STATUS_OK};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader},
    process::{Child, Command},
    sync::mpsc,
    task::JoinHandle,
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    error::RunnerError,
    types::{ExecOutcome, ExecRequest},
};

/// How long output readers may keep draining after a cancelled process was
/// killed. Grandchildren can hold the pipes open indefinitely.
const CANCEL_DRAIN_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner {
    /// Mirror captured output to our own stdout as it arrives.
    echo: bool,
}

impl ProcessRunner {
    pub fn new(echo: bool) -> Self {
        Self { echo }
    }

    /// Run `req` to completion, or until `cancel` fires.
    pub async fn run(&self, req: &ExecRequest, cancel: &CancellationToken) -> ExecOutcome {
        let started = Instant::now();

        let Some((program, args)) = req.command.split_first() else {
            return ExecOutcome::failed(RunnerError::EmptyCommand, started.elapsed());
        };

        let mut cmd = Command::new(program);
        cmd.args(args)
            .envs(&req.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &req.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(source) => {
                let err = RunnerError::Spawn {
                    program: program.clone(),
                    source,
                };
                warn!(%program, "{err}");
                return ExecOutcome::failed(err, started.elapsed());
            }
        };
        debug!(%program, pid = ?child.id(), "process started");

        let capture = OutputCapture::start(&mut child, self.echo);

        let waited = tokio::select! {
            biased;
            res = child.wait() => Some(res),
            _ = cancel.cancelled() => None,
        };

        let (status, trailer, cancelled) = match waited {
            Some(Ok(exit)) if exit.success() => (STATUS_OK, None, false),
            Some(Ok(exit)) => match exit.code() {
                Some(code) => (code, Some(format!("Exit code: {code}")), false),
                None => (
                    STATUS_ERROR,
                    Some(format!("job terminated abnormally: {exit}")),
                    false,
                ),
            },
            Some(Err(e)) => (STATUS_ERROR, Some(RunnerError::Wait(e).to_string()), false),
            None => {
                if let Err(e) = child.kill().await {
                    warn!(%program, "failed to kill cancelled process: {e}");
                }
                info!(%program, "process killed on cancellation");
                (STATUS_ERROR, Some("job was cancelled".to_string()), true)
            }
        };

        let grace = cancelled.then_some(CANCEL_DRAIN_GRACE);
        let mut log = capture.finish(grace).await;
        if let Some(line) = trailer {
            if !log.is_empty() && !log.ends_with('\n') {
                log.push('\n');
            }
            log.push_str(&line);
            log.push('\n');
        }

        ExecOutcome {
            status,
            log,
            duration: started.elapsed(),
            cancelled,
        }
    }
}

// ---------------------------------------------------------------------------
// Output capture
// ---------------------------------------------------------------------------

/// Two pipe readers feeding one collector. Only the collector touches the
/// log buffer.
struct OutputCapture {
    readers: Vec<JoinHandle<()>>,
    collector: JoinHandle<String>,
}

impl OutputCapture {
    fn start(child: &mut Child, echo: bool) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut readers = Vec::with_capacity(2);
        if let Some(out) = child.stdout.take() {
            readers.push(tokio::spawn(pump(out, tx.clone())));
        }
        if let Some(err) = child.stderr.take() {
            readers.push(tokio::spawn(pump(err, tx.clone())));
        }
        drop(tx);

        Self {
            readers,
            collector: tokio::spawn(collect(rx, echo)),
        }
    }

    /// Wait for the pipes to close and return the captured text. With a
    /// grace period, readers still open after it are abandoned.
    async fn finish(self, grace: Option<Duration>) -> String {
        for mut reader in self.readers {
            match grace {
                Some(limit) => {
                    if tokio::time::timeout(limit, &mut reader).await.is_err() {
                        debug!("output reader still open after cancellation; abandoning");
                        reader.abort();
                    }
                }
                None => {
                    let _ = reader.await;
                }
            }
        }
        self.collector.await.unwrap_or_default()
    }
}

async fn pump<R: AsyncRead + Unpin>(stream: R, tx: mpsc::UnboundedSender<Vec<u8>>) {
    let mut reader = BufReader::new(stream);
    loop {
        let mut line = Vec::new();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                if tx.send(line).is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!("output pipe read failed: {e}");
                break;
            }
        }
    }
}

async fn collect(mut rx: mpsc::UnboundedReceiver<Vec<u8>>, echo: bool) -> String {
    let mut buf = String::new();
    let mut stdout = tokio::io::stdout();
    while let Some(chunk) = rx.recv().await {
        if echo {
            let _ = stdout.write_all(&chunk).await;
        }
        buf.push_str(&String::from_utf8_lossy(&chunk));
    }
    if echo {
        let _ = stdout.flush().await;
    }
    buf
}

//! Supervised harness runs against a live instance.
//!
//! A run owns a scratch directory holding the extracted test archive. Output lines are fanned out
//! over a broadcast channel and terminated by an explicit [`OutputEvent::End`]. Normal completion
//! and [`TestRun::kill`] both end in [`Shared::finish`], which publishes the end marker and
//! removes the scratch directory at most once.

mod archive;
pub mod callback;
pub mod screenshots;

use std::{
    io,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    sync::{Arc, Mutex as StdMutex, PoisonError},
};

use bytes::Bytes;
use tempfile::TempDir;
use thiserror::Error;
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines},
    process::{Child, Command},
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

pub use self::callback::{Callback, CallbackError};
use self::{
    callback::Report,
    screenshots::Screenshots,
};
use crate::process::{terminate, KillBudget};

const OUTPUT_BUFFER: usize = 1024;

/// Harness entry point and its fixed inputs.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub runner: PathBuf,
    pub loghash: PathBuf,
    pub python: PathBuf,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            runner: PathBuf::from("/home/vagrant/pebble-test/runner.py"),
            loghash: PathBuf::from("/home/vagrant/loghash/loghash_dict.json"),
            python: PathBuf::from("python"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TestOptions {
    /// Capture the firmware serial log into the scratch directory.
    pub debug: bool,
    /// Keep running past failures and report newly created screenshots.
    pub update: bool,
}

/// Instance sockets the harness drives.
#[derive(Debug, Clone, Copy)]
pub struct RunTarget {
    pub console: u16,
    pub companion_link: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestOutcome {
    Passed,
    Failed,
    /// Any other exit. `None` when the harness was killed or never produced an exit code.
    Error(Option<i32>),
}

impl TestOutcome {
    pub fn from_status(status: ExitStatus) -> Self {
        match status.code() {
            Some(0) => Self::Passed,
            Some(1) => Self::Failed,
            code => Self::Error(code),
        }
    }

    pub fn status(self) -> &'static str {
        match self {
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Error(_) => "error",
        }
    }

    pub fn code(self) -> Option<i32> {
        match self {
            Self::Passed => Some(0),
            Self::Failed => Some(1),
            Self::Error(code) => code,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputEvent {
    Line(String),
    End(TestOutcome),
}

#[derive(Debug, Error)]
pub enum TestRunError {
    #[error("invalid test archive: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("failed to create test scratch directory: {0}")]
    Scratch(#[source] io::Error),

    #[error("failed to spawn test harness: {0}")]
    Spawn(#[source] io::Error),

    #[error("archive extraction task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl TestRunError {
    /// Whether the caller sent an archive that cannot be read.
    pub fn is_bad_archive(&self) -> bool {
        matches!(self, Self::Archive(_))
    }
}

/// Everything needed to start one run.
#[derive(Debug, Clone)]
pub struct TestRequest {
    pub archive: Bytes,
    pub target: RunTarget,
    pub callback: Option<Callback>,
    pub options: TestOptions,
}

pub struct TestRun {
    shared: Arc<Shared>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    events: broadcast::Sender<OutputEvent>,
    state: StdMutex<RunState>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct RunState {
    scratch: Option<TempDir>,
    outcome: Option<TestOutcome>,
}

struct Supervisor {
    shared: Arc<Shared>,
    child: Child,
    scratch: PathBuf,
    baseline: Screenshots,
    callback: Option<Callback>,
    options: TestOptions,
    http: reqwest::Client,
}

impl TestRun {
    /// Extracts the archive, spawns the harness and starts supervising it.
    pub async fn start(
        request: TestRequest,
        harness: &HarnessConfig,
        http: reqwest::Client,
    ) -> Result<Arc<Self>, TestRunError> {
        let TestRequest {
            archive,
            target,
            callback,
            options,
        } = request;

        let (scratch, baseline) = tokio::task::spawn_blocking(move || archive::unpack(&archive))
            .await??;
        let scratch_path = scratch.path().to_path_buf();

        let child = harness_command(harness, &scratch_path, target, options)
            .spawn()
            .map_err(TestRunError::Spawn)?;
        tracing::info!(
            scratch = %scratch_path.display(),
            console = target.console,
            update = options.update,
            "started test harness"
        );

        let (events, _) = broadcast::channel(OUTPUT_BUFFER);
        let shared = Arc::new(Shared {
            events,
            state: StdMutex::new(RunState {
                scratch: Some(scratch),
                outcome: None,
            }),
            cancel: CancellationToken::new(),
        });

        let supervisor = Supervisor {
            shared: Arc::clone(&shared),
            child,
            scratch: scratch_path,
            baseline,
            callback,
            options,
            http,
        };
        let task = tokio::spawn(supervisor.run());

        Ok(Arc::new(Self {
            shared,
            supervisor: Mutex::new(Some(task)),
        }))
    }

    pub fn is_finished(&self) -> bool {
        self.shared.lock().outcome.is_some()
    }

    pub fn outcome(&self) -> Option<TestOutcome> {
        self.shared.lock().outcome
    }

    /// Output from now on. A finished run yields only its end marker.
    pub fn subscribe(&self) -> Subscription {
        let state = self.shared.lock();
        match state.outcome {
            Some(outcome) => Subscription::ended(outcome),
            None => Subscription {
                rx: Some(self.shared.events.subscribe()),
                end: None,
            },
        }
    }

    /// Stops the harness and cleans up. Idempotent.
    pub async fn kill(&self) {
        self.shared.cancel.cancel();
        if let Some(task) = self.supervisor.lock().await.take() {
            if let Err(err) = task.await {
                tracing::error!("test run supervisor failed: {err}");
            }
        }
        self.shared.finish(TestOutcome::Error(None));
    }
}

impl Shared {
    fn lock(&self) -> std::sync::MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, line: String) {
        // No subscribers is fine.
        let _ = self.events.send(OutputEvent::Line(line));
    }

    /// Records the outcome, closes subscribers and removes the scratch directory. Only the first
    /// call has any effect.
    fn finish(&self, outcome: TestOutcome) -> bool {
        let scratch = {
            let mut state = self.lock();
            if state.outcome.is_some() {
                return false;
            }
            state.outcome = Some(outcome);
            let _ = self.events.send(OutputEvent::End(outcome));
            state.scratch.take()
        };

        if let Some(scratch) = scratch {
            let path = scratch.path().to_path_buf();
            if let Err(err) = scratch.close() {
                tracing::warn!(scratch = %path.display(), "failed to remove test scratch: {err}");
            }
        }
        tracing::info!(result = outcome.status(), code = ?outcome.code(), "test run finished");
        true
    }
}

impl Supervisor {
    async fn run(mut self) {
        let Some((outcome, log)) = self.watch().await else {
            self.stop_harness().await;
            self.shared.finish(TestOutcome::Error(None));
            return;
        };

        let uploads = if self.options.update {
            let scratch = self.scratch.clone();
            let baseline = std::mem::take(&mut self.baseline);
            match tokio::task::spawn_blocking(move || {
                screenshots::first_new(&baseline, &screenshots::scan(&scratch))
            })
            .await
            {
                Ok(uploads) => uploads,
                Err(err) => {
                    tracing::warn!("screenshot scan failed: {err}");
                    None
                }
            }
        } else {
            None
        };

        if let Some(callback) = self.callback.take() {
            let report = Report {
                outcome,
                log: &log,
                uploads,
            };
            tokio::select! {
                biased;
                _ = self.shared.cancel.cancelled() => {}
                result = callback::post(&self.http, &callback, report, &self.scratch) => {
                    if let Err(err) = result {
                        tracing::warn!(url = %callback.url, "test result callback failed: {err}");
                    }
                }
            }
        }

        self.shared.finish(outcome);
    }

    /// Streams harness output until it exits. `None` if the run was cancelled first.
    async fn watch(&mut self) -> Option<(TestOutcome, String)> {
        let mut stdout = self.child.stdout.take().map(|out| BufReader::new(out).lines());
        let mut stderr = self.child.stderr.take().map(|err| BufReader::new(err).lines());
        let mut log = String::new();

        while stdout.is_some() || stderr.is_some() {
            let line = tokio::select! {
                biased;
                _ = self.shared.cancel.cancelled() => return None,
                line = next_line(&mut stdout) => read_or_close(line, &mut stdout),
                line = next_line(&mut stderr) => read_or_close(line, &mut stderr),
            };
            if let Some(line) = line {
                log.push_str(&line);
                log.push('\n');
                self.shared.emit(line);
            }
        }

        let status = tokio::select! {
            biased;
            _ = self.shared.cancel.cancelled() => return None,
            status = self.child.wait() => status,
        };
        let outcome = match status {
            Ok(status) => TestOutcome::from_status(status),
            Err(err) => {
                tracing::warn!("failed to collect harness exit status: {err}");
                TestOutcome::Error(None)
            }
        };
        Some((outcome, log))
    }

    async fn stop_harness(&mut self) {
        let killed = terminate(&mut self.child, "test harness", KillBudget::default()).await;
        if let Err(err) = killed {
            tracing::error!("{err}");
        }
    }
}

async fn next_line<R>(lines: &mut Option<Lines<R>>) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    match lines {
        Some(lines) => lines.next_line().await,
        None => std::future::pending().await,
    }
}

fn read_or_close<R>(line: io::Result<Option<String>>, lines: &mut Option<Lines<R>>) -> Option<String> {
    match line {
        Ok(Some(line)) => Some(line),
        Ok(None) => {
            *lines = None;
            None
        }
        Err(err) => {
            tracing::debug!("harness output closed: {err}");
            *lines = None;
            None
        }
    }
}

fn harness_command(
    harness: &HarnessConfig,
    scratch: &Path,
    target: RunTarget,
    options: TestOptions,
) -> Command {
    let mut command = Command::new(&harness.python);
    command.arg(&harness.runner).arg("monkey");
    if options.update {
        command.arg("--update");
    } else {
        command.arg("--ff");
    }
    if options.debug {
        command
            .arg("--debug")
            .env("PEBBLE_SERIAL_LOG", scratch.join("serial.log"));
    }
    command
        .current_dir(scratch)
        .env("PEBBLE_LOGHASH_DICT", &harness.loghash)
        .env("PEBBLE_VIRTUAL_ONLY", "1")
        .env("PEBBLE_DEVICE", format!("socket://localhost:{}", target.console))
        .env(
            "PEBBLE_BT_DEVICE",
            format!("socket://localhost:{}", target.companion_link),
        )
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    command
}

/// Receives a run's output.
pub struct Subscription {
    rx: Option<broadcast::Receiver<OutputEvent>>,
    end: Option<TestOutcome>,
}

impl Subscription {
    fn ended(outcome: TestOutcome) -> Self {
        Self {
            rx: None,
            end: Some(outcome),
        }
    }

    /// The next event, or `None` once the end marker has been returned.
    ///
    /// A subscriber that falls behind skips the lines it missed.
    pub async fn next(&mut self) -> Option<OutputEvent> {
        if let Some(rx) = self.rx.as_mut() {
            loop {
                match rx.recv().await {
                    Ok(OutputEvent::End(outcome)) => {
                        self.rx = None;
                        return Some(OutputEvent::End(outcome));
                    }
                    Ok(event) => return Some(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "test output subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        self.rx = None;
                        return None;
                    }
                }
            }
        }
        self.end.take().map(OutputEvent::End)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::{io::Write, os::unix::fs::PermissionsExt, time::Duration};

    use zip::write::SimpleFileOptions;

    fn archive(files: &[(&str, &[u8])]) -> Bytes {
        let mut zip = zip::ZipWriter::new(io::Cursor::new(Vec::new()));
        for (name, data) in files {
            zip.start_file(*name, SimpleFileOptions::default()).unwrap();
            zip.write_all(data).unwrap();
        }
        Bytes::from(zip.finish().unwrap().into_inner())
    }

    fn harness(dir: &Path, body: &str) -> HarnessConfig {
        let python = dir.join("python");
        std::fs::write(&python, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&python, std::fs::Permissions::from_mode(0o755)).unwrap();
        HarnessConfig {
            runner: dir.join("runner.py"),
            loghash: dir.join("loghash.json"),
            python,
        }
    }

    fn request(archive: Bytes, options: TestOptions) -> TestRequest {
        TestRequest {
            archive,
            target: RunTarget {
                console: 4001,
                companion_link: 4002,
            },
            callback: None,
            options,
        }
    }

    async fn collect(mut subscription: Subscription) -> (Vec<String>, Option<TestOutcome>) {
        let mut lines = Vec::new();
        let mut end = None;
        while let Some(event) = subscription.next().await {
            match event {
                OutputEvent::Line(line) => lines.push(line),
                OutputEvent::End(outcome) => end = Some(outcome),
            }
        }
        (lines, end)
    }

    #[test]
    fn exit_codes_are_classified() {
        use std::os::unix::process::ExitStatusExt;

        assert_eq!(TestOutcome::from_status(ExitStatus::from_raw(0)), TestOutcome::Passed);
        assert_eq!(TestOutcome::from_status(ExitStatus::from_raw(1 << 8)), TestOutcome::Failed);
        assert_eq!(
            TestOutcome::from_status(ExitStatus::from_raw(2 << 8)),
            TestOutcome::Error(Some(2))
        );
        // Killed by SIGKILL.
        assert_eq!(TestOutcome::from_status(ExitStatus::from_raw(9)), TestOutcome::Error(None));
    }

    #[tokio::test]
    async fn streams_output_and_reports_failure() {
        let tools = tempfile::tempdir().unwrap();
        let harness = harness(
            tools.path(),
            "sleep 0.3\necho \"args $*\"\necho \"device $PEBBLE_DEVICE bt $PEBBLE_BT_DEVICE\"\ncat tests/suite/case.monkey\nexit 1",
        );
        let zip = archive(&[("tests/suite/case.monkey", b"expect screenshot home.png\n")]);

        let run = TestRun::start(request(zip, TestOptions::default()), &harness, reqwest::Client::new())
            .await
            .unwrap();
        let (lines, end) = collect(run.subscribe()).await;

        assert_eq!(end, Some(TestOutcome::Failed));
        assert_eq!(lines[0], format!("args {} monkey --ff", harness.runner.display()));
        assert_eq!(
            lines[1],
            "device socket://localhost:4001 bt socket://localhost:4002"
        );
        assert_eq!(lines[2], "expect screenshot home.png");
        assert!(run.is_finished());
        assert_eq!(run.outcome(), Some(TestOutcome::Failed));
    }

    #[tokio::test]
    async fn finished_run_yields_only_end_marker_and_removes_scratch() {
        let tools = tempfile::tempdir().unwrap();
        let marker = tools.path().join("scratch");
        let harness = harness(
            tools.path(),
            &format!("pwd > {}\nexit 0", marker.display()),
        );

        let run = TestRun::start(
            request(archive(&[("readme.txt", b"hi")]), TestOptions::default()),
            &harness,
            reqwest::Client::new(),
        )
        .await
        .unwrap();
        let (_, end) = collect(run.subscribe()).await;
        assert_eq!(end, Some(TestOutcome::Passed));

        let (lines, end) = collect(run.subscribe()).await;
        assert!(lines.is_empty());
        assert_eq!(end, Some(TestOutcome::Passed));

        let scratch = std::fs::read_to_string(&marker).unwrap();
        assert!(!Path::new(scratch.trim()).exists());
    }

    #[tokio::test]
    async fn kill_stops_harness_once() {
        let tools = tempfile::tempdir().unwrap();
        let harness = harness(tools.path(), "echo started\nexec sleep 30");

        let run = TestRun::start(
            request(archive(&[("readme.txt", b"hi")]), TestOptions::default()),
            &harness,
            reqwest::Client::new(),
        )
        .await
        .unwrap();
        let mut subscription = run.subscribe();

        tokio::time::timeout(Duration::from_secs(5), run.kill())
            .await
            .unwrap();
        run.kill().await;

        assert_eq!(run.outcome(), Some(TestOutcome::Error(None)));
        let mut end = None;
        while let Some(event) = subscription.next().await {
            if let OutputEvent::End(outcome) = event {
                end = Some(outcome);
            }
        }
        assert_eq!(end, Some(TestOutcome::Error(None)));
    }

    #[tokio::test]
    async fn update_mode_skips_fail_fast_and_sets_debug_log() {
        let tools = tempfile::tempdir().unwrap();
        let harness = harness(
            tools.path(),
            "echo \"args $*\"\necho \"serial $PEBBLE_SERIAL_LOG\"\nexit 3",
        );

        let run = TestRun::start(
            request(
                archive(&[("readme.txt", b"hi")]),
                TestOptions {
                    debug: true,
                    update: true,
                },
            ),
            &harness,
            reqwest::Client::new(),
        )
        .await
        .unwrap();
        let mut subscription = run.subscribe();
        let mut lines = Vec::new();
        let mut end = None;
        while let Some(event) = subscription.next().await {
            match event {
                OutputEvent::Line(line) => lines.push(line),
                OutputEvent::End(outcome) => end = Some(outcome),
            }
        }

        assert_eq!(end, Some(TestOutcome::Error(Some(3))));
        assert!(lines.iter().any(|line| line.ends_with("monkey --update --debug")));
        assert!(lines
            .iter()
            .any(|line| line.starts_with("serial /") && line.ends_with("/serial.log")));
    }

    #[tokio::test]
    async fn unreadable_archive_is_rejected() {
        let tools = tempfile::tempdir().unwrap();
        let harness = harness(tools.path(), "exit 0");

        let err = match TestRun::start(
            request(Bytes::from_static(b"not a zip"), TestOptions::default()),
            &harness,
            reqwest::Client::new(),
        )
        .await
        {
            Ok(_) => panic!("garbage archive was accepted"),
            Err(err) => err,
        };
        assert!(err.is_bad_archive(), "{err}");
    }
}

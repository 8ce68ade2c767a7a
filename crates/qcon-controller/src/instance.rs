use std::{
    ffi::OsString,
    future::Future,
    path::{Path, PathBuf},
    process::Stdio,
    sync::{Arc, Mutex as StdMutex, PoisonError},
};

use tempfile::{TempDir, TempPath};
use tokio::{
    io::AsyncWriteExt,
    process::{Child, Command},
    sync::Mutex,
    time::Instant,
};
use tokio_util::{
    sync::CancellationToken,
    task::{task_tracker::TrackedFuture, TaskTracker},
};
use uuid::Uuid;

use crate::{
    alloc::Ports,
    platform::Platform,
    process::{self, terminate},
    testrun::TestRun,
    ControllerConfig, InstanceError,
};

/// Read-only firmware image attached to every instance of a platform/version.
pub const MICRO_FLASH_IMAGE: &str = "qemu_micro_flash.bin";
/// Persistent storage image; each instance gets its own writable copy.
pub const SPI_FLASH_IMAGE: &str = "qemu_spi_flash.bin";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Starting,
    Ready,
    Dead,
}

/// What a caller asked to launch.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub token: String,
    pub platform: Platform,
    pub version: String,
    /// Offset from UTC in minutes, positive east.
    pub tz_offset: i32,
    pub oauth: Option<String>,
}

#[derive(Default)]
struct Resources {
    state: Option<InstanceState>,
    qemu: Option<Child>,
    pkjs: Option<Child>,
    spi_image: Option<TempPath>,
    persist_dir: Option<TempDir>,
}

/// One emulated device: the firmware emulator, its companion runtime and everything allocated
/// for them.
pub struct EmulatorInstance {
    id: Uuid,
    spec: LaunchSpec,
    config: Arc<ControllerConfig>,
    ports: Ports,
    resources: Mutex<Resources>,
    last_ping: StdMutex<Instant>,
    shutdown: CancellationToken,
    relays: TaskTracker,
    test_run: Mutex<Option<Arc<TestRun>>>,
}

impl EmulatorInstance {
    pub(crate) fn new(
        id: Uuid,
        spec: LaunchSpec,
        config: Arc<ControllerConfig>,
        ports: Ports,
    ) -> Self {
        Self {
            id,
            spec,
            config,
            ports,
            resources: Mutex::new(Resources {
                state: Some(InstanceState::Starting),
                ..Resources::default()
            }),
            last_ping: StdMutex::new(Instant::now()),
            shutdown: CancellationToken::new(),
            relays: TaskTracker::new(),
            test_run: Mutex::new(None),
        }
    }

    /// Allocates resources, boots the emulator and starts the companion runtime.
    ///
    /// On failure everything created so far is torn down before the error is returned.
    pub async fn launch(
        id: Uuid,
        spec: LaunchSpec,
        config: Arc<ControllerConfig>,
    ) -> Result<Arc<Self>, InstanceError> {
        let ports = Ports::allocate(config.debug).await?;
        let instance = Arc::new(Self::new(id, spec, config, ports));

        if let Err(err) = instance.run().await {
            tracing::warn!(instance = %id, "launch failed: {err}");
            if let Err(kill_err) = instance.kill().await {
                tracing::error!(instance = %id, "teardown after failed launch: {kill_err}");
            }
            return Err(err);
        }

        Ok(instance)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn spec(&self) -> &LaunchSpec {
        &self.spec
    }

    pub fn ports(&self) -> Ports {
        self.ports
    }

    pub async fn state(&self) -> InstanceState {
        self.resources
            .lock()
            .await
            .state
            .unwrap_or(InstanceState::Dead)
    }

    pub fn last_ping(&self) -> Instant {
        *self.last_ping.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn touch(&self, now: Instant) {
        *self.last_ping.lock().unwrap_or_else(PoisonError::into_inner) = now;
    }

    /// True while both subprocesses are running.
    pub async fn is_alive(&self) -> bool {
        let mut resources = self.resources.lock().await;
        let Resources { qemu, pkjs, .. } = &mut *resources;
        match (qemu.as_mut(), pkjs.as_mut()) {
            (Some(qemu), Some(pkjs)) => process::is_running(qemu) && process::is_running(pkjs),
            _ => false,
        }
    }

    /// True once [`Self::kill`] has started, before any resource is released.
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Token handed to each relay bound to this instance; cancelled by [`Self::kill`].
    pub fn relay_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    /// Registers a relay so [`Self::kill`] waits for it to finish.
    pub fn track_relay<F: Future>(&self, relay: F) -> TrackedFuture<F> {
        self.relays.track_future(relay)
    }

    pub(crate) fn test_run_slot(&self) -> &Mutex<Option<Arc<TestRun>>> {
        &self.test_run
    }

    /// Stops both subprocesses and releases everything the instance owns.
    ///
    /// Idempotent. Temporary files are removed even when a process refuses to die; the first
    /// such failure is returned once cleanup is complete.
    pub async fn kill(&self) -> Result<(), InstanceError> {
        self.shutdown.cancel();

        if let Some(run) = self.test_run.lock().await.take() {
            run.kill().await;
        }

        let mut failure = None;
        {
            let mut resources = self.resources.lock().await;
            resources.state = Some(InstanceState::Dead);

            if let Some(mut qemu) = resources.qemu.take() {
                if let Err(err) = terminate(&mut qemu, "qemu", self.config.kill).await {
                    failure.get_or_insert(err);
                }
            }
            if let Some(spi_image) = resources.spi_image.take() {
                if let Err(err) = spi_image.close() {
                    tracing::warn!(instance = %self.id, "failed to remove storage image: {err}");
                }
            }

            if let Some(mut pkjs) = resources.pkjs.take() {
                if let Err(err) = terminate(&mut pkjs, "pkjs", self.config.kill).await {
                    failure.get_or_insert(err);
                }
            }
            if let Some(persist_dir) = resources.persist_dir.take() {
                if let Err(err) = persist_dir.close() {
                    tracing::warn!(instance = %self.id, "failed to remove companion state: {err}");
                }
            }
        }

        self.relays.close();
        self.relays.wait().await;

        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn run(&self) -> Result<(), InstanceError> {
        let image_dir = self.image_dir();

        let spi_image = snapshot_storage_image(image_dir.join(SPI_FLASH_IMAGE)).await?;
        let spi_path = spi_image.to_path_buf();
        self.resources.lock().await.spi_image = Some(spi_image);

        let qemu = QemuInvocation {
            micro_flash: image_dir.join(MICRO_FLASH_IMAGE),
            spi_image: spi_path,
            platform: self.spec.platform,
            ports: self.ports,
        };
        let mut child = Command::new(&self.config.qemu_bin)
            .args(qemu.args())
            .current_dir(&self.config.qemu_dir)
            .stdin(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| InstanceError::Spawn {
                process: "qemu",
                source,
            })?;
        let stdin = child.stdin.take();
        self.resources.lock().await.qemu = Some(child);
        tracing::info!(
            instance = %self.id,
            platform = %self.spec.platform,
            version = %self.spec.version,
            console = self.ports.console,
            "spawned firmware emulator"
        );

        if let Some(mut stdin) = stdin {
            let password = vnc_password(&self.spec.token);
            let monitor = format!("change vnc password\n{password}\n");
            stdin
                .write_all(monitor.as_bytes())
                .await
                .map_err(InstanceError::Monitor)?;
            stdin.flush().await.map_err(InstanceError::Monitor)?;
        }

        self.config.boot.wait(self.ports.console).await?;
        self.transition(InstanceState::Starting, InstanceState::Ready)
            .await?;
        tracing::info!(instance = %self.id, "firmware booted");

        let persist_dir = tempfile::Builder::new()
            .prefix("qcon-persist-")
            .tempdir()
            .map_err(InstanceError::Scratch)?;
        let companion = CompanionInvocation {
            script: self.config.pkjs_bin.clone(),
            ports: self.ports,
            token: self.spec.token.clone(),
            persist_dir: persist_dir.path().to_path_buf(),
            oauth: self.spec.oauth.clone(),
            ssl_root: self.config.ssl_root.clone(),
        };
        self.resources.lock().await.persist_dir = Some(persist_dir);

        let mut command = Command::new(self.config.pkjs_virtualenv.join("bin").join("python"));
        command
            .args(companion.args())
            .env("TZ", posix_tz(self.spec.tz_offset))
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = companion.working_dir() {
            command.current_dir(dir);
        }
        let child = command.spawn().map_err(|source| InstanceError::Spawn {
            process: "pkjs",
            source,
        })?;
        self.resources.lock().await.pkjs = Some(child);
        tracing::info!(
            instance = %self.id,
            ws = self.ports.companion_ws,
            "spawned companion runtime"
        );

        Ok(())
    }

    /// Moves `from` to `to`; fails if the instance was killed while booting.
    async fn transition(&self, from: InstanceState, to: InstanceState) -> Result<(), InstanceError> {
        let mut resources = self.resources.lock().await;
        if resources.state != Some(from) {
            return Err(InstanceError::LaunchTimeout("instance was killed while booting"));
        }
        resources.state = Some(to);
        Ok(())
    }

    fn image_dir(&self) -> PathBuf {
        self.config
            .qemu_image_root
            .join(self.spec.platform.as_str())
            .join(&self.spec.version)
    }

    #[cfg(test)]
    pub(crate) async fn adopt(&self, qemu: Child, pkjs: Child) {
        let mut resources = self.resources.lock().await;
        resources.qemu = Some(qemu);
        resources.pkjs = Some(pkjs);
        resources.state = Some(InstanceState::Ready);
    }

    #[cfg(test)]
    pub(crate) async fn adopt_files(&self, spi_image: TempPath, persist_dir: TempDir) {
        let mut resources = self.resources.lock().await;
        resources.spi_image = Some(spi_image);
        resources.persist_dir = Some(persist_dir);
    }
}

/// Copies the platform's storage image into a private temp file.
async fn snapshot_storage_image(source: PathBuf) -> Result<TempPath, InstanceError> {
    let path = source.clone();
    let copied = tokio::task::spawn_blocking(move || -> std::io::Result<TempPath> {
        let mut image = tempfile::Builder::new()
            .prefix("qcon-spi-")
            .suffix(".bin")
            .tempfile()?;
        let mut source = std::fs::File::open(&source)?;
        std::io::copy(&mut source, image.as_file_mut())?;
        Ok(image.into_temp_path())
    })
    .await
    .map_err(|err| InstanceError::StorageImage {
        path: path.clone(),
        source: std::io::Error::other(err),
    })?;

    copied.map_err(|source| InstanceError::StorageImage { path, source })
}

/// The VNC server accepts at most eight password characters.
pub fn vnc_password(token: &str) -> String {
    token.chars().take(8).collect()
}

/// POSIX `TZ` value for an offset in minutes east of UTC.
///
/// POSIX offsets count west of UTC, hence the inverted sign on the hours.
pub fn posix_tz(offset_minutes: i32) -> String {
    let hours = offset_minutes.div_euclid(60);
    let minutes = offset_minutes.rem_euclid(60);
    format!("PBL{:+03}:{:02}", -hours, minutes)
}

/// Argument list for the firmware emulator.
#[derive(Debug, Clone)]
pub struct QemuInvocation {
    pub micro_flash: PathBuf,
    pub spi_image: PathBuf,
    pub platform: Platform,
    pub ports: Ports,
}

impl QemuInvocation {
    pub fn args(&self) -> Vec<OsString> {
        let ports = &self.ports;
        let profile = self.platform.profile();

        let mut args: Vec<OsString> = vec![
            "-rtc".into(),
            "base=localtime".into(),
            "-pflash".into(),
            self.micro_flash.clone().into(),
            "-serial".into(),
            "null".into(),
            "-serial".into(),
            format!("tcp:127.0.0.1:{},server,nowait", ports.companion_link).into(),
            "-serial".into(),
            format!("tcp:127.0.0.1:{},server", ports.console).into(),
            "-monitor".into(),
            "stdio".into(),
            "-vnc".into(),
            format!(":{},password,websocket={}", ports.vnc_display, ports.vnc_ws).into(),
            "-machine".into(),
            profile.machine.into(),
            profile.flash.flag().into(),
            self.spi_image.clone().into(),
            "-cpu".into(),
            profile.cpu.into(),
        ];
        if let Some(gdb) = ports.gdb {
            args.push("-gdb".into());
            args.push(format!("tcp::{gdb}").into());
        }
        args
    }
}

/// Argument list for the companion runtime.
#[derive(Debug, Clone)]
pub struct CompanionInvocation {
    pub script: PathBuf,
    pub ports: Ports,
    pub token: String,
    pub persist_dir: PathBuf,
    pub oauth: Option<String>,
    pub ssl_root: Option<PathBuf>,
}

impl CompanionInvocation {
    pub fn args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            self.script.clone().into(),
            "--qemu".into(),
            format!("127.0.0.1:{}", self.ports.companion_link).into(),
            "--port".into(),
            self.ports.companion_ws.to_string().into(),
            "--token".into(),
            self.token.clone().into(),
            "--persist".into(),
            self.persist_dir.clone().into(),
            "--block-private-addresses".into(),
        ];
        if let Some(oauth) = &self.oauth {
            args.push("--oauth".into());
            args.push(oauth.into());
        }
        if let Some(ssl_root) = &self.ssl_root {
            args.push("--ssl-root".into());
            args.push(ssl_root.clone().into());
        }
        args
    }

    /// The runtime resolves its resources relative to the script's directory.
    pub fn working_dir(&self) -> Option<&Path> {
        self.script
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
    }
}

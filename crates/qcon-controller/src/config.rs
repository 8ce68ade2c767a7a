use std::{
    ffi::OsString,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
};

use clap::Parser;

use crate::{boot::BootWait, process::KillBudget, testrun::HarnessConfig};

pub const DEFAULT_PORT: u16 = 5001;
pub const DEFAULT_EMULATOR_LIMIT: usize = 2;

#[derive(Debug, Clone, Parser)]
#[command(name = "qcon-controller", version, about)]
struct Args {
    /// Address the HTTP server binds to.
    ///
    /// Environment variable: `QCON_HOST`.
    #[arg(long, env = "QCON_HOST", default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    host: IpAddr,

    /// Port the HTTP server listens on.
    ///
    /// Environment variable: `QCON_PORT`.
    #[arg(long, env = "QCON_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Maximum number of emulators running (or starting) at once.
    ///
    /// Environment variable: `EMULATOR_LIMIT`.
    #[arg(long, env = "EMULATOR_LIMIT", default_value_t = DEFAULT_EMULATOR_LIMIT)]
    emulator_limit: usize,

    /// Working directory of the firmware emulator (BIOS and keymaps live here).
    ///
    /// Environment variable: `QEMU_DIR`.
    #[arg(long, env = "QEMU_DIR")]
    qemu_dir: PathBuf,

    /// Firmware emulator binary.
    ///
    /// Environment variable: `QEMU_BIN`.
    #[arg(long, env = "QEMU_BIN", default_value = "qemu-system-arm")]
    qemu_bin: PathBuf,

    /// Root of the firmware images, laid out as `<root>/<platform>/<version>/`.
    ///
    /// Environment variable: `QEMU_IMAGE_ROOT`.
    #[arg(long, env = "QEMU_IMAGE_ROOT")]
    qemu_image_root: PathBuf,

    /// Companion runtime entry point.
    ///
    /// Environment variable: `PKJS_BIN`.
    #[arg(long, env = "PKJS_BIN", default_value = "jskit.py")]
    pkjs_bin: PathBuf,

    /// Virtualenv whose `bin/python` runs the companion runtime.
    ///
    /// Environment variable: `PKJS_VIRTUALENV`.
    #[arg(long, env = "PKJS_VIRTUALENV")]
    pkjs_virtualenv: PathBuf,

    /// Shared secret expected verbatim in the `Authorization` header of launch requests.
    ///
    /// Environment variable: `LAUNCH_AUTH_HEADER`.
    #[arg(long, env = "LAUNCH_AUTH_HEADER", hide_env_values = true)]
    launch_auth_header: String,

    /// CA bundle for the emulator-side WebSocket servers. When set, tunnels dial `wss://`.
    ///
    /// Environment variable: `SSL_ROOT`.
    #[arg(long, env = "SSL_ROOT")]
    ssl_root: Option<PathBuf>,

    /// Console output that marks a finished boot. May be repeated.
    ///
    /// Environment variable: `QCON_READY_BANNERS` (comma separated).
    #[arg(long = "ready-banner", env = "QCON_READY_BANNERS", value_delimiter = ',')]
    ready_banners: Vec<String>,

    /// Test harness entry point.
    ///
    /// Environment variable: `MONKEY_RUNNER_PATH`.
    #[arg(
        long,
        env = "MONKEY_RUNNER_PATH",
        default_value = "/home/vagrant/pebble-test/runner.py"
    )]
    monkey_runner: PathBuf,

    /// Log hash dictionary handed to the test harness.
    ///
    /// Environment variable: `MONKEY_LOGHASH_PATH`.
    #[arg(
        long,
        env = "MONKEY_LOGHASH_PATH",
        default_value = "/home/vagrant/loghash/loghash_dict.json"
    )]
    monkey_loghash: PathBuf,

    /// Interpreter used to run the test harness.
    ///
    /// Environment variable: `MONKEY_PYTHON`.
    #[arg(long, env = "MONKEY_PYTHON", default_value = "python")]
    monkey_python: PathBuf,

    /// Expose a GDB stub on every emulator and log at `debug` level.
    ///
    /// Also enabled when the `DEBUG` environment variable is set, whatever its value.
    #[arg(long)]
    debug: bool,
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub listen_addr: SocketAddr,
    pub emulator_limit: usize,
    pub qemu_dir: PathBuf,
    pub qemu_bin: PathBuf,
    pub qemu_image_root: PathBuf,
    pub pkjs_bin: PathBuf,
    pub pkjs_virtualenv: PathBuf,
    pub launch_auth: String,
    pub ssl_root: Option<PathBuf>,
    pub boot: BootWait,
    pub kill: KillBudget,
    pub harness: HarnessConfig,
    pub debug: bool,
}

impl ControllerConfig {
    /// A configuration with every optional knob at its default.
    pub fn new(
        qemu_dir: impl Into<PathBuf>,
        qemu_image_root: impl Into<PathBuf>,
        pkjs_virtualenv: impl Into<PathBuf>,
        launch_auth: impl Into<String>,
    ) -> Self {
        Self {
            listen_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            emulator_limit: DEFAULT_EMULATOR_LIMIT,
            qemu_dir: qemu_dir.into(),
            qemu_bin: PathBuf::from("qemu-system-arm"),
            qemu_image_root: qemu_image_root.into(),
            pkjs_bin: PathBuf::from("jskit.py"),
            pkjs_virtualenv: pkjs_virtualenv.into(),
            launch_auth: launch_auth.into(),
            ssl_root: None,
            boot: BootWait::default(),
            kill: KillBudget::default(),
            harness: HarnessConfig::default(),
            debug: false,
        }
    }

    /// Parses command-line flags, falling back to the environment.
    pub fn load() -> Self {
        let args = Args::parse();

        let mut config = Self::new(
            args.qemu_dir,
            args.qemu_image_root,
            args.pkjs_virtualenv,
            args.launch_auth_header,
        );
        config.listen_addr = SocketAddr::new(args.host, args.port);
        config.emulator_limit = args.emulator_limit;
        config.qemu_bin = args.qemu_bin;
        config.pkjs_bin = args.pkjs_bin;
        config.ssl_root = args.ssl_root;
        config.debug = debug_enabled(args.debug, std::env::var_os("DEBUG"));
        config.harness = HarnessConfig {
            runner: args.monkey_runner,
            loghash: args.monkey_loghash,
            python: args.monkey_python,
        };

        let banners: Vec<String> = args
            .ready_banners
            .into_iter()
            .map(|banner| banner.trim().to_string())
            .filter(|banner| !banner.is_empty())
            .collect();
        if !banners.is_empty() {
            config.boot.banners = banners;
        }

        config
    }
}

/// `DEBUG` counts as set even when empty or `0`.
fn debug_enabled(flag: bool, env: Option<OsString>) -> bool {
    flag || env.is_some()
}

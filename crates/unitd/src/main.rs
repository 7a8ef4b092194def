//! unitd — the service manager binary.
//!
//! Usable both as PID 1 (where it also consumes kernel command line
//! tokens) and as a per-session manager. When invoked through an `init`
//! compatibility name by anything other than PID 1, the invocation is
//! handed to the control utility, matching traditional `init q`-style
//! usage.

use std::io::Read;

use clap::Parser;
use log::{error, warn};

use libunitd::config::{parse_log_level, Config, LogTarget, RunningAs};
use libunitd::entrypoints::service_manager::run_service_manager;
use libunitd::logging;

#[derive(Parser, Debug)]
#[command(name = "unitd", about = "unit-based service manager")]
struct CliArgs {
    /// Run as the system manager.
    #[arg(long)]
    system: bool,
    /// Run as a session manager for the current user.
    #[arg(long)]
    user: bool,
    /// Load units, print the startup transaction, and exit.
    #[arg(long)]
    test: bool,
    /// Print the recognized unit file directives and exit.
    #[arg(long)]
    dump_configuration_items: bool,
    /// Print the control interface description and exit.
    #[arg(long, value_name = "INTERFACE", num_args = 0..=1, default_missing_value = "")]
    introspect: Option<String>,
    /// Default unit to activate instead of default.target.
    #[arg(long)]
    unit: Option<String>,
    #[arg(long, num_args = 0..=1, default_missing_value = "yes")]
    dump_core: Option<String>,
    #[arg(long, num_args = 0..=1, default_missing_value = "yes")]
    crash_shell: Option<String>,
    #[arg(long, num_args = 0..=1, default_missing_value = "yes")]
    confirm_spawn: Option<String>,
    #[arg(long, num_args = 0..=1, default_missing_value = "yes")]
    show_status: Option<String>,
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,
    #[arg(long, value_name = "TARGET")]
    log_target: Option<String>,
    #[arg(long, num_args = 0..=1, default_missing_value = "yes")]
    log_color: Option<String>,
    #[arg(long, num_args = 0..=1, default_missing_value = "yes")]
    log_location: Option<String>,
    /// File descriptor carrying serialized state across re-execution.
    #[arg(long, value_name = "FD")]
    deserialize: Option<i32>,
}

fn flag_bool(value: &Option<String>) -> Option<bool> {
    value
        .as_deref()
        .map(|v| !matches!(v, "no" | "false" | "off" | "0"))
}

fn main() {
    let is_pid1 = nix::unistd::getpid().as_raw() == 1;

    // `init q` and friends are requests for the control utility.
    if !is_pid1 && invoked_as_init() {
        let args: Vec<String> = std::env::args().skip(1).collect();
        let err = exec_control_utility(&args);
        eprintln!("unitd: cannot hand over to unitctl: {err}");
        std::process::exit(1);
    }

    let cli = CliArgs::parse();

    let running_as = if cli.user {
        RunningAs::Session
    } else if cli.system || is_pid1 {
        RunningAs::System
    } else {
        RunningAs::Session
    };

    let mut config = Config::default_for(running_as);

    if is_pid1 {
        match std::fs::read_to_string("/proc/cmdline") {
            Ok(cmdline) => config.apply_kernel_cmdline(&cmdline),
            Err(e) => eprintln!("unitd: cannot read /proc/cmdline: {e}"),
        }
    }

    // CLI flags override the kernel command line.
    if let Some(unit) = &cli.unit {
        config.default_target = unit.clone();
    }
    if let Some(level) = &cli.log_level {
        match parse_log_level(level) {
            Some(level) => config.log.level = level,
            None => eprintln!("unitd: unknown log level {level}"),
        }
    }
    if let Some(target) = &cli.log_target {
        match LogTarget::from_str(target) {
            Some(target) => config.log.target = target,
            None => eprintln!("unitd: unknown log target {target}"),
        }
    }
    if let Some(color) = flag_bool(&cli.log_color) {
        config.log.color = color;
    }
    if let Some(location) = flag_bool(&cli.log_location) {
        config.log.location = location;
    }
    if let Some(show_status) = flag_bool(&cli.show_status) {
        config.show_status = show_status;
    }
    if let Some(dump_core) = flag_bool(&cli.dump_core) {
        config.dump_core = dump_core;
    }
    if let Some(crash_shell) = flag_bool(&cli.crash_shell) {
        config.crash_shell = crash_shell;
    }
    if let Some(confirm_spawn) = flag_bool(&cli.confirm_spawn) {
        config.confirm_spawn = confirm_spawn;
    }

    if cli.dump_configuration_items {
        dump_configuration_items();
        std::process::exit(0);
    }
    if let Some(interface) = &cli.introspect {
        introspect(interface);
        std::process::exit(0);
    }

    if let Err(e) = logging::setup_logging(&config.log) {
        eprintln!("unitd: {e}");
        std::process::exit(1);
    }

    let deserialized = cli.deserialize.and_then(|fd| {
        use std::os::unix::io::FromRawFd;
        let mut file = unsafe { std::fs::File::from_raw_fd(fd) };
        let mut blob = String::new();
        match file.read_to_string(&mut blob) {
            Ok(_) => Some(blob),
            Err(e) => {
                warn!("cannot read serialized state from fd {fd}: {e}");
                None
            }
        }
    });

    let code = run_service_manager(config, deserialized, cli.test);
    if code != 0 {
        error!("manager exited with status {code}");
    }
    std::process::exit(code);
}

fn invoked_as_init() -> bool {
    std::env::args()
        .next()
        .and_then(|argv0| {
            std::path::Path::new(&argv0)
                .file_name()
                .map(|n| n.to_string_lossy().starts_with("init"))
        })
        .unwrap_or(false)
}

fn exec_control_utility(args: &[String]) -> std::io::Error {
    use std::os::unix::process::CommandExt;

    let candidates = ["/usr/bin/unitctl", "/bin/unitctl", "unitctl"];
    let mut last = std::io::Error::other("no unitctl candidate found");
    for candidate in candidates {
        last = std::process::Command::new(candidate).args(args).exec();
    }
    last
}

fn dump_configuration_items() {
    const ITEMS: &[(&str, &[&str])] = &[
        (
            "Unit",
            &[
                "Description", "Documentation", "Names", "Requires", "RequiresOverridable",
                "Requisite", "RequisiteOverridable", "Wants", "BindsTo", "Conflicts", "Before",
                "After", "OnFailure", "PropagatesReloadTo", "ReloadPropagatedFrom",
                "ConditionPathExists", "ConditionPathIsDirectory", "ConditionDirectoryNotEmpty",
                "ConditionKernelCommandLine", "ConditionVirtualization", "ConditionSecurity",
                "ConditionNull", "DefaultDependencies", "AllowIsolate", "IgnoreOnIsolate",
                "RefuseManualStart", "RefuseManualStop", "StopWhenUnneeded", "JobTimeoutSec",
            ],
        ),
        ("Install", &["WantedBy", "RequiredBy", "Alias", "Also"]),
        (
            "Service",
            &[
                "Type", "ExecStart", "ExecStop", "ExecReload", "RemainAfterExit", "Environment",
                "User", "Group", "Nice", "OOMScoreAdjust", "WorkingDirectory", "Sockets",
            ],
        ),
        (
            "Socket",
            &[
                "ListenStream", "ListenDatagram", "ListenFIFO", "SocketMode", "IPTOS", "Accept",
                "Service",
            ],
        ),
        ("Mount", &["What", "Where", "Type", "Options", "DirectoryMode"]),
        ("Automount", &["Where", "DirectoryMode"]),
        ("Timer", &["OnBootSec", "OnStartupSec", "OnUnitActiveSec", "Unit"]),
        ("Path", &["PathExists", "PathChanged", "DirectoryNotEmpty", "Unit"]),
        ("Swap", &["What", "Priority"]),
    ];

    for (section, keys) in ITEMS {
        println!("[{section}]");
        for key in *keys {
            println!("\t{key}=");
        }
    }
}

fn introspect(interface: &str) {
    if !interface.is_empty() && interface != "manager" {
        eprintln!("unitd: unknown interface {interface}");
        return;
    }
    println!("interface manager:");
    println!("  methods:");
    for method in [
        "get-unit", "load-unit", "start-unit", "stop-unit", "reload-unit", "restart-unit",
        "try-restart-unit", "get-job", "clear-jobs", "list-units", "list-jobs", "subscribe",
        "unsubscribe", "dump", "create-snapshot", "reload", "reexecute", "exit",
        "set-environment", "unset-environment", "properties",
    ] {
        println!("    {method}");
    }
    println!("  signals:");
    for signal in ["unit-new", "unit-removed", "job-new", "job-removed"] {
        println!("    {signal}");
    }
    println!("  properties:");
    for property in [
        "Version", "RunningAs", "BootTimestamp", "LogLevel", "LogTarget", "NNames", "NJobs",
        "Environment",
    ] {
        println!("    {property}");
    }
}

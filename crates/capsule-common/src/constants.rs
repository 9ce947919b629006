//! System-wide constants and default paths.

/// Application name used for cgroup names, state directories, and logs.
pub const APP_NAME: &str = "capsule";

/// Binary name for the CLI.
pub const BIN_NAME: &str = "capsule";

/// Default root directory for all runtime state.
pub const DEFAULT_ROOT: &str = "/var/lib/capsule";

/// Environment variable overriding the runtime root directory.
pub const ROOT_ENV: &str = "CAPSULE_ROOT";

/// Reserved subcommand the runtime re-invokes itself with to become a
/// container's init process.
pub const INIT_SUBCOMMAND: &str = "init";

/// Reserved subcommand used by `exec` to join a running container.
pub const ENTER_SUBCOMMAND: &str = "enter";

/// Environment variable carrying the target pid for the namespace-entry helper.
pub const EXEC_PID_ENV: &str = "CAPSULE_EXEC_PID";

/// Environment variable carrying the JSON-encoded command for the
/// namespace-entry helper.
pub const EXEC_CMD_ENV: &str = "CAPSULE_EXEC_CMD";

/// Descriptor number the init process finds the handoff pipe on.
pub const HANDOFF_FD: i32 = 3;

/// Upper bound on the serialized startup command, in bytes.
pub const MAX_HANDOFF_BYTES: usize = 64 * 1024;

/// Length of generated container identifiers (decimal digits).
pub const CONTAINER_ID_LEN: usize = 10;

/// Maximum length of a container name.
pub const MAX_NAME_LEN: usize = 64;

/// File name of a container's registry record.
pub const INFO_FILE: &str = "info.json";

/// File name of a detached container's log.
pub const LOG_FILE: &str = "container.log";

/// Group under the cgroup v2 mount that container cgroups are created in.
pub const CGROUP_GROUP_SUFFIX: &str = "system.slice";

/// Staging directory name the old root is parked on during `pivot_root`.
pub const PIVOT_STAGING_DIR: &str = ".pivot_root";

/// Command run when `run` is given an image but no command.
pub const DEFAULT_COMMAND: &str = "sh";

/// File extension of image archives in the image store.
pub const IMAGE_ARCHIVE_EXTENSION: &str = "tar";

/// Name of the only built-in network driver.
pub const BRIDGE_DRIVER: &str = "bridge";

//! # Orchestrator Constants
//!
//! Fixed values, security bounds, and naming conventions for the tool
//! lifecycle orchestrator. These constants are the **single source of truth**
//! for the packaging denylist, the container security posture, and the
//! reverse-proxy label layout.
//!
//! Operator-tunable values (base image, routing network, timeouts) live in
//! [`crate::config::OrchestratorConfig`]; the defaults for those fields are
//! defined here.
//!
//! ## Cross-References
//!
//! - [`crate::packaging`]: denylist, allowlist, upload bounds
//! - [`crate::client`]: security options, labels, log lines
//! - [`crate::driver`]: container name and image reference validation

use std::time::Duration;

// =============================================================================
// Packaging
// =============================================================================

/// Import tokens that reject a submission outright.
///
/// **Security**: Matched as literal substrings over the raw source text, in
/// this order. The scan is deliberately conservative: `import os; os.system`
/// and a comment mentioning `socket` are both rejected.
///
/// **Attack Vector**: Process spawning and raw network access from inside a
/// tool container.
pub const DANGEROUS_IMPORTS: &[&str] = &["subprocess", "os.system", "socket", "paramiko"];

/// Modules that never appear in an inferred manifest: the Python standard
/// library of the base image plus the web runtime. Installing these through
/// pip would fail or shadow the real module. `subprocess` and `socket` are
/// absent because [`DANGEROUS_IMPORTS`] rejects them first.
///
/// Sorted in byte order for `binary_search`.
pub const PREINSTALLED_MODULES: &[&str] = &[
    "__future__", "_thread", "abc", "aifc", "antigravity", "argparse", "array", "ast", "asynchat",
    "asyncio", "asyncore", "atexit", "audioop", "base64", "bdb", "binascii", "bisect", "builtins",
    "bz2", "cProfile", "calendar", "cgi", "cgitb", "chunk", "cmath", "cmd", "code", "codecs",
    "codeop", "collections", "colorsys", "compileall", "concurrent", "configparser", "contextlib",
    "contextvars", "copy", "copyreg", "crypt", "csv", "ctypes", "curses", "dataclasses", "datetime",
    "dbm", "decimal", "difflib", "dis", "distutils", "doctest", "email", "encodings", "ensurepip",
    "enum", "errno", "faulthandler", "fcntl", "filecmp", "fileinput", "fnmatch", "fractions",
    "ftplib", "functools", "gc", "genericpath", "getopt", "getpass", "gettext", "glob", "graphlib",
    "grp", "gzip", "hashlib", "heapq", "hmac", "html", "http", "idlelib", "imaplib", "imghdr",
    "imp", "importlib", "inspect", "io", "ipaddress", "itertools", "json", "keyword", "lib2to3",
    "linecache", "locale", "logging", "lzma", "mailbox", "mailcap", "marshal", "math", "mimetypes",
    "mmap", "modulefinder", "msilib", "msvcrt", "multiprocessing", "netrc", "nis", "nntplib", "nt",
    "ntpath", "nturl2path", "numbers", "opcode", "operator", "optparse", "os", "ossaudiodev",
    "pathlib", "pdb", "pickle", "pickletools", "pipes", "pkgutil", "platform", "plistlib", "poplib",
    "posix", "posixpath", "pprint", "profile", "pstats", "pty", "pwd", "py_compile", "pyclbr",
    "pydoc", "pydoc_data", "pyexpat", "queue", "quopri", "random", "re", "readline", "reprlib",
    "resource", "rlcompleter", "runpy", "sched", "secrets", "select", "selectors", "shelve",
    "shlex", "shutil", "signal", "site", "smtpd", "smtplib", "sndhdr", "socketserver", "spwd",
    "sqlite3", "sre_compile", "sre_constants", "sre_parse", "ssl", "stat", "statistics",
    "streamlit", "string", "stringprep", "struct", "sunau", "symtable", "sys", "sysconfig",
    "syslog", "tabnanny", "tarfile", "telnetlib", "tempfile", "termios", "textwrap", "this",
    "threading", "time", "timeit", "tkinter", "token", "tokenize", "tomllib", "trace", "traceback",
    "tracemalloc", "tty", "turtle", "turtledemo", "types", "typing", "unicodedata", "unittest",
    "urllib", "uu", "uuid", "venv", "warnings", "wave", "weakref", "webbrowser", "winreg",
    "winsound", "wsgiref", "xdrlib", "xml", "xmlrpc", "zipapp", "zipfile", "zipimport", "zlib",
    "zoneinfo",
];

/// Pinned base runtime dependency, always the first manifest line.
pub const BASE_RUNTIME_REQUIREMENT: &str = "streamlit>=1.32";

/// Designated entry-point file name (single upload or inside an archive).
pub const ENTRYPOINT_FILE: &str = "app.py";

/// Optional explicit manifest inside an archive.
pub const MANIFEST_FILE: &str = "requirements.txt";

/// Generated image descriptor inside a build context.
pub const DOCKERFILE_NAME: &str = "Dockerfile";

/// Maximum accepted upload size (10 MiB).
///
/// **Security**: Bounds memory used while decoding and scanning an upload.
pub const MAX_UPLOAD_SIZE: usize = 10 * 1024 * 1024;

/// Maximum number of entries read from an uploaded archive.
///
/// **Attack Vector**: Archives with millions of empty entries.
pub const MAX_ARCHIVE_ENTRIES: usize = 1_000;

/// Maximum decompressed size of a single archive entry (10 MiB).
///
/// **Attack Vector**: Compression bombs.
pub const MAX_ARCHIVE_ENTRY_SIZE: u64 = 10 * 1024 * 1024;

// =============================================================================
// Container Naming and Routing
// =============================================================================

/// Default prefix for per-tool container names and image repositories.
///
/// Container name is `<prefix><tool-id>`; image tag is
/// `<prefix><tool-id>:v<version-id>`.
pub const DEFAULT_CONTAINER_PREFIX: &str = "sheetify-tool-";

/// Default external path prefix; a tool is routed at `<prefix>/<tool-id>`.
pub const DEFAULT_PATH_PREFIX: &str = "/t";

/// Default base image that every tool image layers on.
pub const DEFAULT_BASE_IMAGE: &str = "sheetify-base:latest";

/// Default shared network the reverse proxy watches.
pub const DEFAULT_ROUTING_NETWORK: &str = "web";

/// Default reverse-proxy entrypoint name.
pub const DEFAULT_PROXY_ENTRYPOINT: &str = "web";

/// Default backend port the tool's web server listens on.
pub const DEFAULT_BACKEND_PORT: u16 = 8501;

/// Default container runtime CLI.
pub const DEFAULT_RUNTIME_BINARY: &str = "docker";

/// Working directory inside tool images.
pub const IMAGE_WORKDIR: &str = "/workspace";

/// Security options applied to every tool container.
///
/// **Security**: Fixed posture, not configurable per tool. Blocks setuid
/// escalation inside the container.
pub const CONTAINER_SECURITY_OPTS: &[&str] = &["no-new-privileges"];

/// Capabilities dropped from every tool container.
///
/// **Security**: No raw sockets (packet crafting, ICMP spoofing).
pub const CONTAINER_CAP_DROP: &[&str] = &["NET_RAW"];

/// Log line recorded on a Run when the container starts.
pub const RUN_STARTED_LOG: &str = "Container started";

/// Log line appended to the latest Run when its tool is stopped.
pub const RUN_STOPPED_LOG: &str = "Stopped by user";

/// Log line prefix recorded on a Run whose container a newer run replaced.
pub const RUN_REPLACED_LOG: &str = "Replaced by run";

/// Placed at the head of a Build/Run log once its oldest output was dropped.
pub const LOG_TRUNCATED_MARKER: &str = "[earlier output truncated]\n";

// =============================================================================
// Timeouts and Retry Bounds
// =============================================================================

/// Default image build timeout (10 minutes).
///
/// **Rationale**: Dependency installation for scientific stacks routinely
/// takes several minutes on a cold cache.
pub const DEFAULT_BUILD_TIMEOUT: Duration = Duration::from_secs(600);

/// Default container start timeout (60 seconds).
pub const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(60);

/// Default container stop timeout (30 seconds).
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(30);

/// Default cap on stored Build/Run log text (1 MiB, newest output kept).
pub const DEFAULT_MAX_LOG_BYTES: usize = 1024 * 1024;

/// Default number of deliveries for a job that hits an infrastructure fault.
pub const DEFAULT_MAX_JOB_ATTEMPTS: u32 = 3;

/// Re-reads allowed when an optimistic commit loses a race.
pub const MAX_COMMIT_ATTEMPTS: u32 = 5;

/// Pending jobs buffered by the queue dispatcher before `enqueue` waits.
pub const JOB_QUEUE_CAPACITY: usize = 1024;

/// Delay before re-delivering a job after an infrastructure fault.
pub const JOB_RETRY_BACKOFF: Duration = Duration::from_millis(500);

// =============================================================================
// Validation Patterns
// =============================================================================

/// Valid characters for container names.
///
/// **Security**: Container names end up on the runtime command line and in
/// label keys; nothing outside this set is accepted.
pub const CONTAINER_NAME_VALID_CHARS: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-_.";

/// Maximum container name length.
pub const MAX_CONTAINER_NAME_LEN: usize = 128;

/// Valid characters for image references.
pub const IMAGE_REF_VALID_CHARS: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-_./:@";

/// Maximum image reference length.
pub const MAX_IMAGE_REF_LEN: usize = 512;

/// Validates a container name before it reaches the runtime.
#[inline]
#[must_use = "validation result must be checked before invoking the runtime"]
pub fn validate_container_name(name: &str) -> std::result::Result<(), &'static str> {
    if name.is_empty() {
        return Err("container name cannot be empty");
    }
    if name.len() > MAX_CONTAINER_NAME_LEN {
        return Err("container name exceeds maximum length");
    }
    if name.starts_with(['-', '.']) {
        return Err("container name must start with an alphanumeric character");
    }
    if !name.chars().all(|c| CONTAINER_NAME_VALID_CHARS.contains(c)) {
        return Err("container name contains invalid characters");
    }
    Ok(())
}

/// Validates an image reference before it reaches the runtime.
#[inline]
#[must_use = "validation result must be checked before invoking the runtime"]
pub fn validate_image_ref(reference: &str) -> std::result::Result<(), &'static str> {
    if reference.is_empty() {
        return Err("image reference cannot be empty");
    }
    if reference.len() > MAX_IMAGE_REF_LEN {
        return Err("image reference exceeds maximum length");
    }
    if reference.starts_with('-') {
        return Err("image reference must not start with '-'");
    }
    if !reference.chars().all(|c| IMAGE_REF_VALID_CHARS.contains(c)) {
        return Err("image reference contains invalid characters");
    }
    Ok(())
}

//! Handler policy layer: path canonicalization, command sandboxing, and
//! rate limiting.
//!
//! Every policy check runs before a handler side-effects the guest. The
//! rules are allow-list based: a path must land under an allowed prefix and
//! outside every forbidden prefix after `..` and symlink resolution; a
//! command's argv[0] basename must be allow-listed and no element may carry
//! shell metacharacters.

use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;

use crate::config::RateLimitConfig;
use crate::error::{Error, Result};

// =============================================================================
// Path Policy
// =============================================================================

/// Default allowed path prefixes for file handlers.
const DEFAULT_ALLOWED_PATHS: [&str; 3] = ["/tmp/", "/var/log/", "/home/"];

/// `/etc/` is readable but never writable.
const READ_ONLY_PATHS: [&str; 1] = ["/etc/"];

/// Always-forbidden prefixes, regardless of configuration.
const FORBIDDEN_PATHS: [&str; 4] = ["/etc/shadow", "/root/", "/proc/", "/sys/"];

/// Whether an operation mutates the filesystem. Write-class operations are
/// denied the read-only prefixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

/// Path allow-list enforcement for the file handlers.
#[derive(Debug)]
pub struct PathPolicy {
    allowed: Vec<PathBuf>,
    read_only: Vec<PathBuf>,
}

impl PathPolicy {
    /// Builds a policy from configured prefixes; an empty list means the
    /// built-in defaults.
    #[must_use]
    pub fn new(allowed_paths: &[PathBuf]) -> Self {
        let allowed = if allowed_paths.is_empty() {
            DEFAULT_ALLOWED_PATHS.iter().map(PathBuf::from).collect()
        } else {
            allowed_paths.to_vec()
        };
        Self {
            allowed,
            read_only: READ_ONLY_PATHS.iter().map(PathBuf::from).collect(),
        }
    }

    /// Canonicalizes `path` and verifies it against the allow-lists.
    /// Returns the canonical path the handler must use for all I/O.
    ///
    /// The target itself may not exist yet (uploads); in that case the
    /// parent directory is resolved and the final component re-appended, so
    /// symlinked parents cannot smuggle a path outside the allow-list.
    ///
    /// # Errors
    ///
    /// `PermissionDenied` for relative paths, forbidden prefixes, or
    /// escapes from the allowed set; `FileNotFound` when write-class
    /// resolution finds no parent directory.
    pub fn check(&self, path: &str, access: Access) -> Result<PathBuf> {
        if path.is_empty() || !Path::new(path).is_absolute() {
            return Err(Error::PermissionDenied(format!(
                "path must be absolute: {path}"
            )));
        }

        let canonical = resolve(Path::new(path), access)?;

        for forbidden in FORBIDDEN_PATHS {
            if has_prefix(&canonical, Path::new(forbidden)) {
                return Err(Error::PermissionDenied(format!("access denied: {path}")));
            }
        }

        let readable = self
            .allowed
            .iter()
            .chain(self.read_only.iter())
            .any(|prefix| has_prefix(&canonical, prefix));
        let writable = self
            .allowed
            .iter()
            .any(|prefix| has_prefix(&canonical, prefix));

        match access {
            Access::Read if readable => Ok(canonical),
            Access::Write if writable => Ok(canonical),
            Access::Write if readable => Err(Error::PermissionDenied(format!(
                "path is read-only: {path}"
            ))),
            _ => Err(Error::PermissionDenied(format!(
                "path not in allowed list: {path}"
            ))),
        }
    }
}

/// Resolves symlinks and `..`. For write access the target may not exist:
/// the parent is canonicalized instead and the file name re-appended.
fn resolve(path: &Path, access: Access) -> Result<PathBuf> {
    match std::fs::canonicalize(path) {
        Ok(canonical) => Ok(canonical),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound && access == Access::Write => {
            let parent = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .ok_or_else(|| Error::PermissionDenied(format!("bad path: {}", path.display())))?;
            let name = match path.components().next_back() {
                Some(Component::Normal(name)) => name.to_os_string(),
                _ => {
                    return Err(Error::PermissionDenied(format!(
                        "bad path: {}",
                        path.display()
                    )))
                }
            };
            let parent = std::fs::canonicalize(parent)
                .map_err(|_| Error::FileNotFound(format!("{}", parent.display())))?;
            Ok(parent.join(name))
        }
        Err(_) => Err(Error::FileNotFound(format!("{}", path.display()))),
    }
}

/// Prefix check on whole components; `/tmp/../x` never matches `/tmp/`.
fn has_prefix(path: &Path, prefix: &Path) -> bool {
    // A prefix configured with a trailing slash compares equal on
    // components, so `/var/log/` matches `/var/log` and below.
    path.starts_with(prefix)
}

// =============================================================================
// Command Policy
// =============================================================================

/// Default command allow-list for `shell/exec`.
const DEFAULT_ALLOWED_COMMANDS: [&str; 13] = [
    "ls",
    "cat",
    "head",
    "tail",
    "grep",
    "df",
    "free",
    "top",
    "ps",
    "netstat",
    "systemctl",
    "service",
    "journalctl",
];

/// Characters that reject an argv element outright. The command never
/// passes through a shell, so these can only be injection attempts.
const DANGEROUS_CHARS: [char; 9] = ['|', '&', ';', '`', '$', '>', '<', '\n', '\r'];

/// Default PATH for sandboxed children when the caller supplies none.
pub const DEFAULT_PATH_ENV: &str = "/usr/bin:/bin";

/// Command allow-list enforcement for `shell/exec`.
#[derive(Debug)]
pub struct CommandPolicy {
    allowed: Vec<String>,
}

impl CommandPolicy {
    /// Builds a policy from configured command names; an empty list means
    /// the built-in defaults.
    #[must_use]
    pub fn new(allowed_commands: &[String]) -> Self {
        let allowed = if allowed_commands.is_empty() {
            DEFAULT_ALLOWED_COMMANDS
                .iter()
                .map(ToString::to_string)
                .collect()
        } else {
            allowed_commands.to_vec()
        };
        Self { allowed }
    }

    /// Splits `command` into argv without shell interpretation and checks
    /// it against the allow-list. Returns the argv to execute.
    ///
    /// # Errors
    ///
    /// `InvalidParams` for empty commands, metacharacters, unbalanced
    /// quotes, or a disallowed argv[0].
    pub fn validate(&self, command: &str) -> Result<Vec<String>> {
        let argv = split_argv(command)?;
        let Some(program) = argv.first() else {
            return Err(Error::InvalidParams("empty command".into()));
        };

        for arg in &argv {
            if arg.chars().any(|c| DANGEROUS_CHARS.contains(&c)) {
                return Err(Error::InvalidParams(format!(
                    "command contains forbidden characters: {arg}"
                )));
            }
        }

        let base = Path::new(program)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(program);
        if !self.allowed.iter().any(|c| c == base) {
            return Err(Error::InvalidParams(format!("command not allowed: {base}")));
        }

        Ok(argv)
    }
}

/// Splits a command line into argv, honoring single and double quotes but
/// performing no expansion of any kind.
fn split_argv(command: &str) -> Result<Vec<String>> {
    let mut argv = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;

    for c in command.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '\'' || c == '"' => {
                quote = Some(c);
                in_word = true;
            }
            None if c.is_whitespace() => {
                if in_word {
                    argv.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            None => {
                current.push(c);
                in_word = true;
            }
        }
    }
    if quote.is_some() {
        return Err(Error::InvalidParams("unbalanced quote in command".into()));
    }
    if in_word {
        argv.push(current);
    }
    if argv.is_empty() {
        return Err(Error::InvalidParams("empty command".into()));
    }
    Ok(argv)
}

// =============================================================================
// Rate Limiting
// =============================================================================

/// Global token-bucket limiter: burst-per-second and sustained-per-minute
/// buckets, both of which must admit a request. Acquisition never blocks.
#[derive(Debug)]
pub struct RateLimiter {
    state: Mutex<BucketState>,
    per_second: f64,
    per_minute: f64,
}

#[derive(Debug)]
struct BucketState {
    second_tokens: f64,
    minute_tokens: f64,
    refilled_at: Instant,
}

impl RateLimiter {
    /// Creates a limiter from the configured budget.
    #[must_use]
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            state: Mutex::new(BucketState {
                second_tokens: f64::from(config.per_second),
                minute_tokens: f64::from(config.per_minute),
                refilled_at: Instant::now(),
            }),
            per_second: f64::from(config.per_second),
            per_minute: f64::from(config.per_minute),
        }
    }

    /// Takes one token from both buckets, or reports exhaustion.
    pub fn try_acquire(&self) -> bool {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        let elapsed = state.refilled_at.elapsed().as_secs_f64();
        state.refilled_at = Instant::now();
        state.second_tokens =
            (state.second_tokens + elapsed * self.per_second).min(self.per_second);
        state.minute_tokens =
            (state.minute_tokens + elapsed * self.per_minute / 60.0).min(self.per_minute);

        if state.second_tokens >= 1.0 && state.minute_tokens >= 1.0 {
            state.second_tokens -= 1.0;
            state.minute_tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_argv_honors_quotes() {
        let argv = split_argv(r#"grep -r "two words" /tmp"#).unwrap();
        assert_eq!(argv, vec!["grep", "-r", "two words", "/tmp"]);

        let argv = split_argv("ls   -la\t/var/log").unwrap();
        assert_eq!(argv, vec!["ls", "-la", "/var/log"]);
    }

    #[test]
    fn split_argv_rejects_unbalanced_quote() {
        assert!(split_argv(r#"cat "unterminated"#).is_err());
    }

    #[test]
    fn command_allow_list() {
        let policy = CommandPolicy::new(&[]);
        assert!(policy.validate("ls -la /tmp").is_ok());
        assert!(policy.validate("/bin/cat /var/log/syslog").is_ok());

        let err = policy.validate("rm -rf /").unwrap_err();
        assert!(err.to_string().contains("not allowed: rm"));
    }

    #[test]
    fn command_metacharacters_rejected() {
        let policy = CommandPolicy::new(&[]);
        for cmd in [
            "ls; rm -rf /",
            "cat /etc/passwd | grep root",
            "ls $(whoami)",
            "ls > /tmp/out",
            "cat < /etc/shadow",
            "ls `id`",
            "ls &",
        ] {
            assert!(policy.validate(cmd).is_err(), "should reject: {cmd}");
        }
    }

    #[test]
    fn custom_command_list_replaces_defaults() {
        let policy = CommandPolicy::new(&["uptime".to_string()]);
        assert!(policy.validate("uptime").is_ok());
        assert!(policy.validate("ls").is_err());
    }

    #[test]
    fn rate_limiter_exhausts_and_refills() {
        let limiter = RateLimiter::new(&RateLimitConfig {
            per_second: 2,
            per_minute: 100,
            max_concurrent: 1,
        });
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());

        std::thread::sleep(std::time::Duration::from_millis(600));
        assert!(limiter.try_acquire());
    }

    mod paths {
        use super::*;

        fn policy_for(dir: &Path) -> PathPolicy {
            PathPolicy::new(&[dir.to_path_buf()])
        }

        #[test]
        fn relative_paths_denied() {
            let tmp = tempfile::tempdir().unwrap();
            let policy = policy_for(tmp.path());
            assert!(matches!(
                policy.check("relative/file", Access::Read),
                Err(Error::PermissionDenied(_))
            ));
        }

        #[test]
        fn dotdot_escape_denied() {
            let tmp = tempfile::tempdir().unwrap();
            std::fs::write(tmp.path().join("inside"), b"x").unwrap();
            let policy = policy_for(tmp.path());

            let escape = format!("{}/../escape", tmp.path().display());
            assert!(matches!(
                policy.check(&escape, Access::Write),
                Err(Error::PermissionDenied(_))
            ));

            let inside = format!("{}/inside", tmp.path().display());
            assert!(policy.check(&inside, Access::Read).is_ok());
        }

        #[test]
        fn symlink_escape_denied() {
            let tmp = tempfile::tempdir().unwrap();
            let outside = tempfile::tempdir().unwrap();
            let link = tmp.path().join("link");
            std::os::unix::fs::symlink(outside.path(), &link).unwrap();
            let policy = policy_for(tmp.path());

            let through = format!("{}/file", link.display());
            assert!(matches!(
                policy.check(&through, Access::Write),
                Err(Error::PermissionDenied(_))
            ));
        }

        #[test]
        fn forbidden_prefixes_always_deny() {
            let policy = PathPolicy::new(&[PathBuf::from("/")]);
            for path in ["/proc/self/environ", "/sys/kernel", "/etc/shadow"] {
                assert!(
                    matches!(
                        policy.check(path, Access::Read),
                        Err(Error::PermissionDenied(_))
                    ),
                    "should deny {path}"
                );
            }
        }

        #[test]
        fn etc_is_read_only() {
            let policy = PathPolicy::new(&[]);
            // Read allowed under /etc/ for files that exist.
            assert!(policy.check("/etc/passwd", Access::Read).is_ok());
            // Any write under /etc/ is denied.
            let err = policy.check("/etc/passwd", Access::Write).unwrap_err();
            assert!(matches!(err, Error::PermissionDenied(_)));
        }

        #[test]
        fn write_target_may_not_exist_yet() {
            let tmp = tempfile::tempdir().unwrap();
            let policy = policy_for(tmp.path());
            let fresh = format!("{}/new-file.bin", tmp.path().display());
            let canonical = policy.check(&fresh, Access::Write).unwrap();
            assert!(canonical.ends_with("new-file.bin"));
        }

        #[test]
        fn write_missing_parent_is_not_found() {
            let tmp = tempfile::tempdir().unwrap();
            let policy = policy_for(tmp.path());
            let orphan = format!("{}/no-such-dir/file", tmp.path().display());
            assert!(matches!(
                policy.check(&orphan, Access::Write),
                Err(Error::FileNotFound(_))
            ));
        }
    }
}

/// Payload environment.
///
/// The payload never sees the worker's environment. It gets a fixed base,
/// the interpreter template's variables and the job's own (already
/// validated) variables, in that order of precedence from low to high.
use crate::config::job::JobConfig;
use crate::config::types::{Result, SandboxError};
use crate::kernel::mount::SANDBOX_WORKDIR;
use std::collections::BTreeMap;
use std::ffi::CString;

/// File creation mask for the payload
pub const PAYLOAD_UMASK: libc::mode_t = 0o022;

const BASE_ENV: &[(&str, &str)] = &[
    ("PATH", "/usr/local/bin:/usr/bin:/bin"),
    ("LANG", "C.UTF-8"),
    ("LC_ALL", "C.UTF-8"),
];

/// Loader variables that are dropped even if a template sets them
const LOADER_VARS: &[&str] = &["LD_PRELOAD", "LD_LIBRARY_PATH", "LD_AUDIT", "LD_DEBUG", "LD_PROFILE"];

pub fn sandbox_environment(config: &JobConfig) -> BTreeMap<String, String> {
    let mut env: BTreeMap<String, String> = BASE_ENV
        .iter()
        .chain(config.interpreter.template().env.iter())
        .map(|&(k, v)| (k.to_string(), v.to_string()))
        .collect();
    for key in ["HOME", "TMPDIR"] {
        env.insert(key.to_string(), SANDBOX_WORKDIR.to_string());
    }
    for (key, value) in &config.env {
        env.insert(key.clone(), value.clone());
    }
    for var in LOADER_VARS {
        env.remove(*var);
    }
    env
}

/// `KEY=VALUE` strings for execve.
pub fn to_envp(env: &BTreeMap<String, String>) -> Result<Vec<CString>> {
    env.iter()
        .map(|(k, v)| {
            CString::new(format!("{}={}", k, v)).map_err(|_| {
                SandboxError::Config(format!("environment variable {} contains NUL byte", k))
            })
        })
        .collect()
}

pub fn to_argv(argv: &[String]) -> Result<Vec<CString>> {
    if argv.is_empty() {
        return Err(SandboxError::Config("empty command".to_string()));
    }
    argv.iter()
        .map(|a| {
            CString::new(a.as_str())
                .map_err(|_| SandboxError::Config("command contains NUL byte".to_string()))
        })
        .collect()
}

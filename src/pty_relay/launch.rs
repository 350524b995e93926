//! Launch description for the child, fully built before fork.

use crate::config::{RelayConfig, NESTED_SESSION_ENV, TERM_ENV};
use anyhow::{Context, Result};
use std::env;
use std::ffi::{CString, OsStr, OsString};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::ptr;

/// Program, argv and environment for the child, plus the NULL-terminated
/// pointer arrays `execve` needs. Nothing here allocates after fork.
pub(crate) struct LaunchSpec {
    display_name: String,
    program: Option<CString>,
    // Owns the strings behind `argv_ptrs` / `envp_ptrs`.
    #[cfg_attr(not(test), allow(dead_code))]
    argv: Vec<CString>,
    #[cfg_attr(not(test), allow(dead_code))]
    envp: Vec<CString>,
    argv_ptrs: Vec<*const libc::c_char>,
    envp_ptrs: Vec<*const libc::c_char>,
    not_found_message: Vec<u8>,
    failure_prefix: Vec<u8>,
}

impl LaunchSpec {
    /// Build the launch for `config`, resolving the program against the current `PATH`.
    ///
    /// # Errors
    ///
    /// Returns an error when arguments fail to split or contain NUL bytes.
    pub(crate) fn from_config(config: &RelayConfig) -> Result<Self> {
        let args = config.resolved_args()?;
        Self::new(&config.command, &args, &config.term, env::vars_os())
    }

    pub(crate) fn new<I>(command: &str, args: &[String], term: &str, vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (OsString, OsString)>,
    {
        let vars: Vec<(OsString, OsString)> = vars.into_iter().collect();
        let path_var = vars
            .iter()
            .find(|(key, _)| key == "PATH")
            .map(|(_, value)| value.clone());

        let program = resolve_program(command, path_var.as_deref())
            .map(|path| {
                CString::new(path.as_os_str().as_bytes())
                    .with_context(|| format!("program path contains NUL byte: {}", path.display()))
            })
            .transpose()?;

        let mut argv = Vec::with_capacity(args.len() + 1);
        argv.push(
            CString::new(command).with_context(|| format!("command contains NUL byte: {command}"))?,
        );
        for arg in args {
            argv.push(
                CString::new(arg.as_str())
                    .with_context(|| format!("command arg contains NUL byte: {arg}"))?,
            );
        }

        let envp = child_environment(vars, term)?;
        let argv_ptrs = null_terminated(&argv);
        let envp_ptrs = null_terminated(&envp);

        Ok(Self {
            display_name: command.to_string(),
            program,
            not_found_message: format!("ptyrelay: failed to launch {command}: command not found\n")
                .into_bytes(),
            failure_prefix: format!("ptyrelay: failed to launch {command}: ").into_bytes(),
            argv,
            envp,
            argv_ptrs,
            envp_ptrs,
        })
    }

    pub(crate) fn display_name(&self) -> &str {
        &self.display_name
    }

    pub(crate) fn program(&self) -> Option<&CString> {
        self.program.as_ref()
    }

    pub(crate) fn argv_ptr(&self) -> *const *const libc::c_char {
        self.argv_ptrs.as_ptr()
    }

    pub(crate) fn envp_ptr(&self) -> *const *const libc::c_char {
        self.envp_ptrs.as_ptr()
    }

    pub(crate) fn not_found_message(&self) -> &[u8] {
        &self.not_found_message
    }

    /// Start of the line the child writes when a setup step fails.
    pub(crate) fn failure_prefix(&self) -> &[u8] {
        &self.failure_prefix
    }

    #[cfg(test)]
    pub(crate) fn argv(&self) -> &[CString] {
        &self.argv
    }

    #[cfg(test)]
    pub(crate) fn envp(&self) -> &[CString] {
        &self.envp
    }
}

fn null_terminated(strings: &[CString]) -> Vec<*const libc::c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(ptr::null()))
        .collect()
}

/// Parent environment minus the nested-session marker, with `TERM` forced to `term`.
pub(crate) fn child_environment<I>(vars: I, term: &str) -> Result<Vec<CString>>
where
    I: IntoIterator<Item = (OsString, OsString)>,
{
    let mut envp = Vec::new();
    for (key, value) in vars {
        if key == NESTED_SESSION_ENV || key == TERM_ENV {
            continue;
        }
        let mut entry = key.as_bytes().to_vec();
        entry.push(b'=');
        entry.extend_from_slice(value.as_bytes());
        // Entries with interior NUL cannot be represented in envp; the OS never hands us one.
        if let Ok(entry) = CString::new(entry) {
            envp.push(entry);
        }
    }
    envp.push(
        CString::new(format!("{TERM_ENV}={term}"))
            .with_context(|| format!("TERM value contains NUL byte: {term}"))?,
    );
    Ok(envp)
}

/// Locate `command` the way `execvp` would: names with a slash are used as-is,
/// anything else is searched in `PATH` (an empty entry means the current directory).
pub(crate) fn resolve_program(command: &str, path_var: Option<&OsStr>) -> Option<PathBuf> {
    if command.is_empty() {
        return None;
    }
    if command.contains('/') {
        return Some(PathBuf::from(command));
    }
    let path_var = path_var?;
    env::split_paths(path_var)
        .map(|dir| {
            if dir.as_os_str().is_empty() {
                PathBuf::from(".").join(command)
            } else {
                dir.join(command)
            }
        })
        .find(|candidate| is_executable_file(candidate))
}

fn is_executable_file(path: &Path) -> bool {
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

use std::collections::HashSet;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};

use crate::error::MirrorError;

/// One commit to record, dated at the transition it replays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRequest {
    pub message: String,
    pub date: DateTime<Utc>,
    pub author_name: Option<String>,
    pub author_id: Option<i64>,
    /// `key: value` lines appended to the message as a trailer block.
    pub trailers: Vec<(String, String)>,
}

impl CommitRequest {
    pub fn new(message: impl Into<String>, date: DateTime<Utc>) -> Self {
        Self {
            message: message.into(),
            date,
            author_name: None,
            author_id: None,
            trailers: Vec::new(),
        }
    }

    pub fn with_author(mut self, name: Option<String>, id: Option<i64>) -> Self {
        self.author_name = name;
        self.author_id = id;
        self
    }

    pub fn with_trailer(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.trailers.push((key.into(), value.into()));
        self
    }

    /// Message followed by a blank line and the trailer block, if any.
    pub fn full_message(&self) -> String {
        if self.trailers.is_empty() {
            return self.message.clone();
        }
        let trailers = self
            .trailers
            .iter()
            .map(|(key, value)| format!("{key}: {value}"))
            .collect::<Vec<_>>();
        format!("{}\n\n{}", self.message, trailers.join("\n"))
    }

    /// `Name <id@wikimirror.invalid>` when the store named an author.
    pub fn author(&self) -> Option<String> {
        let name = self.author_name.as_deref().filter(|name| !name.trim().is_empty())?;
        let local = self
            .author_id
            .map_or_else(|| "unknown".to_string(), |id| format!("user-{id}"));
        Some(format!("{name} <{local}@wikimirror.invalid>"))
    }
}

/// Version-control backend the mirror is replayed into. Paths are given
/// absolute or relative to the process; implementations map them onto the
/// working tree.
pub trait VersionControl {
    fn root(&self) -> &Path;
    fn is_repository(&self) -> bool;
    fn init(&mut self) -> Result<()>;
    /// Stage `path` including deletions below it.
    fn add(&mut self, path: &Path) -> Result<()>;
    /// Rename a tracked file, keeping its history. Fails when `to` exists.
    fn rename(&mut self, from: &Path, to: &Path) -> Result<()>;
    /// Delete a file from the working tree and stage the deletion.
    fn remove(&mut self, path: &Path) -> Result<()>;
    fn has_staged_changes(&mut self) -> Result<bool>;
    fn commit(&mut self, request: &CommitRequest) -> Result<()>;
    /// Values of the `key` trailer over every commit reachable from HEAD.
    fn trailer_values(&mut self, key: &str) -> Result<HashSet<String>>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitterIdentity {
    pub name: Option<String>,
    pub email: Option<String>,
}

/// `git` driven as a child process, always with `-C <root>`.
#[derive(Debug, Clone)]
pub struct GitCli {
    binary: PathBuf,
    root: PathBuf,
    committer: CommitterIdentity,
}

impl GitCli {
    pub fn new(binary: impl Into<PathBuf>, root: impl Into<PathBuf>, committer: CommitterIdentity) -> Self {
        Self {
            binary: binary.into(),
            root: root.into(),
            committer,
        }
    }

    fn relative<'a>(&self, path: &'a Path) -> &'a Path {
        path.strip_prefix(&self.root).unwrap_or(path)
    }

    fn command(&self, args: &[OsString]) -> Command {
        let mut command = Command::new(&self.binary);
        command.arg("-C").arg(&self.root);
        if let Some(name) = &self.committer.name {
            command.arg("-c").arg(format!("user.name={name}"));
        }
        if let Some(email) = &self.committer.email {
            command.arg("-c").arg(format!("user.email={email}"));
        }
        command.args(args);
        command
    }

    fn run_raw(&self, args: &[OsString], envs: &[(&str, String)]) -> Result<Output> {
        let rendered = render_command(&self.binary, args);
        tracing::debug!(command = %rendered, "running version control");
        let mut command = self.command(args);
        for (key, value) in envs {
            command.env(key, value);
        }
        command
            .output()
            .with_context(|| format!("failed to launch `{rendered}`"))
    }

    fn run(&self, args: &[OsString], envs: &[(&str, String)]) -> Result<Output> {
        let output = self.run_raw(args, envs)?;
        if output.status.success() {
            return Ok(output);
        }
        Err(MirrorError::Vcs {
            command: render_command(&self.binary, args),
            status: output.status.code(),
            stderr: format_process_error(&output),
        }
        .into())
    }
}

impl VersionControl for GitCli {
    fn root(&self) -> &Path {
        &self.root
    }

    fn is_repository(&self) -> bool {
        self.root.join(".git").exists()
    }

    fn init(&mut self) -> Result<()> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("failed to create {}", self.root.display()))?;
        self.run(&[os("init"), os("--quiet")], &[])?;
        Ok(())
    }

    fn add(&mut self, path: &Path) -> Result<()> {
        let path = self.relative(path).as_os_str().to_os_string();
        self.run(&[os("add"), os("--all"), os("--"), path], &[])?;
        Ok(())
    }

    fn rename(&mut self, from: &Path, to: &Path) -> Result<()> {
        let from = self.relative(from).as_os_str().to_os_string();
        let to = self.relative(to).as_os_str().to_os_string();
        self.run(&[os("mv"), os("--"), from, to], &[])?;
        Ok(())
    }

    fn remove(&mut self, path: &Path) -> Result<()> {
        let relative = self.relative(path).as_os_str().to_os_string();
        self.run(
            &[
                os("rm"),
                os("--quiet"),
                os("--force"),
                os("--ignore-unmatch"),
                os("--"),
                relative,
            ],
            &[],
        )?;
        // Untracked leftovers are not touched by `git rm`.
        if path.exists() {
            fs::remove_file(path).with_context(|| format!("failed to remove {}", path.display()))?;
        }
        Ok(())
    }

    fn has_staged_changes(&mut self) -> Result<bool> {
        let args = [os("diff"), os("--cached"), os("--quiet")];
        let output = self.run_raw(&args, &[])?;
        match output.status.code() {
            Some(0) => Ok(false),
            Some(1) => Ok(true),
            status => Err(MirrorError::Vcs {
                command: render_command(&self.binary, &args),
                status,
                stderr: format_process_error(&output),
            }
            .into()),
        }
    }

    fn commit(&mut self, request: &CommitRequest) -> Result<()> {
        let date = request.date.to_rfc3339_opts(SecondsFormat::Secs, false);
        let mut args = vec![
            os("commit"),
            os("--quiet"),
            os("-m"),
            os(&request.full_message()),
            OsString::from(format!("--date={date}")),
        ];
        if let Some(author) = request.author() {
            args.push(OsString::from(format!("--author={author}")));
        }
        self.run(&args, &[("GIT_COMMITTER_DATE", date)])?;
        Ok(())
    }

    fn trailer_values(&mut self, key: &str) -> Result<HashSet<String>> {
        let head = [os("rev-parse"), os("--verify"), os("--quiet"), os("HEAD")];
        if !self.run_raw(&head, &[])?.status.success() {
            return Ok(HashSet::new());
        }
        let output = self.run(&[os("log"), os("--format=%B")], &[])?;
        Ok(parse_trailer_values(&String::from_utf8_lossy(&output.stdout), key))
    }
}

fn parse_trailer_values(log: &str, key: &str) -> HashSet<String> {
    let prefix = format!("{key}:");
    log.lines()
        .filter_map(|line| line.strip_prefix(&prefix))
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .collect()
}

fn os(value: &str) -> OsString {
    OsString::from(value)
}

fn render_command(binary: &Path, args: &[OsString]) -> String {
    let mut parts = vec![binary.display().to_string()];
    parts.extend(args.iter().map(|arg| arg.to_string_lossy().into_owned()));
    parts.join(" ")
}

/// Prefer stderr, fall back to stdout, then to the exit status.
fn format_process_error(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    match (stderr.is_empty(), stdout.is_empty()) {
        (true, true) => format!(
            "no output, exit code {}",
            output.status.code().unwrap_or(-1)
        ),
        (true, false) => stdout,
        (false, true) => stderr,
        (false, false) => format!("{stderr}\n{stdout}"),
    }
}

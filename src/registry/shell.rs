//! Long-lived privileged shell reader.
//!
//! On devices where `/proc/<pid>` of other users is hidden from the
//! exporter, the registry caches are filled through a shell started once
//! (usually `su`) and driven over its stdin/stdout. Every command is
//! followed by an `echo` of a terminator line so the reader knows where
//! the output of one command ends. Output of a command that timed out is
//! skipped before the next command is sent.

use ahash::AHashMap as HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::time::timeout;
use tracing::{debug, info};

use super::{parse_pid_stat, PidTimes};
use crate::error::{PowerError, Result};
use crate::sample::Uid;

const TERMINATOR: &str = "--TERM--";

/// How long a single command may take before the reader gives up.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

const EXIT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct ShellReader {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Lines<BufReader<ChildStdout>>,
    proc_dir: PathBuf,
    command_timeout: Duration,
    /// Terminators of timed-out commands not yet read back.
    pending: usize,
}

impl ShellReader {
    /// Starts `shell` (e.g. `su` or `sh`). Must be called inside a tokio
    /// runtime.
    pub fn spawn(shell: &str, proc_dir: &Path) -> Result<Self> {
        let mut child = Command::new(shell)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PowerError::Reader(format!("failed to start {}: {}", shell, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| PowerError::Reader("shell stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PowerError::Reader("shell stdout not captured".into()))?;

        info!("Started {} reader for {}", shell, proc_dir.display());
        Ok(Self {
            child,
            stdin: Some(stdin),
            stdout: BufReader::new(stdout).lines(),
            proc_dir: proc_dir.to_path_buf(),
            command_timeout: COMMAND_TIMEOUT,
            pending: 0,
        })
    }

    pub fn with_command_timeout(mut self, command_timeout: Duration) -> Self {
        self.command_timeout = command_timeout;
        self
    }

    /// Reads past the output of earlier commands that timed out.
    async fn resync(&mut self) -> Result<()> {
        while self.pending > 0 {
            let skipped = timeout(self.command_timeout, read_until_terminator(&mut self.stdout))
                .await
                .map_err(|_| PowerError::Reader("shell still busy with a timed-out command".into()))??;
            debug!("Skipped {} lines left by a timed-out command", skipped.len());
            self.pending -= 1;
        }
        Ok(())
    }

    /// Runs `command` and returns its stdout lines up to the terminator.
    pub async fn run(&mut self, command: &str) -> Result<Vec<String>> {
        self.resync().await?;

        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| PowerError::Reader("shell already closed".into()))?;
        let script = format!("{}\necho {}\n", command, TERMINATOR);
        stdin.write_all(script.as_bytes()).await?;
        stdin.flush().await?;

        match timeout(self.command_timeout, read_until_terminator(&mut self.stdout)).await {
            Ok(lines) => lines,
            Err(_) => {
                self.pending += 1;
                Err(PowerError::Reader(format!("command timed out: {}", command)))
            }
        }
    }

    pub async fn read_uids(&mut self, max: usize) -> Result<HashMap<u32, Uid>> {
        let command = format!(
            "grep -H '^Uid:' '{}'/[0-9]*/status 2>/dev/null",
            self.proc_dir.display()
        );
        let lines = self.run(&command).await?;

        let mut entries: Vec<(u32, Uid)> = lines
            .iter()
            .filter_map(|line| {
                let parsed = parse_uid_line(line);
                if parsed.is_none() {
                    debug!("Dropping malformed uid record: {:?}", line);
                }
                parsed
            })
            .collect();
        entries.sort_unstable_by_key(|(pid, _)| *pid);
        entries.truncate(max);
        Ok(entries.into_iter().collect())
    }

    pub async fn read_times(&mut self, max: usize) -> Result<HashMap<u32, PidTimes>> {
        let command = format!("cat '{}'/[0-9]*/stat 2>/dev/null", self.proc_dir.display());
        let lines = self.run(&command).await?;

        let mut entries: Vec<(u32, PidTimes)> = lines
            .iter()
            .filter_map(|line| match parse_pid_stat(line) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    debug!("Dropping record: {}", e);
                    None
                }
            })
            .collect();
        entries.sort_unstable_by_key(|(pid, _)| *pid);
        entries.truncate(max);
        Ok(entries.into_iter().collect())
    }

    /// Sends `exit`, waits for the shell and drops its pipes.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(mut stdin) = self.stdin.take() {
            // the shell may already be gone
            let _ = stdin.write_all(b"exit\n").await;
            let _ = stdin.flush().await;
        }

        match timeout(EXIT_TIMEOUT, self.child.wait()).await {
            Ok(status) => {
                let status = status?;
                debug!("Shell reader exited with {}", status);
                Ok(())
            }
            Err(_) => {
                self.child.kill().await?;
                Err(PowerError::Reader("shell did not exit, killed".into()))
            }
        }
    }
}

async fn read_until_terminator(stdout: &mut Lines<BufReader<ChildStdout>>) -> Result<Vec<String>> {
    let mut lines = Vec::new();
    loop {
        match stdout.next_line().await? {
            Some(line) if line == TERMINATOR => return Ok(lines),
            Some(line) => lines.push(line),
            None => return Err(PowerError::Reader("shell closed its output".into())),
        }
    }
}

/// Parses a `grep -H` line such as `/proc/42/status:Uid:\t1000\t1000\t...`.
fn parse_uid_line(line: &str) -> Option<(u32, Uid)> {
    let (path, rest) = line.split_once(":Uid:")?;
    let pid = Path::new(path)
        .parent()?
        .file_name()?
        .to_str()?
        .parse()
        .ok()?;
    let uid = rest.split_whitespace().next()?.parse().ok()?;
    Some((pid, Uid(uid)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_parse_uid_line() {
        assert_eq!(
            parse_uid_line("/proc/42/status:Uid:\t1000\t1000\t1000\t1000"),
            Some((42, Uid(1000)))
        );
        assert_eq!(parse_uid_line("/proc/self/status:Uid:\t0"), None);
        assert_eq!(parse_uid_line("garbage"), None);
    }

    #[tokio::test]
    async fn test_shell_reader_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let proc_dir = dir.path().join("proc");
        for (pid, uid) in [(7u32, 1000u32), (12, 10061)] {
            let pdir = proc_dir.join(pid.to_string());
            fs::create_dir_all(&pdir).unwrap();
            fs::write(pdir.join("status"), format!("Name:\tp\nUid:\t{}\t{}\t{}\t{}\n", uid, uid, uid, uid))
                .unwrap();
            fs::write(
                pdir.join("stat"),
                format!("{} (p) S 1 1 1 0 -1 0 0 0 0 0 {} 5 0 0 20 0 1 0 100 0 0\n", pid, pid * 10),
            )
            .unwrap();
        }

        let mut reader = ShellReader::spawn("sh", &proc_dir).unwrap();

        let echo = reader.run("echo hello").await.unwrap();
        assert_eq!(echo, vec!["hello".to_string()]);

        let uids = reader.read_uids(100).await.unwrap();
        assert_eq!(uids.get(&12), Some(&Uid(10061)));
        assert_eq!(uids.len(), 2);

        let times = reader.read_times(1).await.unwrap();
        assert_eq!(times.len(), 1);
        assert_eq!(times.get(&7), Some(&PidTimes { usr: 70, sys: 5 }));

        reader.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_timed_out_output_is_not_returned_later() {
        let dir = tempfile::tempdir().unwrap();
        let mut reader = ShellReader::spawn("sh", dir.path())
            .unwrap()
            .with_command_timeout(Duration::from_millis(300));

        assert!(reader.run("sleep 1; echo late").await.is_err());

        // the shell is still busy, so the next command fails too
        assert!(reader.run("echo busy").await.is_err());

        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert_eq!(reader.run("echo now").await.unwrap(), vec!["now".to_string()]);
        assert_eq!(reader.run("echo next").await.unwrap(), vec!["next".to_string()]);

        reader.shutdown().await.unwrap();
    }
}

use std::{
    io::Write,
    path::PathBuf,
    process::{Command, Stdio},
    sync::mpsc,
    thread,
    time::Duration,
};

use anyhow::{Context, Result, anyhow, bail};
use tracing as log;

use crate::error::ChangerError;

#[derive(Clone, Debug)]
pub struct CmdSpec {
    program: PathBuf,
    args: Vec<String>,
}

impl CmdSpec {
    #[must_use]
    pub fn new<P: Into<PathBuf>>(program: P) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    #[must_use]
    pub fn arg(mut self, a: impl Into<String>) -> Self {
        self.args.push(a.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, it: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(it.into_iter().map(Into::into));
        self
    }

    pub fn render(&self) -> String {
        let prog = sh_quote(&self.program.display().to_string());
        if self.args.is_empty() {
            return prog;
        }
        let args: Vec<String> = self.args.iter().map(|a| sh_quote(a)).collect();
        format!("{} {}", prog, args.join(" "))
    }

    fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd
    }
}

pub trait Runner: Send + Sync {
    /// Spawns `spec`, writes `input` to its stdin (giving up after
    /// `ready_timeout`), closes stdin and waits for exit. Returns stdout.
    fn run_with_input(&self, spec: &CmdSpec, input: &str, ready_timeout: Duration)
    -> Result<String>;
}

#[derive(Default, Clone)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        Self
    }
}

impl Runner for ProcessRunner {
    fn run_with_input(
        &self,
        spec: &CmdSpec,
        input: &str,
        ready_timeout: Duration,
    ) -> Result<String> {
        log::debug!("exec: {}", spec.render());

        let mut child = spec
            .to_command()
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("spawn {}", spec.render()))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin piping not available for {}", spec.render()))?;
        let payload = input.to_owned();
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let res = stdin.write_all(payload.as_bytes());
            drop(stdin);
            let _ = tx.send(res);
        });

        match rx.recv_timeout(ready_timeout) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(e).with_context(|| format!("send input to {}", spec.render()));
            }
            Err(_) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(ChangerError::Timeout(format!(
                    "after {}s sending input to {}",
                    ready_timeout.as_secs(),
                    spec.render()
                ))
                .into());
            }
        }

        let out = child
            .wait_with_output()
            .with_context(|| format!("wait for {}", spec.render()))?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            bail!(
                "command failed: {} with {} {}",
                spec.render(),
                out.status,
                stderr.trim()
            );
        }
        Ok(String::from_utf8_lossy(&out.stdout).to_string())
    }
}

fn sh_quote(s: &str) -> String {
    if s.is_empty() {
        return "''".into();
    }
    if !s
        .bytes()
        .any(|b| b == b' ' || b == b'\'' || b == b'"' || b == b'\\' || b == b'\n')
    {
        return s.to_string();
    }
    let mut out = String::from("'");
    for c in s.chars() {
        if c == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(c);
        }
    }
    out.push('\'');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sh_quote_empty() {
        assert_eq!(sh_quote(""), "''");
    }

    #[test]
    fn sh_quote_simple() {
        assert_eq!(sh_quote("bconsole"), "bconsole");
    }

    #[test]
    fn sh_quote_with_space() {
        assert_eq!(sh_quote("hello world"), "'hello world'");
    }

    #[test]
    fn sh_quote_with_single_quote() {
        assert_eq!(sh_quote("don't"), "'don'\\''t'");
    }

    #[test]
    fn cmd_spec_render() {
        let cmd = CmdSpec::new("/usr/sbin/bconsole")
            .arg("-c")
            .arg("/etc/bacula/my conf")
            .args(["-n", "-u", "30"]);
        assert_eq!(
            cmd.render(),
            "/usr/sbin/bconsole -c '/etc/bacula/my conf' -n -u 30"
        );
        assert_eq!(CmdSpec::new("true").render(), "true");
    }

    #[cfg(unix)]
    #[test]
    fn feeds_stdin_and_captures_stdout() {
        let out = ProcessRunner::new()
            .run_with_input(
                &CmdSpec::new("cat"),
                "update slots\n",
                Duration::from_secs(5),
            )
            .unwrap();
        assert_eq!(out, "update slots\n");
    }

    #[cfg(unix)]
    #[test]
    fn non_zero_exit_is_an_error() {
        let err = ProcessRunner::new()
            .run_with_input(
                &CmdSpec::new("sh").args(["-c", "cat >/dev/null; exit 3"]),
                "x\n",
                Duration::from_secs(5),
            )
            .unwrap_err()
            .to_string();
        assert!(err.contains("command failed"), "err was: {err}");
    }

    #[test]
    fn missing_program_is_an_error() {
        let err = ProcessRunner::new()
            .run_with_input(
                &CmdSpec::new("/nonexistent/vchanger-test-console"),
                "x\n",
                Duration::from_secs(1),
            )
            .unwrap_err()
            .to_string();
        assert!(err.contains("spawn"), "err was: {err}");
    }
}

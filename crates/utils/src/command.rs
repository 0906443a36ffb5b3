//! Helpers intended for [`std::process::Command`] and related structures.

use std::io::{BufRead, BufReader, Read, Seek};
use std::process::Command;

use anyhow::{Context, Result};

/// How many bytes of child stderr we include in an error.
const MAX_STDERR_BYTES: u64 = 1024;

/// Helpers intended for [`std::process::Command`].
pub trait CommandRunExt {
    /// Log (at debug level) the full child commandline.
    fn log_debug(&mut self) -> &mut Self;

    /// Execute the child process, capturing stderr; a nonzero exit status
    /// is turned into an error that includes the tail of stderr.
    fn run_capture_stderr(&mut self) -> Result<()>;

    /// Execute the child process and capture its output. This uses `run_capture_stderr`
    /// semantics and will return an error if the child process exits abnormally.
    fn run_get_output(&mut self) -> Result<Box<dyn BufRead>>;

    /// Execute the child process, returning its stdout as a string.
    fn run_get_string(&mut self) -> Result<String>;

    /// Execute the child process, parsing its stdout as JSON.
    fn run_and_parse_json<T: serde::de::DeserializeOwned>(&mut self) -> Result<T>;

    /// Render the command in a form suitable for copy-pasting into a shell.
    fn to_string_pretty(&self) -> String;
}

/// Read the last bytes of a file as (lossy) UTF-8.
fn last_utf8_content_from_file(mut f: std::fs::File) -> String {
    let Ok(len) = f.seek(std::io::SeekFrom::End(0)) else {
        return String::new();
    };
    let start = len.saturating_sub(MAX_STDERR_BYTES);
    if f.seek(std::io::SeekFrom::Start(start)).is_err() {
        return String::new();
    }
    let mut buf = Vec::new();
    if f.read_to_end(&mut buf).is_err() {
        return String::new();
    }
    String::from_utf8_lossy(&buf).trim().to_string()
}

fn check_status(cmd: &Command, status: std::process::ExitStatus, stderr: std::fs::File) -> Result<()> {
    if status.success() {
        return Ok(());
    }
    let stderr_buf = last_utf8_content_from_file(stderr);
    let program = cmd.get_program().to_string_lossy();
    anyhow::bail!("Subprocess {program} failed: {status}\n{stderr_buf}")
}

impl CommandRunExt for Command {
    fn log_debug(&mut self) -> &mut Self {
        tracing::debug!("exec: {}", self.to_string_pretty());
        self
    }

    fn run_capture_stderr(&mut self) -> Result<()> {
        let stderr = tempfile::tempfile()?;
        self.stderr(stderr.try_clone()?);
        tracing::trace!("exec: {self:?}");
        let program = self.get_program().to_string_lossy().into_owned();
        let status = self
            .status()
            .with_context(|| format!("Spawning {program}"))?;
        check_status(self, status, stderr)
    }

    fn run_get_output(&mut self) -> Result<Box<dyn BufRead>> {
        let mut stdout = tempfile::tempfile()?;
        self.stdout(stdout.try_clone()?);
        self.run_capture_stderr()?;
        stdout.seek(std::io::SeekFrom::Start(0)).context("seek")?;
        Ok(Box::new(BufReader::new(stdout)))
    }

    fn run_get_string(&mut self) -> Result<String> {
        let mut s = String::new();
        let mut o = self.run_get_output()?;
        o.read_to_string(&mut s)?;
        Ok(s)
    }

    fn run_and_parse_json<T: serde::de::DeserializeOwned>(&mut self) -> Result<T> {
        let output = self.run_get_output()?;
        serde_json::from_reader(output).map_err(Into::into)
    }

    fn to_string_pretty(&self) -> String {
        std::iter::once(self.get_program())
            .chain(self.get_args())
            .map(|arg| {
                let arg = arg.to_string_lossy();
                shlex::try_quote(&arg)
                    .map(|q| q.into_owned())
                    .unwrap_or_else(|_| arg.into_owned())
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_run_ext() {
        Command::new("true").run_capture_stderr().unwrap();
        assert!(Command::new("false").run_capture_stderr().is_err());
        let e = Command::new("/bin/sh")
            .args(["-c", "echo expected-this-oops-message 1>&2; exit 1"])
            .run_capture_stderr()
            .err()
            .unwrap();
        similar_asserts::assert_eq!(
            e.to_string(),
            "Subprocess /bin/sh failed: exit status: 1\nexpected-this-oops-message"
        );
    }

    #[test]
    fn command_run_get_string() {
        let s = Command::new("echo").arg("hello").run_get_string().unwrap();
        assert_eq!(s, "hello\n");
    }

    #[test]
    fn command_run_and_parse_json() {
        #[derive(serde::Deserialize)]
        struct Foo {
            a: String,
            b: u32,
        }
        let v: Foo = Command::new("echo")
            .arg(r#"{"a": "somevalue", "b": 42}"#)
            .run_and_parse_json()
            .unwrap();
        assert_eq!(v.a, "somevalue");
        assert_eq!(v.b, 42);
    }

    #[test]
    fn command_to_string_pretty() {
        let mut c = Command::new("mount");
        c.args(["-o", "bind,ro", "/some path", "/target"]);
        assert_eq!(c.to_string_pretty(), "mount -o bind,ro '/some path' /target");
    }
}

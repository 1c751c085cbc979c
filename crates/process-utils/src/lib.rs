//! Helpers for spawning the external media tools (yt-dlp, ffmpeg).
//!
//! Every command built here runs without a console window on Windows and,
//! for the async variant, is killed when its future is dropped so a timed
//! out or cancelled extraction never leaves an orphaned process behind.

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Maximum number of stderr bytes kept from a finished process.
pub const DEFAULT_STDERR_TAIL_BYTES: usize = 4096;

/// Apply the Windows `CREATE_NO_WINDOW` flag to child processes.
///
/// On non-Windows targets this is a no-op.
pub trait NoWindowExt {
    fn no_window(&mut self);
}

/// Keep at most the last `max_bytes` of `text`, cut on a char boundary.
pub fn tail(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut start = text.len() - max_bytes;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

/// Errors raised while running an external program.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to wait for {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with {}", exit_label(.code))]
    NonZeroExit {
        program: String,
        code: Option<i32>,
        stderr_tail: String,
    },
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(c) => format!("code {c}"),
        None => "a signal".to_string(),
    }
}

/// Output of a process that ran to completion.
#[derive(Debug, Clone)]
pub struct CapturedOutput {
    pub program: String,
    /// Exit code, `None` when the process was terminated by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    /// Last bytes written to stderr.
    pub stderr_tail: String,
}

impl CapturedOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Turn a non-zero exit into a [`ProcessError::NonZeroExit`].
    pub fn check(self) -> Result<Self, ProcessError> {
        if self.success() {
            Ok(self)
        } else {
            Err(ProcessError::NonZeroExit {
                program: self.program,
                code: self.code,
                stderr_tail: self.stderr_tail,
            })
        }
    }
}

#[cfg(feature = "tokio")]
mod async_process {
    use std::process::Stdio;

    use super::{CapturedOutput, DEFAULT_STDERR_TAIL_BYTES, NoWindowExt, ProcessError, tail};
    use std::ffi::OsStr;

    impl NoWindowExt for tokio::process::Command {
        fn no_window(&mut self) {
            #[cfg(windows)]
            {
                use std::os::windows::process::CommandExt;
                self.as_std_mut().creation_flags(super::CREATE_NO_WINDOW);
            }
        }
    }

    /// Create a `tokio::process::Command` with `CREATE_NO_WINDOW` applied on Windows.
    ///
    /// The command is configured with `kill_on_drop(true)`.
    pub fn tokio_command(program: impl AsRef<OsStr>) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(program);
        cmd.no_window();
        cmd.kill_on_drop(true);
        cmd
    }

    /// Run `cmd` to completion, capturing stdout and the tail of stderr.
    ///
    /// A non-zero exit is not an error here; call [`CapturedOutput::check`]
    /// for that. Dropping the returned future kills the child.
    pub async fn run_captured(
        mut cmd: tokio::process::Command,
    ) -> Result<CapturedOutput, ProcessError> {
        let program = cmd.as_std().get_program().to_string_lossy().into_owned();

        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|source| ProcessError::Spawn {
            program: program.clone(),
            source,
        })?;

        let output = child
            .wait_with_output()
            .await
            .map_err(|source| ProcessError::Wait {
                program: program.clone(),
                source,
            })?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        Ok(CapturedOutput {
            program,
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr_tail: tail(stderr.trim_end(), DEFAULT_STDERR_TAIL_BYTES).to_string(),
        })
    }
}

#[cfg(feature = "tokio")]
pub use async_process::{run_captured, tokio_command};

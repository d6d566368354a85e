//! Thin wrapper around the external `ffmpeg` binary.
//!
//! Every invocation runs as a child process on the tokio runtime, bounded by a
//! timeout, so a hung tool only fails its own request.

use std::{
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    time::Duration,
};

use thiserror::Error;
use tokio::process::Command;

const STDERR_TAIL_CHARS: usize = 2000;

#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("could not launch {binary}: {source}")]
    Launch {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{binary} exited with {status}: {stderr}")]
    Failed {
        binary: String,
        status: ExitStatus,
        stderr: String,
    },

    #[error("{binary} did not finish within {timeout:?}")]
    TimedOut { binary: String, timeout: Duration },
}

#[derive(Debug, Clone)]
pub struct Ffmpeg {
    binary: PathBuf,
    timeout: Duration,
}

impl Ffmpeg {
    pub fn new(binary: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Converts a text subtitle file (SRT, ASS, ...) to WebVTT.
    pub async fn convert_to_webvtt(&self, input: &Path, output: &Path) -> Result<(), TranscodeError> {
        let args = [
            "-i".into(),
            input.as_os_str().to_owned(),
            "-f".into(),
            "webvtt".into(),
            output.as_os_str().to_owned(),
        ];
        self.run(&args).await
    }

    /// Writes the first embedded subtitle stream of `video` as WebVTT.
    pub async fn extract_webvtt(&self, video: &Path, output: &Path) -> Result<(), TranscodeError> {
        let args = [
            "-i".into(),
            video.as_os_str().to_owned(),
            "-map".into(),
            "0:s:0".into(),
            "-c:s".into(),
            "webvtt".into(),
            "-f".into(),
            "webvtt".into(),
            output.as_os_str().to_owned(),
        ];
        self.run(&args).await
    }

    async fn run(&self, args: &[std::ffi::OsString]) -> Result<(), TranscodeError> {
        let binary = self.binary.display().to_string();
        let child = Command::new(&self.binary)
            .args(["-y", "-nostdin", "-hide_banner", "-loglevel", "error"])
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| TranscodeError::Launch {
                binary: binary.clone(),
                source,
            })?;

        tracing::debug!(%binary, ?args, "running transcoder");

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|source| TranscodeError::Launch {
                binary: binary.clone(),
                source,
            })?,
            Err(_) => {
                return Err(TranscodeError::TimedOut {
                    binary,
                    timeout: self.timeout,
                });
            }
        };

        let stderr = stderr_tail(&output.stderr);
        if output.status.success() {
            if !stderr.is_empty() {
                tracing::debug!(%binary, %stderr, "transcoder diagnostics");
            }
            Ok(())
        } else {
            tracing::warn!(%binary, status = %output.status, %stderr, "transcoder failed");
            Err(TranscodeError::Failed {
                binary,
                status: output.status,
                stderr,
            })
        }
    }
}

fn stderr_tail(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    let text = text.trim();
    let count = text.chars().count();
    if count <= STDERR_TAIL_CHARS {
        return text.to_string();
    }
    text.chars().skip(count - STDERR_TAIL_CHARS).collect()
}

/// Shell-script stand-ins for `ffmpeg`, shared by the crate's tests.
#[cfg(test)]
pub(crate) mod stub {
    use std::{
        fs,
        path::{Path, PathBuf},
    };

    /// Behaves like a tiny ffmpeg: with `-map` it "extracts" the input's
    /// `SUBS:` lines (and fails when there are none),
    /// otherwise it "converts" by prefixing the input with a WEBVTT header.
    /// Inputs containing `CORRUPT` fail the conversion.
    pub fn install(dir: &Path) -> PathBuf {
        write_script(
            dir,
            "ffmpeg",
            r#"#!/bin/sh
input=""
mapped=""
last=""
while [ $# -gt 0 ]; do
  case "$1" in
    -i) shift; input="$1" ;;
    -map) shift; mapped="$1" ;;
  esac
  last="$1"
  shift
done
output="$last"
if [ -n "$mapped" ]; then
  if grep -q '^SUBS:' "$input"; then
    printf 'WEBVTT\n\n' > "$output"
    sed -n 's/^SUBS://p' "$input" >> "$output"
    exit 0
  fi
  echo "Output file does not contain any stream" >&2
  exit 1
fi
if grep -q CORRUPT "$input"; then
  echo "Invalid data found when processing input" >&2
  exit 1
fi
printf 'WEBVTT\n\n' > "$output"
sed 's/,\([0-9][0-9][0-9]\)/.\1/g' "$input" >> "$output"
exit 0
"#,
        )
    }

    /// Never finishes on its own.
    pub fn install_hanging(dir: &Path) -> PathBuf {
        write_script(dir, "ffmpeg-hang", "#!/bin/sh\nsleep 30\n")
    }

    /// Succeeds without writing anything.
    pub fn install_silent(dir: &Path) -> PathBuf {
        write_script(dir, "ffmpeg-silent", "#!/bin/sh\nexit 0\n")
    }

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, body).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(&path).unwrap().permissions();
            perms.set_mode(0o755);
            fs::set_permissions(&path, perms).unwrap();
        }
        path
    }
}

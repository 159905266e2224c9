use std::ffi::OsStr;
use std::io::{self, Read};
use std::process::{Command, ExitStatus, Stdio};

use anyhow::{Context, Result};

const MAX_CAPTURE_BYTES: usize = 1024 * 1024;

#[derive(Debug)]
pub struct CombinedOutput {
    pub status: ExitStatus,
    /// Interleaved stdout and stderr, lossily decoded.
    pub output: String,
}

/// Run a program to completion with stdout and stderr captured into one
/// stream, the way a diagnostic message should show them.
///
/// There is no timeout: a program that never exits blocks the caller.
///
/// # Errors
///
/// Returns an error when the program cannot be spawned or its output cannot be
/// read. A non-zero exit is not an error here; callers inspect `status`.
pub fn run_combined<I, S>(program: &str, args: I) -> Result<CombinedOutput>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let (mut reader, writer) = io::pipe().context("failed to create output pipe")?;
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(
            writer
                .try_clone()
                .context("failed to duplicate output pipe")?,
        )
        .stderr(writer);
    let mut child = command
        .spawn()
        .with_context(|| format!("failed to start {program}"))?;
    // the command still owns the write ends; reading would never see EOF
    drop(command);

    let (output, truncated) = read_to_string_limited(&mut reader, MAX_CAPTURE_BYTES)
        .with_context(|| format!("failed to read output of {program}"))?;
    let status = child
        .wait()
        .with_context(|| format!("failed to wait for {program}"))?;
    let mut output = output;
    if truncated {
        output.push_str("\n[...truncated...]\n");
    }
    Ok(CombinedOutput { status, output })
}

fn read_to_string_limited(reader: &mut impl Read, limit: usize) -> io::Result<(String, bool)> {
    let mut buffer = Vec::new();
    let mut truncated = false;
    let mut chunk = [0u8; 8192];
    loop {
        let read = reader.read(&mut chunk)?;
        if read == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buffer.len());
        if read > remaining {
            truncated = true;
        }
        buffer.extend_from_slice(&chunk[..read.min(remaining)]);
    }
    Ok((String::from_utf8_lossy(&buffer).to_string(), truncated))
}

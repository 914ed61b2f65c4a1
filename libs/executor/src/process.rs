//! Invocation of the user synthesizer process: input ResourceList on
//! stdin, output ResourceList captured from stdout, bounded by the
//! synthesizer's exec timeout.

use crate::error::{Error, Result};
use crate::krm::ResourceList;

use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use eno_api::Synthesizer;

const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(60);

pub fn exec_timeout(synth: &Synthesizer) -> Duration {
    synth
        .spec
        .exec_timeout
        .as_deref()
        .and_then(|t| humantime::parse_duration(t).ok())
        .unwrap_or(DEFAULT_EXEC_TIMEOUT)
}

/// Output of one synthesizer invocation that exited zero.
#[derive(Debug)]
pub struct SynthesizerOutput {
    pub list: ResourceList,
    pub stderr: String,
}

/// Run the configured command to completion. A non-zero exit is a terminal
/// user error carrying the stderr tail; a timeout kills the process and is
/// reported the same way.
pub async fn invoke(synth: &Synthesizer, input: &ResourceList) -> Result<SynthesizerOutput> {
    let Some((program, args)) = synth.spec.command.split_first() else {
        return Err(Error::InvalidSynthesizer("empty command".into()));
    };

    let stdin_payload = serde_json::to_vec(input)?;
    debug!(
        msg = "invoking synthesizer",
        program,
        input_bytes = stdin_payload.len()
    );

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| Error::Spawn {
            program: program.clone(),
            source,
        })?;

    let mut stdin = child.stdin.take().ok_or(Error::InvalidSynthesizer(
        "child stdin unavailable".into(),
    ))?;
    stdin.write_all(&stdin_payload).await.map_err(Error::Io)?;
    drop(stdin);

    let timeout = exec_timeout(synth);
    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(output) => output.map_err(Error::Io)?,
        Err(_) => {
            warn!(msg = "synthesizer timed out", ?timeout);
            return Err(Error::Timeout { timeout });
        }
    };

    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    if !output.status.success() {
        return Err(Error::UserProcess {
            code: output.status.code().unwrap_or(-1),
            stderr: tail(&stderr, 2048),
        });
    }

    let list: ResourceList =
        serde_json::from_slice(&output.stdout).map_err(|source| Error::InvalidOutput { source })?;
    Ok(SynthesizerOutput { list, stderr })
}

fn tail(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let start = s.len() - max;
    // avoid splitting a UTF-8 sequence
    let start = (start..s.len()).find(|i| s.is_char_boundary(*i)).unwrap_or(start);
    s[start..].to_string()
}

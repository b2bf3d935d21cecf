use crate::job::Job;
use crate::types::ExitCode;
use futures::Stream;
use std::os::unix::process::ExitStatusExt;
use std::{io, pin::Pin, process::ExitStatus, process::Stdio};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio_stream::{wrappers::LinesStream, StreamExt};

/// Merged stdout + stderr of a child, one item per line.
pub(crate) type LineStream = Pin<Box<dyn Stream<Item = io::Result<String>> + Send>>;

/// Spawn the job's command with stdout and stderr piped and stdin closed.
pub(crate) fn spawn(job: &Job, kill_on_drop: bool) -> io::Result<Child> {
    Command::new(&job.command)
        .args(&job.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(kill_on_drop)
        .spawn()
}

/// Take the child's pipes and merge them into one stream of lines.
///
/// Lines keep their order within each pipe; the two pipes interleave as data arrives.
pub(crate) fn merged_lines(child: &mut Child) -> LineStream {
    let stdout = child
        .stdout
        .take()
        .map(|out| LinesStream::new(BufReader::new(out).lines()));
    let stderr = child
        .stderr
        .take()
        .map(|err| LinesStream::new(BufReader::new(err).lines()));
    let lines: LineStream = match (stdout, stderr) {
        (Some(out), Some(err)) => Box::pin(out.merge(err)),
        (Some(out), None) => Box::pin(out),
        (None, Some(err)) => Box::pin(err),
        (None, None) => Box::pin(tokio_stream::empty()),
    };
    Box::pin(lines.map(|line| line.map(|text| text.trim_end().to_string())))
}

/// Exit code of a finished child plus a description when it died by signal.
pub(crate) fn exit_outcome(status: ExitStatus) -> (Option<ExitCode>, Option<String>) {
    match (status.code(), status.signal()) {
        (Some(code), _) => (Some(code), None),
        (None, Some(signal)) => (None, Some(format!("killed by signal {}", signal))),
        (None, None) => (None, None),
    }
}

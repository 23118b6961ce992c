//! External process plumbing: argument templating, spawning, termination,
//! output line framing and the bounded stderr tail.
//!
//! The argument template understands these placeholders:
//!
//! | Placeholder      | Value                                   |
//! |------------------|-----------------------------------------|
//! | `{input}`        | path of the uploaded artifact           |
//! | `{output}`       | path the result must be written to      |
//! | `{output_dir}`   | directory containing `{output}`         |
//! | `{job_id}`       | job id                                  |
//! | `{num_speakers}` | speaker hint, empty when unset          |
//! | `{language}`     | language hint, empty when unset         |
//!
//! An argument that renders to an empty string is dropped. Unknown
//! placeholders are passed through verbatim. The same values are also
//! exported as `MURMUR_*` environment variables.

use std::collections::VecDeque;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::LazyLock;
use std::time::Duration;

use murmur_core::job::JobParams;
use murmur_core::types::JobId;
use regex::{Captures, Regex};
use tokio::process::{Child, Command};
use tokio_util::bytes::BytesMut;
use tokio_util::codec::Decoder;

use crate::config::ProcessCommand;

/// Longest output line passed to stage detection, in bytes.
pub const MAX_LINE_BYTES: usize = 8 * 1024;

/// Longest stderr line kept in the failure tail, in characters.
pub const MAX_TAIL_LINE_CHARS: usize = 512;

static PLACEHOLDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{(\w+)\}").expect("valid regex"));

// ---------------------------------------------------------------------------
// Invocation
// ---------------------------------------------------------------------------

/// Everything one process run needs to know about its job.
#[derive(Debug, Clone, Copy)]
pub struct Invocation<'a> {
    pub job_id: JobId,
    pub input: &'a Path,
    pub output: &'a Path,
    pub output_dir: &'a Path,
    pub params: &'a JobParams,
}

impl Invocation<'_> {
    fn placeholder(&self, name: &str) -> Option<String> {
        let value = match name {
            "input" => self.input.display().to_string(),
            "output" => self.output.display().to_string(),
            "output_dir" => self.output_dir.display().to_string(),
            "job_id" => self.job_id.to_string(),
            "num_speakers" => self
                .params
                .num_speakers
                .map(|n| n.to_string())
                .unwrap_or_default(),
            "language" => self.params.language.clone().unwrap_or_default(),
            _ => return None,
        };
        Some(value)
    }

    /// Environment exported to the process.
    pub fn env_vars(&self) -> Vec<(&'static str, String)> {
        let mut vars = vec![
            ("MURMUR_JOB_ID", self.job_id.to_string()),
            ("MURMUR_INPUT", self.input.display().to_string()),
            ("MURMUR_OUTPUT", self.output.display().to_string()),
            ("MURMUR_OUTPUT_DIR", self.output_dir.display().to_string()),
        ];
        if let Some(n) = self.params.num_speakers {
            vars.push(("MURMUR_NUM_SPEAKERS", n.to_string()));
        }
        if let Some(language) = &self.params.language {
            vars.push(("MURMUR_LANGUAGE", language.clone()));
        }
        vars
    }
}

/// Substitute placeholders in every template argument.
pub fn render_args(template: &[String], invocation: &Invocation<'_>) -> Vec<String> {
    template
        .iter()
        .map(|arg| {
            PLACEHOLDER_RE
                .replace_all(arg, |caps: &Captures<'_>| {
                    invocation
                        .placeholder(&caps[1])
                        .unwrap_or_else(|| caps[0].to_string())
                })
                .into_owned()
        })
        .filter(|arg| !arg.is_empty())
        .collect()
}

/// Build the command for one job.
///
/// stdin is closed, both output streams are piped, the working directory
/// is the job's own directory, and the process leads a new process group
/// so termination reaches anything it forks.
pub fn build_command(
    command: &ProcessCommand,
    invocation: &Invocation<'_>,
    working_dir: &Path,
) -> Command {
    let mut cmd = Command::new(&command.program);
    cmd.args(render_args(&command.args, invocation))
        .envs(invocation.env_vars())
        .current_dir(working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);
    cmd
}

// ---------------------------------------------------------------------------
// Termination
// ---------------------------------------------------------------------------

/// Stop a running process: SIGTERM to its group, then SIGKILL once
/// `grace` has elapsed. Always reaps the child.
pub async fn terminate(child: &mut Child, grace: Duration) -> std::io::Result<ExitStatus> {
    let Some(pid) = child.id() else {
        // Already reaped.
        return child.wait().await;
    };

    if !signal_group(pid, Signal::Term) {
        child.start_kill()?;
        return child.wait().await;
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            tracing::warn!(pid, grace_secs = grace.as_secs(), "Process ignored SIGTERM, killing");
            if !signal_group(pid, Signal::Kill) {
                // Leader may be gone while its group lingers; the child
                // handle is still ours to kill.
                let _ = child.start_kill();
            }
            child.wait().await
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

/// Send a signal to the process group led by `pid`. Returns `false` if
/// the group could not be signalled.
#[cfg(unix)]
fn signal_group(pid: u32, signal: Signal) -> bool {
    let signo = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // Safety: kill(2) with a negative pid only signals the group; no memory
    // is shared with the callee.
    let ret = unsafe { libc::kill(-pgid, signo) };
    ret == 0
}

#[cfg(not(unix))]
fn signal_group(_pid: u32, _signal: Signal) -> bool {
    false
}

// ---------------------------------------------------------------------------
// Output lines
// ---------------------------------------------------------------------------

/// Splits process output into lines on `\n` or `\r`.
///
/// Decoding never fails: invalid UTF-8 is replaced, blank lines are skipped
/// and a line longer than `max_length` bytes is cut, with the rest of it
/// discarded up to the next break. The pipe is therefore read until the
/// process closes it, and carriage-return progress bars yield one line per
/// redraw.
#[derive(Debug, Clone)]
pub struct OutputLineCodec {
    max_length: usize,
    /// Bytes of the buffer already searched for a break.
    next_index: usize,
    /// Inside an over-long line whose head has been emitted.
    discarding: bool,
}

impl OutputLineCodec {
    pub fn new(max_length: usize) -> Self {
        Self {
            max_length: max_length.max(1),
            next_index: 0,
            discarding: false,
        }
    }

    fn decode_line(&self, bytes: &[u8]) -> String {
        let bytes = &bytes[..bytes.len().min(self.max_length)];
        String::from_utf8_lossy(bytes).into_owned()
    }
}

impl Default for OutputLineCodec {
    fn default() -> Self {
        Self::new(MAX_LINE_BYTES)
    }
}

impl Decoder for OutputLineCodec {
    type Item = String;
    type Error = std::io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<String>, Self::Error> {
        loop {
            let line_break = buf[self.next_index..]
                .iter()
                .position(|b| matches!(b, b'\n' | b'\r'))
                .map(|offset| self.next_index + offset);

            match line_break {
                Some(index) => {
                    let line = buf.split_to(index + 1);
                    self.next_index = 0;
                    if std::mem::take(&mut self.discarding) || index == 0 {
                        continue;
                    }
                    return Ok(Some(self.decode_line(&line[..index])));
                }
                None if buf.len() > self.max_length => {
                    // No break anywhere in the buffer: keep the head, drop the rest.
                    let head = buf.split_to(self.max_length);
                    buf.clear();
                    self.next_index = 0;
                    if std::mem::replace(&mut self.discarding, true) {
                        return Ok(None);
                    }
                    return Ok(Some(self.decode_line(&head)));
                }
                None => {
                    self.next_index = buf.len();
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<String>, Self::Error> {
        if let Some(line) = self.decode(buf)? {
            return Ok(Some(line));
        }
        self.next_index = 0;
        let discarding = std::mem::take(&mut self.discarding);
        if buf.is_empty() || discarding {
            buf.clear();
            return Ok(None);
        }
        let rest = buf.split_to(buf.len());
        Ok(Some(self.decode_line(&rest)))
    }
}

// ---------------------------------------------------------------------------
// Stderr tail
// ---------------------------------------------------------------------------

/// The last `capacity` lines of a stream, each cut to
/// [`MAX_TAIL_LINE_CHARS`].
#[derive(Debug)]
pub struct StderrTail {
    lines: VecDeque<String>,
    capacity: usize,
}

impl StderrTail {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, line: &str) {
        if self.capacity == 0 {
            return;
        }
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        let line = match line.char_indices().nth(MAX_TAIL_LINE_CHARS) {
            Some((end, _)) => &line[..end],
            None => line,
        };
        self.lines.push_back(line.to_string());
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Joined with newlines, oldest first.
    pub fn render(&self) -> String {
        self.lines
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::Instant;

    use murmur_core::types::new_job_id;

    use super::*;

    fn args(template: &str) -> Vec<String> {
        ProcessCommand::parse_args(template)
    }

    #[test]
    fn placeholders_are_substituted() {
        let id = new_job_id();
        let input = PathBuf::from("/t/job/input.wav");
        let output = PathBuf::from("/t/job/output/result.json");
        let output_dir = PathBuf::from("/t/job/output");
        let params = JobParams {
            num_speakers: Some(3),
            language: Some("en".into()),
        };
        let invocation = Invocation {
            job_id: id,
            input: &input,
            output: &output,
            output_dir: &output_dir,
            params: &params,
        };

        let rendered = render_args(
            &args("--in={input} --out {output} -n {num_speakers} --lang {language} --id {job_id}"),
            &invocation,
        );
        assert_eq!(
            rendered,
            vec![
                "--in=/t/job/input.wav".to_string(),
                "--out".into(),
                "/t/job/output/result.json".into(),
                "-n".into(),
                "3".into(),
                "--lang".into(),
                "en".into(),
                "--id".into(),
                id.to_string(),
            ]
        );
    }

    #[test]
    fn unset_params_drop_their_argument() {
        let path = PathBuf::from("/x");
        let params = JobParams::default();
        let invocation = Invocation {
            job_id: new_job_id(),
            input: &path,
            output: &path,
            output_dir: &path,
            params: &params,
        };

        let rendered = render_args(&args("{input} {num_speakers} {language} {unknown}"), &invocation);
        assert_eq!(rendered, vec!["/x".to_string(), "{unknown}".into()]);

        let env = invocation.env_vars();
        assert!(env.iter().all(|(key, _)| *key != "MURMUR_NUM_SPEAKERS"));
    }

    #[test]
    fn stderr_tail_keeps_last_lines() {
        let mut tail = StderrTail::new(2);
        assert!(tail.is_empty());
        for line in ["one", "two", "three"] {
            tail.push(line);
        }
        assert_eq!(tail.render(), "two\nthree");

        let mut none = StderrTail::new(0);
        none.push("ignored");
        assert!(none.is_empty());
    }

    #[test]
    fn stderr_tail_truncates_long_lines() {
        let mut tail = StderrTail::new(1);
        tail.push(&"é".repeat(MAX_TAIL_LINE_CHARS + 10));
        assert_eq!(tail.render().chars().count(), MAX_TAIL_LINE_CHARS);
    }

    fn decode_all(codec: &mut OutputLineCodec, input: &[u8]) -> Vec<String> {
        let mut buf = BytesMut::from(input);
        let mut lines = Vec::new();
        while let Some(line) = codec.decode_eof(&mut buf).unwrap() {
            lines.push(line);
        }
        lines
    }

    #[test]
    fn output_lines_split_on_newline_and_carriage_return() {
        let mut codec = OutputLineCodec::default();
        let lines = decode_all(&mut codec, b"loading\r\n 10%|#\r 40%|####\r::stage::diarizing\rtail");
        assert_eq!(lines, vec!["loading", " 10%|#", " 40%|####", "::stage::diarizing", "tail"]);
    }

    #[test]
    fn invalid_utf8_is_replaced_not_fatal() {
        let mut codec = OutputLineCodec::default();
        let lines = decode_all(&mut codec, b"warn \xff\xfe bad bytes\n::stage::transcribing\n");
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("warn "));
        assert!(lines[0].contains('\u{FFFD}'));
        assert_eq!(lines[1], "::stage::transcribing");
    }

    #[test]
    fn over_long_lines_are_cut_and_the_rest_skipped() {
        let mut codec = OutputLineCodec::new(4);
        let mut buf = BytesMut::from(&b"abcdefgh"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("abcd"));
        assert!(buf.is_empty());

        // Remainder of the same line arrives in a later read.
        buf.extend_from_slice(b"ijklmnop");
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(b"qr\nok\n");
        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("ok"));
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), None);
    }

    #[test]
    fn partial_line_waits_for_more_input() {
        let mut codec = OutputLineCodec::default();
        let mut buf = BytesMut::from(&b"::stage::"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(b"finalizing\n");
        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("::stage::finalizing"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn terminate_escalates_to_kill() {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg("trap '' TERM; sleep 30")
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .expect("spawn sh");
        // Give the shell time to install the trap.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = Instant::now();
        let status = terminate(&mut child, Duration::from_millis(200))
            .await
            .expect("terminate");
        assert!(!status.success());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn terminate_after_exit_just_reaps() {
        let mut child = Command::new("true").spawn().expect("spawn true");
        child.wait().await.expect("wait");
        let status = terminate(&mut child, Duration::from_secs(1)).await.expect("terminate");
        assert!(status.success());
    }
}

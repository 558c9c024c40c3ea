//! Output capture and log fan-out for managed processes.
//!
//! Each process owns one [`LogFanout`]: raw bytes accumulate in per-stream
//! and combined buffers (arrival order preserved), while attached sinks
//! receive complete, prefixed lines over bounded channels. Sinks are weak
//! consumers: a slow or vanished sink loses data, never stalls a reader.
//!
//! Lock order is buffers → sinks in every path, which is what makes the
//! attach-time snapshot exactly-once: a reader cannot broadcast a chunk
//! between the snapshot and the sink insertion.

use std::sync::{
    RwLock,
    atomic::{AtomicU64, Ordering},
};

use derive_more::Display;

/// Capacity of each sink's line channel. On overflow, lines for that sink
/// are dropped.
pub const SINK_CHANNEL_CAPACITY: usize = 256;

/// Which output stream a chunk arrived on.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Display)]
pub enum LogStream {
    #[display("stdout")]
    Stdout,
    #[display("stderr")]
    Stderr,
}

impl LogStream {
    /// Prefix applied to every line delivered to sinks and streams.
    pub fn prefix(&self) -> &'static str {
        match self {
            LogStream::Stdout => "stdout:",
            LogStream::Stderr => "stderr:",
        }
    }
}

/// Accumulated output of a process.
#[derive(Default)]
struct LogBuffers {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    /// stdout and stderr interleaved in arrival order.
    combined: Vec<u8>,
    /// Set once the process has exited and both readers have drained; the
    /// buffers never change afterwards.
    finalized: bool,
}

impl LogBuffers {
    fn stream(&self, stream: LogStream) -> &[u8] {
        match stream {
            LogStream::Stdout => &self.stdout,
            LogStream::Stderr => &self.stderr,
        }
    }

    /// Complete lines currently in a stream's buffer, without trailing
    /// newlines. A trailing partial line is only included once the buffers
    /// are finalized; before that it still belongs to the reader's
    /// assembler and will be broadcast when it completes.
    fn snapshot_lines(&self, stream: LogStream) -> Vec<String> {
        let buf = self.stream(stream);
        let complete_end = if self.finalized {
            buf.len()
        } else {
            match buf.iter().rposition(|&b| b == b'\n') {
                Some(idx) => idx + 1,
                None => 0,
            }
        };
        if complete_end == 0 {
            return Vec::new();
        }
        let slice = &buf[..complete_end];
        let mut lines = slice
            .split(|&b| b == b'\n')
            .map(|line| String::from_utf8_lossy(line).into_owned())
            .collect::<Vec<_>>();
        if slice.ends_with(b"\n") {
            // split yields a trailing empty element after the final newline
            lines.pop();
        }
        lines
    }
}

/// Splits a byte stream into lines, holding the trailing partial line until
/// it completes. One assembler per stream, owned by that stream's reader.
#[derive(Default)]
pub struct LineAssembler {
    partial: Vec<u8>,
}

impl LineAssembler {
    /// Feed a chunk; returns the lines it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in chunk {
            if byte == b'\n' {
                lines.push(String::from_utf8_lossy(&self.partial).into_owned());
                self.partial.clear();
            } else {
                self.partial.push(byte);
            }
        }
        lines
    }

    /// Drain the trailing partial line, if any.
    pub fn flush(&mut self) -> Option<String> {
        if self.partial.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&self.partial).into_owned();
        self.partial.clear();
        Some(line)
    }
}

struct Sink {
    id: u64,
    tx: flume::Sender<String>,
}

/// Buffered output plus live line fan-out for one process.
pub struct LogFanout {
    buffers: RwLock<LogBuffers>,
    sinks: RwLock<Vec<Sink>>,
    next_sink_id: AtomicU64,
}

impl Default for LogFanout {
    fn default() -> Self {
        Self {
            buffers: RwLock::new(LogBuffers::default()),
            sinks: RwLock::new(Vec::new()),
            next_sink_id: AtomicU64::new(1),
        }
    }
}

impl LogFanout {
    /// Record a chunk and broadcast any lines it completes.
    pub fn ingest(&self, stream: LogStream, chunk: &[u8], assembler: &mut LineAssembler) {
        let buffers = &mut *self.buffers.write().expect("log buffers poisoned");
        if buffers.finalized {
            return;
        }
        match stream {
            LogStream::Stdout => buffers.stdout.extend_from_slice(chunk),
            LogStream::Stderr => buffers.stderr.extend_from_slice(chunk),
        }
        buffers.combined.extend_from_slice(chunk);

        let lines = assembler.push(chunk);
        if !lines.is_empty() {
            self.broadcast(stream, &lines);
        }
    }

    /// Broadcast a stream's trailing partial line. Called by the stream's
    /// reader at EOF.
    pub fn flush_stream(&self, stream: LogStream, assembler: &mut LineAssembler) {
        // Taken for ordering only: broadcasts always happen under the
        // buffers lock.
        let _buffers = self.buffers.read().expect("log buffers poisoned");
        if let Some(line) = assembler.flush() {
            self.broadcast(stream, std::slice::from_ref(&line));
        }
    }

    /// Mark the buffers immutable and drop all sinks. Dropping the senders
    /// ends every attached stream.
    pub fn finalize(&self) {
        self.buffers.write().expect("log buffers poisoned").finalized = true;
        self.sinks.write().expect("log sinks poisoned").clear();
    }

    /// Attach a sink: first the current contents of stdout then stderr are
    /// written to it as prefixed lines, then it joins the live set. Returns
    /// the id used to detach, or `None` (after delivering the snapshot) when
    /// the process has already finished.
    pub fn attach(&self) -> (Option<u64>, flume::Receiver<String>) {
        let buffers = self.buffers.read().expect("log buffers poisoned");
        let snapshot = [LogStream::Stdout, LogStream::Stderr].map(|stream| {
            (stream, buffers.snapshot_lines(stream))
        });

        // Size the channel so the snapshot always fits; only live output is
        // subject to overflow drops.
        let snapshot_len: usize = snapshot.iter().map(|(_, lines)| lines.len()).sum();
        let (tx, rx) = flume::bounded(snapshot_len + SINK_CHANNEL_CAPACITY);
        for (stream, lines) in &snapshot {
            for line in lines {
                let _ = tx.try_send(format!("{}{line}", stream.prefix()));
            }
        }
        if buffers.finalized {
            return (None, rx);
        }
        let id = self.next_sink_id.fetch_add(1, Ordering::Relaxed);
        self.sinks
            .write()
            .expect("log sinks poisoned")
            .push(Sink { id, tx });
        (Some(id), rx)
    }

    /// Remove a sink by id. Missing ids are fine: the sink may already have
    /// been dropped when the process exited.
    pub fn detach(&self, id: u64) {
        self.sinks
            .write()
            .expect("log sinks poisoned")
            .retain(|sink| sink.id != id);
    }

    /// Current output snapshots, lossily decoded.
    pub fn contents(&self) -> (String, String, String) {
        let buffers = self.buffers.read().expect("log buffers poisoned");
        (
            String::from_utf8_lossy(&buffers.stdout).into_owned(),
            String::from_utf8_lossy(&buffers.stderr).into_owned(),
            String::from_utf8_lossy(&buffers.combined).into_owned(),
        )
    }

    fn broadcast(&self, stream: LogStream, lines: &[String]) {
        let sinks = self.sinks.read().expect("log sinks poisoned");
        let mut dead = Vec::new();
        for sink in sinks.iter() {
            for line in lines {
                match sink.tx.try_send(format!("{}{line}", stream.prefix())) {
                    Ok(()) => {}
                    // Overflow: this sink loses the line by policy.
                    Err(flume::TrySendError::Full(_)) => {}
                    Err(flume::TrySendError::Disconnected(_)) => {
                        dead.push(sink.id);
                        break;
                    }
                }
            }
        }
        drop(sinks);
        if !dead.is_empty() {
            self.sinks
                .write()
                .expect("log sinks poisoned")
                .retain(|sink| !dead.contains(&sink.id));
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn drain(rx: &flume::Receiver<String>) -> Vec<String> {
        let mut lines = Vec::new();
        while let Ok(line) = rx.try_recv() {
            lines.push(line);
        }
        lines
    }

    #[test]
    fn assembler_splits_lines_across_chunks() {
        let mut asm = LineAssembler::default();
        assert_eq!(asm.push(b"hel"), Vec::<String>::new());
        assert_eq!(asm.push(b"lo\nwor"), vec!["hello"]);
        assert_eq!(asm.push(b"ld\n"), vec!["world"]);
        assert_eq!(asm.flush(), None);
    }

    #[test]
    fn ingest_preserves_arrival_order_in_combined() {
        let fanout = LogFanout::default();
        let mut out_asm = LineAssembler::default();
        let mut err_asm = LineAssembler::default();
        fanout.ingest(LogStream::Stdout, b"a\n", &mut out_asm);
        fanout.ingest(LogStream::Stderr, b"b\n", &mut err_asm);
        fanout.ingest(LogStream::Stdout, b"c\n", &mut out_asm);
        let (stdout, stderr, combined) = fanout.contents();
        assert_eq!(stdout, "a\nc\n");
        assert_eq!(stderr, "b\n");
        assert_eq!(combined, "a\nb\nc\n");
    }

    #[test]
    fn attach_snapshots_stdout_then_stderr() {
        let fanout = LogFanout::default();
        let mut out_asm = LineAssembler::default();
        let mut err_asm = LineAssembler::default();
        fanout.ingest(LogStream::Stdout, b"one\ntwo\n", &mut out_asm);
        fanout.ingest(LogStream::Stderr, b"oops\n", &mut err_asm);

        let (id, rx) = fanout.attach();
        assert!(id.is_some());
        assert_eq!(drain(&rx), vec!["stdout:one", "stdout:two", "stderr:oops"]);
    }

    #[test]
    fn snapshot_excludes_partial_line_until_finalized() {
        let fanout = LogFanout::default();
        let mut asm = LineAssembler::default();
        fanout.ingest(LogStream::Stdout, b"done\npart", &mut asm);

        let (id, rx) = fanout.attach();
        assert_eq!(drain(&rx), vec!["stdout:done"]);
        fanout.detach(id.expect("live sink"));

        // The partial line completes: only the full line is broadcast.
        let (id, rx) = fanout.attach();
        fanout.ingest(LogStream::Stdout, b"ial\n", &mut asm);
        assert_eq!(drain(&rx), vec!["stdout:done", "stdout:partial"]);
        fanout.detach(id.expect("live sink"));

        fanout.finalize();
        let (id, rx) = fanout.attach();
        assert_eq!(id, None);
        assert_eq!(drain(&rx), vec!["stdout:done", "stdout:partial"]);
    }

    #[test]
    fn live_lines_reach_attached_sinks() {
        let fanout = LogFanout::default();
        let mut asm = LineAssembler::default();
        let (_id, rx) = fanout.attach();
        fanout.ingest(LogStream::Stdout, b"hello\n", &mut asm);
        assert_eq!(drain(&rx), vec!["stdout:hello"]);
    }

    #[test]
    fn finalize_disconnects_sinks_and_freezes_buffers() {
        let fanout = LogFanout::default();
        let mut asm = LineAssembler::default();
        let (_id, rx) = fanout.attach();
        fanout.finalize();
        assert!(matches!(rx.try_recv(), Err(flume::TryRecvError::Disconnected)));

        fanout.ingest(LogStream::Stdout, b"late\n", &mut asm);
        let (stdout, _, _) = fanout.contents();
        assert_eq!(stdout, "");
    }
}

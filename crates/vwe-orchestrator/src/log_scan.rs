//! Incremental scanning of the collaborator's log stream.
//!
//! Chunks arrive in arbitrary sizes and may split lines or markers. Each
//! stream keeps a carry of the last `longest_marker - 1` bytes so a marker
//! straddling two reads is still found, plus a partial-line buffer for line
//! assembly. Markers are matched on the raw byte stream, not per line.
//! An unterminated line longer than [`MAX_LINE_BYTES`] is emitted in
//! pieces so the partial buffer stays bounded.

use std::collections::VecDeque;

use vwe_core::MarkerConfig;

use crate::collaborator::{LogChunk, LogStream};

pub const MAX_LINE_BYTES: usize = 16 * 1024;

#[derive(Debug, Default)]
struct StreamState {
    carry: Vec<u8>,
    partial: Vec<u8>,
}

#[derive(Debug)]
pub struct LogScanner {
    generation: Vec<Vec<u8>>,
    export: Vec<Vec<u8>>,
    critical: Vec<Vec<u8>>,
    noise: Vec<String>,
    carry_len: usize,
    streams: [StreamState; 2],
    generation_seen: bool,
    export_seen: bool,
    critical_seen: Option<String>,
    tail: VecDeque<String>,
    tail_cap: usize,
    pending: Vec<String>,
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty() && haystack.windows(needle.len()).any(|w| w == needle)
}

fn bytes(list: &[String]) -> Vec<Vec<u8>> {
    list.iter()
        .filter(|m| !m.is_empty())
        .map(|m| m.as_bytes().to_vec())
        .collect()
}

impl LogScanner {
    pub fn new(markers: &MarkerConfig, tail_cap: usize) -> Self {
        let generation = bytes(&markers.generation);
        let export = bytes(&markers.export);
        let critical = bytes(&markers.critical);
        let longest = generation
            .iter()
            .chain(&export)
            .chain(&critical)
            .map(Vec::len)
            .max()
            .unwrap_or(1);
        Self {
            generation,
            export,
            critical,
            noise: markers.noise.iter().filter(|n| !n.is_empty()).cloned().collect(),
            carry_len: longest.saturating_sub(1),
            streams: Default::default(),
            generation_seen: false,
            export_seen: false,
            critical_seen: None,
            tail: VecDeque::with_capacity(tail_cap),
            tail_cap,
            pending: Vec::new(),
        }
    }

    pub fn feed(&mut self, chunk: &LogChunk) {
        let idx = match chunk.stream {
            LogStream::Stdout => 0,
            LogStream::Stderr => 1,
        };

        let mut window = std::mem::take(&mut self.streams[idx].carry);
        window.extend_from_slice(&chunk.bytes);
        self.match_markers(&window);
        let keep = window.len().min(self.carry_len);
        self.streams[idx].carry = window.split_off(window.len() - keep);

        self.streams[idx].partial.extend_from_slice(&chunk.bytes);
        while let Some(pos) = self.streams[idx].partial.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.streams[idx].partial.drain(..=pos).collect();
            self.push_line(&line[..line.len() - 1]);
        }
        while self.streams[idx].partial.len() > MAX_LINE_BYTES {
            let piece: Vec<u8> = self.streams[idx].partial.drain(..MAX_LINE_BYTES).collect();
            self.push_line(&piece);
        }
    }

    /// Flush partial lines once the streams have ended.
    pub fn finish(&mut self) {
        for idx in 0..self.streams.len() {
            let line = std::mem::take(&mut self.streams[idx].partial);
            if !line.is_empty() {
                self.push_line(&line);
            }
        }
    }

    fn match_markers(&mut self, window: &[u8]) {
        if !self.generation_seen && self.generation.iter().any(|m| contains(window, m)) {
            self.generation_seen = true;
        }
        if !self.export_seen && self.export.iter().any(|m| contains(window, m)) {
            self.export_seen = true;
        }
        if self.critical_seen.is_none() {
            if let Some(m) = self.critical.iter().find(|m| contains(window, m)) {
                self.critical_seen = Some(String::from_utf8_lossy(m).into_owned());
            }
        }
    }

    fn push_line(&mut self, raw: &[u8]) {
        let line = String::from_utf8_lossy(raw);
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() || self.noise.iter().any(|n| line.contains(n.as_str())) {
            return;
        }
        if self.tail_cap > 0 {
            if self.tail.len() == self.tail_cap {
                self.tail.pop_front();
            }
            self.tail.push_back(line.to_string());
        }
        self.pending.push(line.to_string());
    }

    pub fn generation_seen(&self) -> bool {
        self.generation_seen
    }

    /// Export markers seen, or none configured.
    pub fn export_seen(&self) -> bool {
        self.export_seen || self.export.is_empty()
    }

    /// First critical marker seen.
    pub fn critical(&self) -> Option<&str> {
        self.critical_seen.as_deref()
    }

    pub fn tail(&self) -> Vec<String> {
        self.tail.iter().cloned().collect()
    }

    /// Filtered lines assembled since the last call.
    pub fn take_lines(&mut self) -> Vec<String> {
        std::mem::take(&mut self.pending)
    }
}

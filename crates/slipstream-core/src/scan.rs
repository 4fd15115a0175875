//! Signature scanning over the target's module image.
//!
//! Patterns are byte sequences with `??` wildcards. The scanner anchors
//! `memchr::memmem` on the longest literal run of the pattern and
//! verifies the full pattern at each candidate, reading the image in
//! chunks with a tail overlap so matches straddling a chunk boundary are
//! not lost.

use std::collections::HashMap;
use std::sync::Mutex;

use memchr::memmem;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::layout::timing::NEAR_SCAN_WINDOW;
use crate::process::{ProcessMemory, RemotePtr};

const CHUNK_SIZE: usize = 1 << 20;

/// How a signature was located, so callers can log scan degradation and
/// decide whether to refresh a cached offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Verified at a previously resolved address.
    Cached(RemotePtr),
    /// Verified at the expected static offset from the module base.
    Static(RemotePtr),
    /// Found by scanning a window around the expected offset.
    Near(RemotePtr),
    /// Found only by scanning the whole module.
    Full(RemotePtr),
}

impl Resolution {
    pub fn address(self) -> RemotePtr {
        match self {
            Resolution::Cached(a)
            | Resolution::Static(a)
            | Resolution::Near(a)
            | Resolution::Full(a) => a,
        }
    }
}

/// Pattern scanner with a per-key result cache.
#[derive(Default)]
pub struct ModuleScanner {
    cache: Mutex<HashMap<String, RemotePtr>>,
}

impl ModuleScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve a named signature, cheapest strategy first: cached address,
    /// then the static offset, then a window around it, then the full
    /// module image.
    pub fn resolve<M: ProcessMemory + ?Sized>(
        &self,
        mem: &M,
        key: &str,
        pattern: &[Option<u8>],
        static_offset: Option<u64>,
    ) -> Result<Resolution> {
        if let Some(cached) = self.cached(key) {
            if self.matches_at(mem, cached, pattern)? {
                return Ok(Resolution::Cached(cached));
            }
            debug!(key, addr = %cached, "cached signature address is stale");
            self.forget(key);
        }

        if let Some(offset) = static_offset {
            let expected = mem.base_address().offset(offset);
            if self.matches_at(mem, expected, pattern)? {
                self.remember(key, expected);
                return Ok(Resolution::Static(expected));
            }
            debug!(key, addr = %expected, "static offset mismatch, scanning nearby");
            if let Some(found) = self.scan_near(mem, pattern, expected)? {
                self.remember(key, found);
                return Ok(Resolution::Near(found));
            }
        }

        warn!(key, "falling back to full module scan");
        match self.scan(mem, pattern)? {
            Some(found) => {
                self.remember(key, found);
                Ok(Resolution::Full(found))
            }
            None => Err(Error::SignatureNotFound(key.to_string())),
        }
    }

    /// Scan the whole module image for the first match.
    pub fn scan<M: ProcessMemory + ?Sized>(
        &self,
        mem: &M,
        pattern: &[Option<u8>],
    ) -> Result<Option<RemotePtr>> {
        self.scan_range(mem, pattern, mem.base_address(), mem.module_size(), CHUNK_SIZE)
    }

    /// Scan a window either side of `around`, clamped to the module.
    pub fn scan_near<M: ProcessMemory + ?Sized>(
        &self,
        mem: &M,
        pattern: &[Option<u8>],
        around: RemotePtr,
    ) -> Result<Option<RemotePtr>> {
        let base = mem.base_address();
        let end = base.offset(mem.module_size() as u64);
        let start = around.saturating_sub(NEAR_SCAN_WINDOW as u64).max(base);
        let stop = around.offset(NEAR_SCAN_WINDOW as u64).min(end);
        let len = stop.distance_from(start).max(0) as usize;
        self.scan_range(mem, pattern, start, len, CHUNK_SIZE)
    }

    fn scan_range<M: ProcessMemory + ?Sized>(
        &self,
        mem: &M,
        pattern: &[Option<u8>],
        start: RemotePtr,
        len: usize,
        chunk_size: usize,
    ) -> Result<Option<RemotePtr>> {
        if pattern.is_empty() || len < pattern.len() {
            return Ok(None);
        }
        let (lit_off, literal) = longest_literal(pattern)
            .ok_or_else(|| Error::InvalidHookTable("pattern is all wildcards".to_string()))?;
        let finder = memmem::Finder::new(&literal);
        let overlap = pattern.len() - 1;

        let mut offset = 0usize;
        while offset < len {
            let want = (chunk_size + overlap).min(len - offset);
            let addr = start.offset(offset as u64);
            let chunk = match mem.read_bytes(addr, want) {
                Ok(bytes) => bytes,
                Err(e) => {
                    // Unreadable spans inside the image (guard pages) are
                    // skipped, not fatal.
                    warn!(addr = %addr, "unreadable span during scan: {e}");
                    offset += chunk_size;
                    continue;
                }
            };
            for hit in finder.find_iter(&chunk) {
                let Some(candidate) = hit.checked_sub(lit_off) else {
                    continue;
                };
                if candidate + pattern.len() <= chunk.len()
                    && pattern_matches(&chunk[candidate..], pattern)
                {
                    return Ok(Some(addr.offset(candidate as u64)));
                }
            }
            offset += chunk_size;
        }
        Ok(None)
    }

    fn matches_at<M: ProcessMemory + ?Sized>(
        &self,
        mem: &M,
        addr: RemotePtr,
        pattern: &[Option<u8>],
    ) -> Result<bool> {
        match mem.read_bytes(addr, pattern.len()) {
            Ok(bytes) => Ok(pattern_matches(&bytes, pattern)),
            // An unreadable expected site just means the hint is wrong.
            Err(_) => Ok(false),
        }
    }

    pub fn cached(&self, key: &str) -> Option<RemotePtr> {
        self.cache.lock().ok()?.get(key).copied()
    }

    fn remember(&self, key: &str, addr: RemotePtr) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(key.to_string(), addr);
        }
    }

    fn forget(&self, key: &str) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.remove(key);
        }
    }
}

fn pattern_matches(hay: &[u8], pattern: &[Option<u8>]) -> bool {
    hay.len() >= pattern.len()
        && pattern
            .iter()
            .zip(hay)
            .all(|(p, b)| p.map_or(true, |v| v == *b))
}

/// Longest run of concrete bytes, as (offset in pattern, bytes).
fn longest_literal(pattern: &[Option<u8>]) -> Option<(usize, Vec<u8>)> {
    let mut best: Option<(usize, Vec<u8>)> = None;
    let mut run_start = 0usize;
    let mut run: Vec<u8> = Vec::new();
    for (i, byte) in pattern.iter().chain(std::iter::once(&None)).enumerate() {
        match byte {
            Some(value) => {
                if run.is_empty() {
                    run_start = i;
                }
                run.push(*value);
            }
            None => {
                if best.as_ref().map_or(!run.is_empty(), |(_, b)| run.len() > b.len()) {
                    best = Some((run_start, std::mem::take(&mut run)));
                }
                run.clear();
            }
        }
    }
    best
}

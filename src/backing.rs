//! Backing store: the durable home of every allocated page.
//!
//! Pages are materialized zero-filled at admission, overwritten on eviction,
//! and read back on page faults. Frames are only a cache over this map. Each
//! eviction also appends a human-readable snapshot to the swap log file so
//! replacement activity can be inspected after a run.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::SystemTime;

use crate::memory::PageId;
use crate::report;
use crate::Pid;

/// Page repository keyed by page id, plus the on-disk eviction log.
#[derive(Debug)]
pub struct BackingStore {
    pages: Mutex<HashMap<PageId, Vec<u16>>>,
    log_path: PathBuf,
    frame_size: usize,
}

/// Everything the swap log records about one eviction.
#[derive(Debug, Clone)]
pub struct EvictionRecord {
    /// Identity of the evicted page.
    pub page_id: PageId,
    /// Owner's name, when the process could still be resolved.
    pub owner_name: Option<String>,
    /// Frame the page was evicted from.
    pub frame: usize,
    /// The page's words at eviction time.
    pub words: Vec<u16>,
    /// `(name, logical address, value)` rows when page 0 carried the
    /// symbol table.
    pub symbols: Option<Vec<(String, u32, u16)>>,
}

impl BackingStore {
    /// Create an empty store logging evictions to `log_path`.
    #[must_use]
    pub fn new(frame_size: usize, log_path: PathBuf) -> Self {
        Self {
            pages: Mutex::new(HashMap::new()),
            log_path,
            frame_size,
        }
    }

    /// Materialize a zero-filled page. Overwrites nothing if already present.
    pub fn create_zeroed(&self, page_id: PageId) {
        let mut pages = self.lock();
        pages
            .entry(page_id)
            .or_insert_with(|| vec![0; self.frame_size / 2]);
    }

    /// Store a page's words (eviction write-back).
    pub fn store(&self, page_id: PageId, words: Vec<u16>) {
        let mut pages = self.lock();
        pages.insert(page_id, words);
    }

    /// Load a page's words; zero-filled if the page was never created.
    #[must_use]
    pub fn load(&self, page_id: PageId) -> Vec<u16> {
        let pages = self.lock();
        pages
            .get(&page_id)
            .cloned()
            .unwrap_or_else(|| vec![0; self.frame_size / 2])
    }

    /// Whether a page exists in the store.
    #[must_use]
    pub fn contains(&self, page_id: PageId) -> bool {
        self.lock().contains_key(&page_id)
    }

    /// Drop every page owned by `pid`.
    pub fn remove_pages_of(&self, pid: Pid) {
        let mut pages = self.lock();
        pages.retain(|id, _| id.pid != pid);
    }

    /// Number of pages currently stored.
    #[must_use]
    pub fn page_count(&self) -> usize {
        self.lock().len()
    }

    /// Append a snapshot of one eviction to the swap log.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error if the log cannot be written.
    pub fn append_eviction_record(&self, record: &EvictionRecord) -> std::io::Result<()> {
        let mut out = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;

        let title = format!(
            "BACKING STORE SNAPSHOT - {}",
            report::wall_date_time(SystemTime::now())
        );
        const WIDTH: usize = 74;
        let pad = WIDTH.saturating_sub(title.len()) / 2;
        writeln!(out, "\n+{}+", "=".repeat(WIDTH))?;
        writeln!(
            out,
            "|{}{}{}|",
            " ".repeat(pad),
            title,
            " ".repeat(WIDTH.saturating_sub(pad + title.len()))
        )?;
        writeln!(out, "+{}+\n", "=".repeat(WIDTH))?;

        writeln!(out, "Evicted Page        : {}", record.page_id)?;
        match &record.owner_name {
            Some(name) => writeln!(
                out,
                "Owner Process       : {} (PID: {})",
                name, record.page_id.pid
            )?,
            None => writeln!(
                out,
                "Owner Process       : Unknown (PID: {})",
                record.page_id.pid
            )?,
        }
        writeln!(out, "Logical Page Number : {}", record.page_id.page)?;
        writeln!(out, "Evicted From Frame  : {}\n", record.frame)?;

        writeln!(
            out,
            "+----------------------------- Page Data (Hex) ----------------------------+"
        )?;
        writeln!(
            out,
            "| Offset | Value  | Offset | Value  | Offset | Value  | Offset | Value     |"
        )?;
        writeln!(
            out,
            "+--------+--------+--------+--------+--------+--------+--------+-----------+"
        )?;
        for (row_idx, row) in record.words.chunks(4).enumerate() {
            for (j, word) in row.iter().enumerate() {
                let logical = record.page_id.page * self.frame_size + (row_idx * 4 + j) * 2;
                write!(out, "| 0x{logical:02X} | 0x{word:04X} ")?;
            }
            for _ in row.len()..4 {
                write!(out, "|        |        ")?;
            }
            writeln!(out, "|")?;
        }
        writeln!(
            out,
            "+---------------------------------------------------------------------------+"
        )?;

        if let Some(symbols) = &record.symbols {
            writeln!(out, "\nSymbol Table (Page 0):")?;
            writeln!(out, "+----------+--------------+--------+")?;
            writeln!(out, "| Variable | Logical Addr | Value  |")?;
            writeln!(out, "+----------+--------------+--------+")?;
            for (name, addr, value) in symbols {
                writeln!(out, "| {name:<8} | {:>12} | 0x{value:04X} |", format!("0x{addr:X}"))?;
            }
            writeln!(out, "+----------+--------------+--------+")?;
        }
        writeln!(out, "{}", "=".repeat(WIDTH + 2))?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<PageId, Vec<u16>>> {
        self.pages.lock().expect("backing store lock poisoned")
    }
}

//! Best-effort extraction of machine specs from free-form product descriptions.
//!
//! Every function here is permissive: the first match wins and a missing pattern
//! degrades to `0`, `None`, `""` or [`StorageKind::Unknown`] instead of failing.

use std::sync::OnceLock;

use regex::Regex;
use vmfinder_core::StorageKind;

fn regex(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).expect("static pattern compiles"))
}

fn core_count_patterns() -> [&'static Regex; 3] {
    static DASHED: OnceLock<Regex> = OnceLock::new();
    static TIMES_CORE: OnceLock<Regex> = OnceLock::new();
    static TIMES_CPU: OnceLock<Regex> = OnceLock::new();
    [
        regex(&DASHED, r"(\d+)\s*[- ]?core"),
        regex(&TIMES_CORE, r"(\d+)\s*x\s*core"),
        regex(&TIMES_CPU, r"(\d+)\s*x\s*cpu"),
    ]
}

const CORE_WORDS: [(&str, u32); 5] = [
    ("single-core", 1),
    ("dual-core", 2),
    ("quad-core", 4),
    ("hexa-core", 6),
    ("octa-core", 8),
];

/// Core count, or `0` when the text names none. `0` means unknown.
pub fn parse_vcpus(text: &str) -> u32 {
    let lower = text.to_lowercase();

    for pattern in core_count_patterns() {
        if let Some(count) = pattern
            .captures(&lower)
            .and_then(|caps| caps[1].parse::<u32>().ok())
        {
            return count;
        }
    }

    CORE_WORDS
        .iter()
        .find(|(word, _)| lower.contains(word))
        .map(|(_, count)| *count)
        .unwrap_or(0)
}

/// Memory from the first line shaped like `<n> GB ... RAM`. Line order matters.
pub fn parse_memory_gb<S: AsRef<str>>(lines: &[S]) -> Option<f64> {
    static MEMORY: OnceLock<Regex> = OnceLock::new();
    let pattern = regex(&MEMORY, r"(?i)(\d+(?:\.\d+)?)\s*GB.*RAM");
    lines
        .iter()
        .find_map(|line| pattern.captures(line.as_ref()))
        .and_then(|caps| caps[1].parse().ok())
}

/// The first line mentioning a storage medium, or `""`.
pub fn extract_storage_line<S: AsRef<str>>(lines: &[S]) -> &str {
    static STORAGE: OnceLock<Regex> = OnceLock::new();
    let pattern = regex(&STORAGE, r"(?i)\b(SSD|HDD|NVMe|SATA)\b");
    lines
        .iter()
        .map(|line| line.as_ref())
        .find(|line| pattern.is_match(line))
        .unwrap_or("")
}

/// Total capacity of `<count> x <size> (TB|GB)` in whole GB; TB counts as 1024 GB.
///
/// `0` when the line is empty or unparseable, which is not a confirmed zero.
pub fn parse_storage_gb(storage_line: &str) -> u64 {
    static DRIVES: OnceLock<Regex> = OnceLock::new();
    if storage_line.is_empty() {
        return 0;
    }
    let pattern = regex(&DRIVES, r"(?i)(\d+)\s*x\s*(\d+(?:\.\d+)?)\s*(TB|GB)");
    let Some(caps) = pattern.captures(storage_line) else {
        return 0;
    };
    let (Ok(count), Ok(size)) = (caps[1].parse::<f64>(), caps[2].parse::<f64>()) else {
        return 0;
    };

    let mut total = count * size;
    if caps[3].eq_ignore_ascii_case("TB") {
        total *= 1024.0;
    }
    total as u64
}

/// Storage medium named on the line, NVMe > SSD > HDD > SATA.
pub fn parse_storage_type(storage_line: &str) -> StorageKind {
    let lower = storage_line.to_lowercase();
    [
        ("nvme", StorageKind::Nvme),
        ("ssd", StorageKind::Ssd),
        ("hdd", StorageKind::Hdd),
        ("sata", StorageKind::Sata),
    ]
    .into_iter()
    .find(|(needle, _)| lower.contains(needle))
    .map(|(_, kind)| kind)
    .unwrap_or(StorageKind::Unknown)
}

/// First line mentioning a `gbit` or `mbit` link, trimmed.
pub fn parse_network_performance<S: AsRef<str>>(lines: &[S]) -> Option<String> {
    lines
        .iter()
        .map(|line| line.as_ref())
        .find(|line| {
            let lower = line.to_lowercase();
            lower.contains("gbit") || lower.contains("mbit")
        })
        .map(|line| line.trim().to_string())
}

/// All attributes parsed from one product's description lines.
#[derive(Debug, Clone, PartialEq)]
pub struct SpecSheet {
    pub vcpus: u32,
    pub memory_gb: Option<f64>,
    pub storage_gb: u64,
    pub storage_type: StorageKind,
    pub network_performance: Option<String>,
}

impl SpecSheet {
    pub fn from_description<S: AsRef<str>>(lines: &[S]) -> Self {
        let joined = lines
            .iter()
            .map(|line| line.as_ref())
            .collect::<Vec<&str>>()
            .join(" ");
        let storage_line = extract_storage_line(lines);
        Self {
            vcpus: parse_vcpus(&joined),
            memory_gb: parse_memory_gb(lines),
            storage_gb: parse_storage_gb(storage_line),
            storage_type: parse_storage_type(storage_line),
            network_performance: parse_network_performance(lines),
        }
    }
}

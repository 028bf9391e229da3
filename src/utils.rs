/// Name used when a header carries nothing usable as a file name.
pub const FALLBACK_FILE_NAME: &str = "downloaded_file";

/// Reduces a peer-supplied logical name to a safe base name. Path
/// separators, traversal components, and empty names never survive.
pub fn sanitize_file_name(name: &str) -> String {
    let base = name
        .rsplit(['/', '\\'])
        .map(str::trim)
        .find(|part| !part.is_empty())
        .unwrap_or("");
    if base.is_empty() || base == "." || base == ".." {
        return FALLBACK_FILE_NAME.to_string();
    }
    base.to_string()
}

/// Formats a byte count with decimal units, e.g. `1.2 MB`.
pub fn format_bytes(bytes: u64) -> String {
    const UNIT: u64 = 1000;
    if bytes < UNIT {
        return format!("{bytes} B");
    }
    let mut div = UNIT;
    let mut exp = 0;
    let mut n = bytes / UNIT;
    while n >= UNIT {
        div *= UNIT;
        exp += 1;
        n /= UNIT;
    }
    let units = ["kB", "MB", "GB", "TB", "PB", "EB"];
    format!("{:.1} {}", bytes as f64 / div as f64, units[exp])
}

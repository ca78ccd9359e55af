//! Frequency table helpers shared by the CPU and GPU controls. All values
//! here are MHz.

/// Verification slack between a requested and a read-back frequency.
pub const VERIFY_TOLERANCE_MHZ: u64 = 50;

/// Index of the largest entry `<= cap` (0 if every entry is above `cap`).
/// `freqs` must be sorted ascending.
pub fn clamp_to_table(freqs: &[u64], cap: u64) -> usize {
    let mut lo = 0usize;
    let mut hi = freqs.len();
    while lo + 1 < hi {
        let mid = (lo + hi) / 2;
        if freqs[mid] <= cap { lo = mid; } else { hi = mid; }
    }
    lo
}

/// Clamp a requested `[min, max]` to the hardware range and snap both ends
/// onto the available table when there is one. Keeps `min <= max`.
pub fn clamp_range(min: u64, max: u64, hw_min: u64, hw_max: u64, table: &[u64]) -> (u64, u64) {
    let (lo, hi) = if hw_min <= hw_max { (hw_min, hw_max) } else { (hw_max, hw_min) };
    let mut min = min.clamp(lo, hi);
    let mut max = max.clamp(lo, hi);
    if !table.is_empty() {
        min = table[clamp_to_table(table, min)];
        max = table[clamp_to_table(table, max)];
    }
    if min > max {
        min = max;
    }
    (min, max)
}

pub fn within_tolerance(wanted: u64, got: u64) -> bool {
    wanted.abs_diff(got) <= VERIFY_TOLERANCE_MHZ
}

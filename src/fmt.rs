pub fn fmt_mhz(mhz: u64) -> String {
    if mhz >= 1000 {
        format!("{:.2}GHz", mhz as f64 / 1000.0)
    } else {
        format!("{}MHz", mhz)
    }
}

pub fn fmt_c(mc: i64) -> String {
    format!("{:.1}C", mc as f64 / 1000.0)
}

pub fn fmt_kb(kb: u64) -> String {
    if kb >= 1024 * 1024 {
        format!("{:.1}GB", kb as f64 / (1024.0 * 1024.0))
    } else {
        format!("{}MB", kb / 1024)
    }
}

pub fn fmt_opt<T>(v: Option<T>, f: impl Fn(T) -> String) -> String {
    v.map(f).unwrap_or_else(|| "-".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn units() {
        assert_eq!(fmt_mhz(300), "300MHz");
        assert_eq!(fmt_mhz(2419), "2.42GHz");
        assert_eq!(fmt_c(41_300), "41.3C");
        assert_eq!(fmt_kb(524_288), "512MB");
        assert_eq!(fmt_kb(8_000_000), "7.6GB");
        assert_eq!(fmt_opt(None::<u64>, fmt_mhz), "-");
    }
}

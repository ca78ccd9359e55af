use crate::sysfs::Sysfs;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScreenProbe {
    FbBlank(String),
    BacklightBright(String),
    BacklightPower(String),
}

pub fn detect_screen_probe(sys: &Sysfs) -> Option<ScreenProbe> {
    let fb_blank = "/sys/class/graphics/fb0/blank";
    if sys.exists(fb_blank) {
        return Some(ScreenProbe::FbBlank(fb_blank.to_string()));
    }

    for name in sys.list_dir("/sys/class/backlight") {
        let bright = format!("/sys/class/backlight/{}/brightness", name);
        if sys.exists(&bright) {
            return Some(ScreenProbe::BacklightBright(bright));
        }
        let blp = format!("/sys/class/backlight/{}/bl_power", name);
        if sys.exists(&blp) {
            return Some(ScreenProbe::BacklightPower(blp));
        }
    }
    None
}

/// Unreadable nodes count as on, so polling never stalls on a bad probe.
pub fn screen_on(sys: &Sysfs, probe: &ScreenProbe) -> bool {
    match probe {
        ScreenProbe::FbBlank(p) => sys.read_i64(p).map(|v| v == 0).unwrap_or(true),
        ScreenProbe::BacklightBright(p) => sys.read_i64(p).map(|v| v > 0).unwrap_or(true),
        ScreenProbe::BacklightPower(p) => sys.read_i64(p).map(|v| v == 0).unwrap_or(true),
    }
}

use regex::Regex;

/// Outcome of scanning a power-mode listing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModeSelection {
    pub id: u32,
    /// Wattage attributed to the winning mode, if any figure was parseable.
    pub watts: Option<f64>,
}

/// Picks the mode id with the highest wattage from the line-oriented output
/// of `nvpmodel -q --verbose`.
///
/// Scan rules:
/// - a line matching `Mode <id>` updates the last-seen mode id; a wattage
///   figure on the same line is attributed to that id,
/// - a wattage figure on any later line is attributed to the last-seen id,
/// - comparisons use `>=`, so among equal wattages the later entry wins,
/// - with no parseable wattage at all, the last mode id listed is returned,
/// - with no mode line at all the result is `None`; callers treat that as a
///   soft failure and leave the device at its default mode.
pub fn select_highest_power_mode(output: &str) -> Option<ModeSelection> {
    let mode_re = Regex::new(r"(?i)\bmode\s*:?\s*(\d+)").ok()?;
    let watt_re = Regex::new(r"(\d+(?:\.\d+)?)\s*[Ww]\b").ok()?;

    let mut last_seen: Option<u32> = None;
    let mut best: Option<ModeSelection> = None;

    for line in output.lines() {
        let header = mode_re
            .captures(line)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<u32>().ok());
        if let Some(id) = header {
            last_seen = Some(id);
        }

        let watts = watt_re
            .captures(line)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<f64>().ok());
        if let (Some(id), Some(w)) = (last_seen, watts) {
            let replace = match best {
                Some(b) => b.watts.is_none_or(|bw| w >= bw),
                None => true,
            };
            if replace {
                best = Some(ModeSelection {
                    id,
                    watts: Some(w),
                });
            }
        }
    }

    best.or(last_seen.map(|id| ModeSelection { id, watts: None }))
}

//! Musical Context Parser (`SPEC_FULL.md` §4.2).
//!
//! A pure function mapping free-text directive content to a partial musical
//! context update plus a relative-cue bitmap. Regex-based anchor scanning is
//! grounded on the wider retrieved pack (`lanegrid-agtrace`,
//! `stencila-stencila`, `swedishembedded-sven` all reach for `regex` for this
//! kind of text scanning); static regex compilation uses `lazy_static`,
//! already a dependency of this crate.

use lazy_static::lazy_static;
use regex::Regex;

use crate::config::{BPM_MAX, BPM_MIN, ENERGY_MAX, ENERGY_MIN};

const MAJOR_INTERVALS: [i32; 7] = [0, 2, 4, 5, 7, 9, 11];
const MINOR_INTERVALS: [i32; 7] = [0, 2, 3, 5, 7, 8, 10];

const SHARP_NAMES: [&str; 12] = [
    "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
];
const FLAT_NAMES: [&str; 12] = [
    "C", "Db", "D", "Eb", "E", "F", "Gb", "G", "Ab", "A", "Bb", "B",
];

/// Direction of a detected relative cue (tempo or energy).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CueDirection {
    Increase,
    Decrease,
    Mixed,
}

/// Relative-cue bitmap (`SPEC_FULL.md` §4.2).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelativeCues {
    pub tempo: Option<CueDirection>,
    pub energy: Option<CueDirection>,
}

/// Partial update to the musical context derived from deterministic anchors.
#[derive(Debug, Clone, Default)]
pub struct PartialMusicalContext {
    pub key: Option<String>,
    pub scale: Option<Vec<String>>,
    pub bpm: Option<i32>,
    pub energy: Option<i32>,
}

impl PartialMusicalContext {
    pub fn is_empty(&self) -> bool {
        self.key.is_none() && self.bpm.is_none() && self.energy.is_none()
    }
}

lazy_static! {
    static ref KEY_PHRASE_RE: Regex = Regex::new(
        r"(?i)(?:switch(?:\s+to)?|change(?:\s+to)?|key\s+of|in\s+the\s+key\s+of)\s+([A-Ga-g])([b#]?)\s*(major|minor|maj|min)?"
    ).unwrap();
    static ref KEY_STANDALONE_RE: Regex = Regex::new(
        r"(?i)\b([A-Ga-g])([b#]?)\s+(major|minor)\b"
    ).unwrap();
    static ref BPM_EXPLICIT_RE: Regex = Regex::new(
        r"(?i)\b(?:bpm|tempo)\s+(\d{2,3})\b|\b(\d{2,3})\s*bpm\b"
    ).unwrap();
    static ref DOUBLE_TIME_RE: Regex = Regex::new(r"(?i)\bdouble\s+time\b").unwrap();
    static ref HALF_TIME_RE: Regex = Regex::new(r"(?i)\bhalf\s+time\b").unwrap();
    static ref ENERGY_EXPLICIT_RE: Regex = Regex::new(
        r"(?i)\benergy\s+(?:to\s+)?(\d{1,2})\b"
    ).unwrap();
    static ref ENERGY_MAX_RE: Regex = Regex::new(r"(?i)\b(?:full|max)\s+energy\b").unwrap();
    static ref ENERGY_MIN_RE: Regex = Regex::new(r"(?i)\bminimal\b").unwrap();
    static ref TEMPO_UP_RE: Regex =
        Regex::new(r"(?i)\b(faster|speed up|pick up the pace|quicken|ramp up the tempo)\b").unwrap();
    static ref TEMPO_DOWN_RE: Regex =
        Regex::new(r"(?i)\b(slower|slow down|ease up|ease off the tempo)\b").unwrap();
    static ref ENERGY_UP_RE: Regex =
        Regex::new(r"(?i)\b(more energy|pump it up|build it up|get hype|bring the energy up)\b").unwrap();
    static ref ENERGY_DOWN_RE: Regex =
        Regex::new(r"(?i)\b(less energy|chill out|calm down|strip it back|bring the energy down)\b").unwrap();
}

/// Parses directive text into a partial musical context update and a
/// relative-cue bitmap, given the current BPM (needed to resolve
/// half/double-time, which scale relative to the *current* tempo).
pub fn parse_directive(text: &str, current_bpm: i32) -> (PartialMusicalContext, RelativeCues) {
    let mut partial = PartialMusicalContext::default();

    if let Some((root, quality)) = extract_key(text) {
        let minor = quality.eq_ignore_ascii_case("minor") || quality.eq_ignore_ascii_case("min");
        partial.scale = Some(derive_scale(&root, minor));
        let quality_label = if minor { "minor" } else { "major" };
        partial.key = Some(format!("{} {}", root, quality_label));
    }

    partial.bpm = extract_bpm(text, current_bpm);
    partial.energy = extract_energy(text);

    let cues = RelativeCues {
        tempo: detect_cue(text, &TEMPO_UP_RE, &TEMPO_DOWN_RE),
        energy: detect_cue(text, &ENERGY_UP_RE, &ENERGY_DOWN_RE),
    };

    (partial, cues)
}

/// Returns `(root, quality)` where `quality` is `"major"`/`"minor"`/`"maj"`/`"min"`
/// (defaulting to `"major"` when omitted), normalized root case.
fn extract_key(text: &str) -> Option<(String, String)> {
    if let Some(caps) = KEY_PHRASE_RE.captures(text) {
        let root = normalize_root(&caps[1], caps.get(2).map_or("", |m| m.as_str()));
        let quality = caps
            .get(3)
            .map(|m| m.as_str().to_string())
            .unwrap_or_else(|| "major".to_string());
        return Some((root, quality));
    }
    if let Some(caps) = KEY_STANDALONE_RE.captures(text) {
        let root = normalize_root(&caps[1], caps.get(2).map_or("", |m| m.as_str()));
        let quality = caps[3].to_string();
        return Some((root, quality));
    }
    None
}

fn normalize_root(letter: &str, accidental: &str) -> String {
    format!("{}{}", letter.to_ascii_uppercase(), accidental.to_ascii_lowercase())
}

/// Chooses the flat chromatic set for flat roots and conventionally
/// flat-biased keys, sharp otherwise.
fn derive_scale(root: &str, minor: bool) -> Vec<String> {
    let is_flat_root = root.ends_with('b');
    let flat_biased = if minor {
        matches!(root, "D" | "G" | "C" | "F")
    } else {
        root == "F"
    };
    let use_flats = is_flat_root || flat_biased;
    let names = if use_flats { &FLAT_NAMES } else { &SHARP_NAMES };

    let root_index = root_to_index(root);
    let intervals = if minor { &MINOR_INTERVALS } else { &MAJOR_INTERVALS };
    intervals
        .iter()
        .map(|i| names[((root_index + i).rem_euclid(12)) as usize].to_string())
        .collect()
}

/// Parses a validated key string (`"<Root>[b|#] major|minor"`) back into its
/// scale and minor/major flag, used by governance to re-derive a scale for a
/// consensus-accepted `suggested_key` (`SPEC_FULL.md` §4.6.2 step 8).
pub fn key_to_scale(key: &str) -> Option<(Vec<String>, bool)> {
    let mut parts = key.trim().split_whitespace();
    let root = parts.next()?;
    let quality = parts.next().unwrap_or("major");
    let minor = quality.eq_ignore_ascii_case("minor") || quality.eq_ignore_ascii_case("min");
    Some((derive_scale(root, minor), minor))
}

/// Minimal diatonic fallback progression for a fresh key: I-vi-IV-V in a
/// major key, i-VI-III-VII in a minor key (`SPEC_FULL.md` §4.6.2 step 8).
pub fn diatonic_fallback_chords(scale: &[String], minor: bool) -> Vec<String> {
    if scale.len() != 7 {
        return Vec::new();
    }
    if minor {
        vec![
            format!("{}m", scale[0]),
            scale[5].clone(),
            scale[2].clone(),
            scale[6].clone(),
        ]
    } else {
        vec![
            scale[0].clone(),
            format!("{}m", scale[5]),
            scale[3].clone(),
            scale[4].clone(),
        ]
    }
}

fn root_to_index(root: &str) -> i32 {
    let mut chars = root.chars();
    let letter = chars.next().unwrap_or('C');
    let natural = match letter.to_ascii_uppercase() {
        'C' => 0,
        'D' => 2,
        'E' => 4,
        'F' => 5,
        'G' => 7,
        'A' => 9,
        'B' => 11,
        _ => 0,
    };
    match chars.next() {
        Some('#') => natural + 1,
        Some('b') => natural - 1,
        _ => natural,
    }
}

fn extract_bpm(text: &str, current_bpm: i32) -> Option<i32> {
    if let Some(caps) = BPM_EXPLICIT_RE.captures(text) {
        let raw = caps
            .get(1)
            .or_else(|| caps.get(2))
            .map(|m| m.as_str())
            .unwrap_or("");
        if let Ok(value) = raw.parse::<i32>() {
            return Some(value.clamp(BPM_MIN, BPM_MAX));
        }
    }
    if DOUBLE_TIME_RE.is_match(text) {
        return Some((current_bpm * 2).clamp(BPM_MIN, BPM_MAX));
    }
    if HALF_TIME_RE.is_match(text) {
        let halved = ((current_bpm as f64) / 2.0).round() as i32;
        return Some(halved.clamp(BPM_MIN, BPM_MAX));
    }
    None
}

fn extract_energy(text: &str) -> Option<i32> {
    if let Some(caps) = ENERGY_EXPLICIT_RE.captures(text) {
        if let Ok(value) = caps[1].parse::<i32>() {
            return Some(value.clamp(ENERGY_MIN, ENERGY_MAX));
        }
    }
    if ENERGY_MAX_RE.is_match(text) {
        return Some(ENERGY_MAX);
    }
    if ENERGY_MIN_RE.is_match(text) {
        return Some(ENERGY_MIN);
    }
    None
}

fn detect_cue(text: &str, up_re: &Regex, down_re: &Regex) -> Option<CueDirection> {
    let up = up_re.is_match(text);
    let down = down_re.is_match(text);
    match (up, down) {
        (true, true) => Some(CueDirection::Mixed),
        (true, false) => Some(CueDirection::Increase),
        (false, true) => Some(CueDirection::Decrease),
        (false, false) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_bpm_wins_over_relative_cue() {
        let (partial, cues) = parse_directive("BPM 140 and faster", 120);
        assert_eq!(partial.bpm, Some(140));
        assert_eq!(cues.tempo, Some(CueDirection::Increase));
    }

    #[test]
    fn double_time_clamps_at_max() {
        let (partial, _) = parse_directive("let's go double time", 200);
        assert_eq!(partial.bpm, Some(BPM_MAX));
    }

    #[test]
    fn half_time_clamps_at_min() {
        let (partial, _) = parse_directive("half time please", 80);
        assert_eq!(partial.bpm, Some(BPM_MIN));
    }

    #[test]
    fn key_phrase_derives_scale() {
        let (partial, _) = parse_directive("switch to the key of G major", 120);
        assert_eq!(partial.key.as_deref(), Some("G major"));
        assert_eq!(
            partial.scale,
            Some(vec![
                "G".to_string(),
                "A".to_string(),
                "B".to_string(),
                "C".to_string(),
                "D".to_string(),
                "E".to_string(),
                "F#".to_string(),
            ])
        );
    }

    #[test]
    fn mixed_cues_detected() {
        let (_, cues) = parse_directive("go faster but also slower I guess", 120);
        assert_eq!(cues.tempo, Some(CueDirection::Mixed));
    }

    #[test]
    fn no_anchors_returns_empty_partial() {
        let (partial, cues) = parse_directive("just keep grooving", 120);
        assert!(partial.is_empty());
        assert_eq!(cues.tempo, None);
        assert_eq!(cues.energy, None);
    }

    #[test]
    fn key_to_scale_round_trips_derive_scale() {
        let (scale, minor) = key_to_scale("G major").unwrap();
        assert!(!minor);
        assert_eq!(scale[0], "G");
        assert_eq!(scale.len(), 7);
    }

    #[test]
    fn diatonic_fallback_matches_g_major() {
        let (scale, minor) = key_to_scale("G major").unwrap();
        let chords = diatonic_fallback_chords(&scale, minor);
        assert_eq!(chords, vec!["G", "Em", "C", "D"]);
    }
}

//! Quality tier table.

use serde::Serialize;

/// A named output quality level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QualityTier {
    pub name: &'static str,
    pub width: u32,
    pub height: u32,
    /// Target video bitrate in kbit/s.
    pub video_bitrate_kbps: u32,
}

impl QualityTier {
    const fn new(name: &'static str, width: u32, height: u32, video_bitrate_kbps: u32) -> Self {
        Self {
            name,
            width,
            height,
            video_bitrate_kbps,
        }
    }

    /// Bitrate as an ffmpeg value, e.g. `2800k`.
    pub fn bitrate_arg(&self) -> String {
        format!("{}k", self.video_bitrate_kbps)
    }
}

/// All known tiers, ascending.
pub const TIERS: [QualityTier; 8] = [
    QualityTier::new("360p", 640, 360, 800),
    QualityTier::new("480p", 854, 480, 1400),
    QualityTier::new("720p", 1280, 720, 2800),
    QualityTier::new("1080p", 1920, 1080, 5000),
    QualityTier::new("1440p", 2560, 1440, 8000),
    QualityTier::new("2160p", 3840, 2160, 16000),
    QualityTier::new("4320p", 7680, 4320, 40000),
    QualityTier::new("8640p", 15360, 8640, 80000),
];

/// Look up a tier by name. `4k`, `8k` and `16k` are accepted as aliases.
pub fn find_tier(name: &str) -> Option<&'static QualityTier> {
    let name = name.trim().to_ascii_lowercase();
    let canonical = match name.as_str() {
        "4k" => "2160p",
        "8k" => "4320p",
        "16k" => "8640p",
        other => other,
    };
    TIERS.iter().find(|t| t.name == canonical)
}

/// Result of resolving configured tier names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedTiers {
    /// Known tiers in ascending table order, without duplicates.
    pub tiers: Vec<&'static QualityTier>,
    /// Names that matched nothing, in input order.
    pub unknown: Vec<String>,
}

/// Resolve names against [`TIERS`].
///
/// Output order follows the table, not the input.
pub fn resolve_tiers<I, S>(names: I) -> ResolvedTiers
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut enabled = [false; TIERS.len()];
    let mut unknown = Vec::new();

    for name in names {
        let name = name.as_ref();
        if name.trim().is_empty() {
            continue;
        }
        match find_tier(name) {
            Some(tier) => {
                if let Some(idx) = TIERS.iter().position(|t| t.name == tier.name) {
                    enabled[idx] = true;
                }
            }
            None => unknown.push(name.to_string()),
        }
    }

    let tiers = TIERS
        .iter()
        .zip(enabled)
        .filter_map(|(tier, on)| on.then_some(tier))
        .collect();

    ResolvedTiers { tiers, unknown }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_is_ascending() {
        assert!(TIERS.windows(2).all(|w| w[0].height < w[1].height
            && w[0].video_bitrate_kbps < w[1].video_bitrate_kbps));
    }

    #[test]
    fn test_resolve_orders_and_dedupes() {
        let resolved = resolve_tiers(["720p", "360p", "720P", "bogus", "4k"]);
        let names: Vec<_> = resolved.tiers.iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["360p", "720p", "2160p"]);
        assert_eq!(resolved.unknown, vec!["bogus"]);
    }

    #[test]
    fn test_resolve_empty() {
        let resolved = resolve_tiers(Vec::<String>::new());
        assert!(resolved.tiers.is_empty());
        assert!(resolved.unknown.is_empty());
    }

    #[test]
    fn test_bitrate_arg() {
        assert_eq!(find_tier("720p").unwrap().bitrate_arg(), "2800k");
        assert_eq!(find_tier("8K").unwrap().width, 7680);
    }

    #[test]
    fn test_every_configurable_tier_name_resolves() {
        let names = ["360p", "480p", "720p", "1080p", "1440p", "2160p", "4320p", "8640p"];
        let resolved = resolve_tiers(names);
        assert!(resolved.unknown.is_empty(), "unknown: {:?}", resolved.unknown);
        assert_eq!(resolved.tiers.len(), names.len());
        assert_eq!(find_tier("16k").unwrap().height, 8640);
    }
}

//! HLS multi-rendition command synthesis.
//!
//! The builder is pure: the same tiers, paths and overrides always produce
//! the same argument list.

use std::fmt;
use std::path::Path;

use super::tiers::QualityTier;

/// Segment length in seconds.
pub const SEGMENT_SECONDS: u32 = 6;

/// Keyframe interval in frames; every rendition uses the same cadence so
/// segment boundaries line up.
pub const GOP_FRAMES: u32 = 48;

/// Audio renditions, each re-encoding the first source audio track.
pub const AUDIO_BITRATES: [&str; 3] = ["96k", "128k", "192k"];

pub const MASTER_PLAYLIST_NAME: &str = "master.m3u8";

const VIDEO_CODEC: &str = "libx264";
const AUDIO_CODEC: &str = "aac";
const SEGMENT_FILE_NAME: &str = "segment_%03d.ts";

/// A program plus its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FfmpegCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl fmt::Display for FfmpegCommand {
    /// Shell-style rendering for display only.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", shell_quote(&self.program))?;
        for arg in &self.args {
            write!(f, " {}", shell_quote(arg))?;
        }
        Ok(())
    }
}

fn shell_quote(s: &str) -> String {
    let plain = !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:%=,+@".contains(c));
    if plain {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}

/// Builds the ffmpeg argument list for an HLS ladder.
#[derive(Debug, Clone, Default)]
pub struct HlsCommandBuilder {
    /// Global options placed before the input.
    global_args: Vec<String>,
}

impl HlsCommandBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Extra global options inserted before `-i`.
    pub fn with_global_args(mut self, args: Vec<String>) -> Self {
        self.global_args = args;
        self
    }

    /// Synthesize the arguments.
    ///
    /// `tiers` must already be in ascending order; output-stream indices are
    /// assigned in iteration order. `output` is the variant playlist path and
    /// is always the last argument.
    pub fn build_args(
        &self,
        input: &str,
        output: &str,
        tiers: &[&QualityTier],
        overrides: &[String],
    ) -> Vec<String> {
        let mut args = Vec::new();

        args.push("-hide_banner".to_string());
        args.push("-nostdin".to_string());
        args.push("-y".to_string());
        args.extend(self.global_args.iter().cloned());

        // Input
        args.extend(["-i".to_string(), input.to_string()]);

        // Filter graph: split the source once per tier, then scale each branch.
        if !tiers.is_empty() {
            let splits: String = (0..tiers.len()).map(|i| format!("[vs{i}]")).collect();
            let mut graph = format!("[0:v]split={}{}", tiers.len(), splits);
            for (i, tier) in tiers.iter().enumerate() {
                graph.push_str(&format!(
                    ";[vs{i}]scale=w={}:h={}[vout{i}]",
                    tier.width, tier.height
                ));
            }
            args.extend(["-filter_complex".to_string(), graph]);
        }

        // Video renditions, constant bitrate
        for (i, tier) in tiers.iter().enumerate() {
            let bitrate = tier.bitrate_arg();
            args.extend(["-map".to_string(), format!("[vout{i}]")]);
            args.extend([format!("-c:v:{i}"), VIDEO_CODEC.to_string()]);
            args.extend([format!("-b:v:{i}"), bitrate.clone()]);
            args.extend([format!("-maxrate:v:{i}"), bitrate.clone()]);
            args.extend([format!("-bufsize:v:{i}"), bitrate]);
            args.extend([format!("-g:v:{i}"), GOP_FRAMES.to_string()]);
            args.extend([format!("-keyint_min:v:{i}"), GOP_FRAMES.to_string()]);
            args.extend([format!("-sc_threshold:v:{i}"), "0".to_string()]);
        }

        // Audio renditions
        for (j, bitrate) in AUDIO_BITRATES.iter().enumerate() {
            args.extend(["-map".to_string(), "0:a:0".to_string()]);
            args.extend([format!("-c:a:{j}"), AUDIO_CODEC.to_string()]);
            args.extend([format!("-b:a:{j}"), bitrate.to_string()]);
        }

        // HLS muxer
        args.extend(["-f".to_string(), "hls".to_string()]);
        args.extend(["-hls_time".to_string(), SEGMENT_SECONDS.to_string()]);
        args.extend(["-hls_playlist_type".to_string(), "vod".to_string()]);
        args.extend([
            "-hls_flags".to_string(),
            "independent_segments".to_string(),
        ]);
        args.extend([
            "-master_pl_name".to_string(),
            MASTER_PLAYLIST_NAME.to_string(),
        ]);
        args.extend([
            "-hls_segment_filename".to_string(),
            segment_template(output),
        ]);
        args.extend(["-var_stream_map".to_string(), var_stream_map(tiers.len())]);

        // Caller overrides are layered on top.
        args.extend(overrides.iter().cloned());

        args.push(output.to_string());

        args
    }

    pub fn build(
        &self,
        program: &str,
        input: &str,
        output: &str,
        tiers: &[&QualityTier],
        overrides: &[String],
    ) -> FfmpegCommand {
        FfmpegCommand {
            program: program.to_string(),
            args: self.build_args(input, output, tiers, overrides),
        }
    }
}

/// Pair video substream `i` with audio rendition `i % audio_count`.
///
/// With no video every audio rendition becomes its own variant.
fn var_stream_map(video_count: usize) -> String {
    if video_count == 0 {
        return (0..AUDIO_BITRATES.len())
            .map(|j| format!("a:{j}"))
            .collect::<Vec<_>>()
            .join(" ");
    }
    (0..video_count)
        .map(|i| format!("v:{i},a:{}", i % AUDIO_BITRATES.len()))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Segment path next to the variant playlist. The playlist path is expected
/// to carry `%v` in its directory, so segments land per variant.
fn segment_template(output: &str) -> String {
    match Path::new(output).parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            parent.join(SEGMENT_FILE_NAME).to_string_lossy().into_owned()
        }
        _ => SEGMENT_FILE_NAME.to_string(),
    }
}

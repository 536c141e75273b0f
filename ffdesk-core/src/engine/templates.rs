//! Built-in command templates and path insertion helpers for the command editor.

use serde::Serialize;
use std::path::Path;

/// A ready-made engine command shown in the template picker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CommandTemplate {
    pub name: &'static str,
    pub command: &'static str,
    pub description: &'static str,
}

const TEMPLATES: &[CommandTemplate] = &[
    CommandTemplate {
        name: "Convert video (H.264)",
        command: "-i input.mp4 -c:v libx264 -preset medium -crf 23 -c:a aac -b:a 128k output.mp4",
        description: "Convert video to H.264 with good quality and compression.",
    },
    CommandTemplate {
        name: "Convert video (H.265/HEVC)",
        command: "-i input.mp4 -c:v libx265 -preset medium -crf 28 -c:a aac -b:a 128k output.mp4",
        description: "Convert video to H.265/HEVC for better compression at the same quality.",
    },
    CommandTemplate {
        name: "Extract audio",
        command: "-i input.mp4 -vn -c:a libmp3lame -b:a 192k output.mp3",
        description: "Extract the audio track and save it as a 192 kbit/s MP3.",
    },
    CommandTemplate {
        name: "Resize video (720p)",
        command: r#"-i input.mp4 -vf "scale=-1:720" -c:v libx264 -crf 23 -c:a copy output_720p.mp4"#,
        description: "Scale to 720 lines, keeping the aspect ratio.",
    },
    CommandTemplate {
        name: "Trim video",
        command: "-ss 00:00:10 -i input.mp4 -t 00:00:30 -c copy output_trimmed.mp4",
        description: "Cut 30 seconds starting at 00:00:10 without re-encoding.",
    },
    CommandTemplate {
        name: "Convert to GIF",
        command: r#"-i input.mp4 -vf "fps=10,scale=320:-1:flags=lanczos" -c:v gif output.gif"#,
        description: "Small animated GIF at 10 fps and 320 px wide.",
    },
    CommandTemplate {
        name: "High quality GIF with palette",
        command: r#"-i input.mp4 -vf "fps=15,scale=480:-1:flags=lanczos,split[s0][s1];[s0]palettegen=stats_mode=diff[p];[s1][p]paletteuse=dither=bayer:bayer_scale=5:diff_mode=rectangle" output.gif"#,
        description: "Animated GIF with a generated palette and bayer dithering.",
    },
    CommandTemplate {
        name: "Add subtitles",
        command: "-i input.mp4 -i subtitles.srt -c copy -c:s mov_text output_with_subtitles.mp4",
        description: "Mux an SRT file as a soft subtitle track.",
    },
    CommandTemplate {
        name: "Compress video",
        command: r#"-i input.mp4 -vf "scale=iw*0.5:ih*0.5" -c:v libx264 -crf 28 -preset slower -c:a aac -b:a 96k output_compressed.mp4"#,
        description: "Halve the resolution and lower the bitrate.",
    },
    CommandTemplate {
        name: "Fast compress video",
        command: "-i input.mp4 -c:v libx264 -tag:v avc1 -movflags faststart -crf 30 -preset superfast -c:a aac -b:a 128k output_fast_compressed.mp4",
        description: "Quick H.264 compression suitable for sharing.",
    },
    CommandTemplate {
        name: "Convert to WebM",
        command: "-i input.mp4 -c:v libvpx-vp9 -crf 30 -b:v 0 -b:a 128k -c:a libopus output.webm",
        description: "VP9 video with Opus audio for the web.",
    },
    CommandTemplate {
        name: "Create video thumbnail",
        command: "-i input.mp4 -ss 00:00:05 -vframes 1 thumbnail.jpg",
        description: "Grab a single frame at 5 seconds.",
    },
];

/// Returns every built-in template in display order.
pub fn all_templates() -> &'static [CommandTemplate] {
    TEMPLATES
}

/// Looks up a template by its display name (case-insensitive).
pub fn find_template(name: &str) -> Option<&'static CommandTemplate> {
    TEMPLATES.iter().find(|t| t.name.eq_ignore_ascii_case(name))
}

/// Splices dropped file paths into `command` at byte offset `cursor`.
///
/// Each path is wrapped in double quotes (inner quotes escaped) and the paths
/// are joined with spaces. A cursor past the end appends; a cursor inside a
/// multi-byte character moves back to the start of that character.
pub fn insert_paths<P: AsRef<Path>>(command: &str, cursor: usize, paths: &[P]) -> String {
    let quoted = paths
        .iter()
        .map(|p| {
            let path = p.as_ref().to_string_lossy();
            format!("\"{}\"", path.replace('"', "\\\""))
        })
        .collect::<Vec<_>>()
        .join(" ");

    let mut at = cursor.min(command.len());
    while !command.is_char_boundary(at) {
        at -= 1;
    }

    let mut result = String::with_capacity(command.len() + quoted.len());
    result.push_str(&command[..at]);
    result.push_str(&quoted);
    result.push_str(&command[at..]);
    result
}

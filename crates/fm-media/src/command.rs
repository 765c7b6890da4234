//! ffmpeg/ffprobe argument construction. Pure functions: every builder
//! returns the argv the runner will exec, which keeps the command shapes
//! unit-testable without a binary.

use fm_schemas::params::convert_codecs;
use fm_schemas::{AssetKind, OperationParams};

use crate::paths;

/// One subprocess invocation within an execution plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    pub args: Vec<String>,
}

/// The full plan for an operation: one or two tool invocations plus the
/// final artifact path. Gif is the only two-step plan (palette generation
/// then palette use).
#[derive(Debug, Clone)]
pub struct ExecPlan {
    pub steps: Vec<ToolCommand>,
    pub result_path: String,
    /// Scratch files to delete after the last step.
    pub scratch: Vec<String>,
    /// Seconds of output the progress parser should measure against, when
    /// known from the parameters alone.
    pub output_secs_hint: Option<f64>,
}

/// Facts about the input asset the builders need.
#[derive(Debug, Clone)]
pub struct InputAsset {
    pub asset_id: String,
    pub kind: AssetKind,
    pub extension: String,
}

fn s(v: impl Into<String>) -> String {
    v.into()
}

/// Escape a user string for use inside a drawtext filter value. ffmpeg's
/// filter grammar treats `\ ' :` specially; the percent sign would start a
/// text expansion.
pub fn escape_drawtext(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            ':' => out.push_str("\\:"),
            '%' => out.push_str("\\%"),
            _ => out.push(c),
        }
    }
    out
}

/// Build the execution plan for an operation. `root` is the storage root.
///
/// Callers have already validated the parameters; this function only shapes
/// commands.
pub fn build_plan(root: &str, asset: &InputAsset, params: &OperationParams) -> ExecPlan {
    let input = paths::original(root, &asset.asset_id, &asset.extension);

    match params {
        OperationParams::Resize { width, height } => {
            let out = paths::resized(root, &asset.asset_id, *width, *height, &asset.extension);
            let mut args = vec![s("-y"), s("-i"), input, s("-vf"), format!("scale={width}:{height}")];
            if asset.kind == AssetKind::Video {
                args.extend([s("-c:a"), s("copy")]);
            } else {
                args.extend([s("-frames:v"), s("1")]);
            }
            args.push(out.clone());
            ExecPlan {
                steps: vec![ToolCommand { args }],
                result_path: out,
                scratch: vec![],
                output_secs_hint: None,
            }
        }

        OperationParams::Convert { target_format, .. } => {
            let out = paths::converted(root, &asset.asset_id, target_format);
            let mut args = vec![s("-y"), s("-i"), input];
            if asset.kind == AssetKind::Video {
                // Codec table; the params carry the derived pair but the
                // table is authoritative for the argv.
                if let Some((vcodec, acodec)) = convert_codecs(target_format) {
                    args.extend([s("-c:v"), s(vcodec), s("-c:a"), s(acodec)]);
                }
            } else {
                args.extend([s("-frames:v"), s("1")]);
            }
            args.push(out.clone());
            ExecPlan {
                steps: vec![ToolCommand { args }],
                result_path: out,
                scratch: vec![],
                output_secs_hint: None,
            }
        }

        OperationParams::ExtractAudio { format } => {
            let out = paths::audio(root, &asset.asset_id, format);
            let args = vec![
                s("-y"),
                s("-i"),
                input,
                s("-vn"),
                s("-acodec"),
                s("copy"),
                out.clone(),
            ];
            ExecPlan {
                steps: vec![ToolCommand { args }],
                result_path: out,
                scratch: vec![],
                output_secs_hint: None,
            }
        }

        OperationParams::Crop {
            width,
            height,
            x,
            y,
        } => {
            let out = paths::resized(root, &asset.asset_id, *width, *height, &asset.extension);
            let args = vec![
                s("-y"),
                s("-i"),
                input,
                s("-vf"),
                format!("crop={width}:{height}:{x}:{y}"),
                s("-frames:v"),
                s("1"),
                out.clone(),
            ];
            ExecPlan {
                steps: vec![ToolCommand { args }],
                result_path: out,
                scratch: vec![],
                output_secs_hint: None,
            }
        }

        OperationParams::Trim { start_sec, end_sec } => {
            let out = paths::trimmed(root, &asset.asset_id, *start_sec, *end_sec, &asset.extension);
            let duration = end_sec - start_sec;
            let args = vec![
                s("-y"),
                s("-ss"),
                paths::format_secs(*start_sec),
                s("-i"),
                input,
                s("-t"),
                paths::format_secs(duration),
                s("-c"),
                s("copy"),
                out.clone(),
            ];
            ExecPlan {
                steps: vec![ToolCommand { args }],
                result_path: out,
                scratch: vec![],
                output_secs_hint: Some(duration),
            }
        }

        OperationParams::Watermark {
            text,
            x,
            y,
            font_size,
            color,
            opacity,
        } => {
            let out = paths::watermarked(root, &asset.asset_id, &asset.extension);
            let filter = format!(
                "drawtext=text='{}':x={x}:y={y}:fontsize={font_size}:fontcolor={color}@{opacity}",
                escape_drawtext(text)
            );
            let args = vec![
                s("-y"),
                s("-i"),
                input,
                s("-vf"),
                filter,
                s("-c:a"),
                s("copy"),
                out.clone(),
            ];
            ExecPlan {
                steps: vec![ToolCommand { args }],
                result_path: out,
                scratch: vec![],
                output_secs_hint: None,
            }
        }

        OperationParams::Gif {
            fps,
            width,
            start_sec,
            duration_sec,
        } => {
            let out = paths::gif(root, &asset.asset_id);
            let palette = paths::gif_palette(root, &asset.asset_id);
            let filters = format!("fps={fps},scale={width}:-1:flags=lanczos");

            let pass1 = vec![
                s("-y"),
                s("-ss"),
                paths::format_secs(*start_sec),
                s("-t"),
                paths::format_secs(*duration_sec),
                s("-i"),
                input.clone(),
                s("-vf"),
                format!("{filters},palettegen"),
                palette.clone(),
            ];
            let pass2 = vec![
                s("-y"),
                s("-ss"),
                paths::format_secs(*start_sec),
                s("-t"),
                paths::format_secs(*duration_sec),
                s("-i"),
                input,
                s("-i"),
                palette.clone(),
                s("-filter_complex"),
                format!("{filters}[x];[x][1:v]paletteuse"),
                out.clone(),
            ];

            ExecPlan {
                steps: vec![ToolCommand { args: pass1 }, ToolCommand { args: pass2 }],
                result_path: out,
                scratch: vec![palette],
                output_secs_hint: Some(*duration_sec),
            }
        }
    }
}

/// Thumbnail argv: seek 5s in, write one high-quality JPEG frame.
pub fn thumbnail_args(root: &str, asset: &InputAsset) -> (Vec<String>, String) {
    let input = paths::original(root, &asset.asset_id, &asset.extension);
    let out = paths::thumbnail(root, &asset.asset_id);
    let args = vec![
        s("-y"),
        s("-ss"),
        s("5"),
        s("-i"),
        input,
        s("-frames:v"),
        s("1"),
        s("-q:v"),
        s("2"),
        out.clone(),
    ];
    (args, out)
}

/// ffprobe argv for `WxH` of the first video stream.
pub fn probe_dimensions_args(input: &str) -> Vec<String> {
    vec![
        s("-v"),
        s("error"),
        s("-select_streams"),
        s("v:0"),
        s("-show_entries"),
        s("stream=width,height"),
        s("-of"),
        s("csv=s=x:p=0"),
        s(input),
    ]
}

/// ffprobe argv for container duration in seconds.
pub fn probe_duration_args(input: &str) -> Vec<String> {
    vec![
        s("-v"),
        s("error"),
        s("-show_entries"),
        s("format=duration"),
        s("-of"),
        s("default=noprint_wrappers=1:nokey=1"),
        s(input),
    ]
}

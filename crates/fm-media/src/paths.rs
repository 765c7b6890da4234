//! Storage path convention shared by workers and the asset reader:
//!
//! ```text
//! {root}/{asset_id}/original.{ext}
//! {root}/{asset_id}/thumbnail.jpg
//! {root}/{asset_id}/{WxH}.{ext}                resize
//! {root}/{asset_id}/converted.{ext}            convert
//! {root}/{asset_id}/audio.{format}             extract audio
//! {root}/{asset_id}/trimmed_{start}-{end}.{ext} trim
//! {root}/{asset_id}/watermarked.{ext}          watermark
//! {root}/{asset_id}/video.gif                  gif
//! ```
//!
//! All outputs are deterministic functions of the operation parameters, so a
//! re-run after a crash overwrites instead of duplicating.

/// Format seconds without a trailing `.0` for whole values (`5`, `7.5`).
pub fn format_secs(secs: f64) -> String {
    if (secs.fract()).abs() < f64::EPSILON {
        format!("{}", secs as i64)
    } else {
        format!("{secs}")
    }
}

pub fn original(root: &str, asset_id: &str, ext: &str) -> String {
    format!("{root}/{asset_id}/original.{ext}")
}

pub fn thumbnail(root: &str, asset_id: &str) -> String {
    format!("{root}/{asset_id}/thumbnail.jpg")
}

pub fn resized(root: &str, asset_id: &str, width: i32, height: i32, ext: &str) -> String {
    format!("{root}/{asset_id}/{width}x{height}.{ext}")
}

pub fn converted(root: &str, asset_id: &str, target_ext: &str) -> String {
    format!("{root}/{asset_id}/converted.{target_ext}")
}

pub fn audio(root: &str, asset_id: &str, format: &str) -> String {
    format!("{root}/{asset_id}/audio.{format}")
}

pub fn trimmed(root: &str, asset_id: &str, start_sec: f64, end_sec: f64, ext: &str) -> String {
    format!(
        "{root}/{asset_id}/trimmed_{}-{}.{ext}",
        format_secs(start_sec),
        format_secs(end_sec)
    )
}

pub fn watermarked(root: &str, asset_id: &str, ext: &str) -> String {
    format!("{root}/{asset_id}/watermarked.{ext}")
}

pub fn gif(root: &str, asset_id: &str) -> String {
    format!("{root}/{asset_id}/video.gif")
}

/// Scratch palette for the two-pass gif pipeline; removed after use.
pub fn gif_palette(root: &str, asset_id: &str) -> String {
    format!("{root}/{asset_id}/palette.png")
}

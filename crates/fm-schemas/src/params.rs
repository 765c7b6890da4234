//! Per-kind operation parameter records.
//!
//! The tagged representation doubles as the persisted `operations.params`
//! JSON: the `kind` tag makes a stored blob self-describing, so job
//! restoration can rebuild a payload from the operation row alone. Derived
//! fields (selected codecs for convert) are filled in at validation time and
//! persisted with the rest.

use serde::{Deserialize, Serialize};

use crate::OperationKind;

/// Video container formats the convert operation may target, with the codec
/// pair each one selects.
pub const VIDEO_FORMATS: &[&str] = &["mp4", "mov", "mkv", "avi", "webm"];

/// Image formats the convert operation may target.
pub const IMAGE_FORMATS: &[&str] = &["jpg", "png", "webp"];

/// Audio container formats extract_audio may target.
pub const AUDIO_FORMATS: &[&str] = &["aac", "mp3", "ogg"];

/// Codec table for video conversion targets.
pub fn convert_codecs(target_format: &str) -> Option<(&'static str, &'static str)> {
    match target_format {
        "mp4" | "mov" | "mkv" => Some(("libx264", "aac")),
        "avi" => Some(("mpeg4", "libmp3lame")),
        "webm" => Some(("libvpx-vp9", "libopus")),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Structural parameter violations. Asset-dependent checks (crop bounds,
/// same-extension convert) are the pipeline's job; everything here is
/// checkable from the record alone.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamError {
    NonPositiveDimension { field: &'static str, value: i32 },
    NegativeOffset { field: &'static str, value: i32 },
    EmptyText,
    OpacityOutOfRange { value: f64 },
    NonPositiveDuration { field: &'static str, value: f64 },
    TrimEndNotAfterStart { start_sec: f64, end_sec: f64 },
    UnknownFormat { format: String },
    NonPositiveFps { value: f64 },
}

impl std::fmt::Display for ParamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NonPositiveDimension { field, value } => {
                write!(f, "{field} must be > 0, got {value}")
            }
            Self::NegativeOffset { field, value } => {
                write!(f, "{field} must be >= 0, got {value}")
            }
            Self::EmptyText => write!(f, "text must not be empty"),
            Self::OpacityOutOfRange { value } => {
                write!(f, "opacity must be within [0, 1], got {value}")
            }
            Self::NonPositiveDuration { field, value } => {
                write!(f, "{field} must be > 0, got {value}")
            }
            Self::TrimEndNotAfterStart { start_sec, end_sec } => {
                write!(f, "trim end ({end_sec}) must be after start ({start_sec})")
            }
            Self::UnknownFormat { format } => write!(f, "unknown target format: {format}"),
            Self::NonPositiveFps { value } => write!(f, "fps must be > 0, got {value}"),
        }
    }
}

impl std::error::Error for ParamError {}

// ---------------------------------------------------------------------------
// Parameter records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OperationParams {
    Resize {
        width: i32,
        height: i32,
    },
    Convert {
        target_format: String,
        /// Selected at validation time from the codec table; empty for image
        /// targets. Persisted so restoration never re-derives.
        #[serde(default)]
        video_codec: Option<String>,
        #[serde(default)]
        audio_codec: Option<String>,
    },
    ExtractAudio {
        format: String,
    },
    Crop {
        width: i32,
        height: i32,
        x: i32,
        y: i32,
    },
    Trim {
        start_sec: f64,
        end_sec: f64,
    },
    Watermark {
        text: String,
        x: i32,
        y: i32,
        font_size: i32,
        color: String,
        opacity: f64,
    },
    Gif {
        fps: f64,
        width: i32,
        start_sec: f64,
        duration_sec: f64,
    },
}

impl OperationParams {
    pub fn kind(&self) -> OperationKind {
        match self {
            OperationParams::Resize { .. } => OperationKind::Resize,
            OperationParams::Convert { .. } => OperationKind::Convert,
            OperationParams::ExtractAudio { .. } => OperationKind::ExtractAudio,
            OperationParams::Crop { .. } => OperationKind::Crop,
            OperationParams::Trim { .. } => OperationKind::Trim,
            OperationParams::Watermark { .. } => OperationKind::Watermark,
            OperationParams::Gif { .. } => OperationKind::Gif,
        }
    }

    /// Structural validation. The record is not mutated; callers normalize
    /// first if they want case-folded formats.
    pub fn check_shape(&self) -> Result<(), ParamError> {
        match self {
            OperationParams::Resize { width, height } => {
                check_positive_dim("width", *width)?;
                check_positive_dim("height", *height)
            }
            OperationParams::Convert { target_format, .. } => {
                let known = VIDEO_FORMATS.contains(&target_format.as_str())
                    || IMAGE_FORMATS.contains(&target_format.as_str());
                if !known {
                    return Err(ParamError::UnknownFormat {
                        format: target_format.clone(),
                    });
                }
                Ok(())
            }
            OperationParams::ExtractAudio { format } => {
                if !AUDIO_FORMATS.contains(&format.as_str()) {
                    return Err(ParamError::UnknownFormat {
                        format: format.clone(),
                    });
                }
                Ok(())
            }
            OperationParams::Crop {
                width,
                height,
                x,
                y,
            } => {
                check_positive_dim("width", *width)?;
                check_positive_dim("height", *height)?;
                check_offset("x", *x)?;
                check_offset("y", *y)
            }
            OperationParams::Trim { start_sec, end_sec } => {
                if *start_sec < 0.0 {
                    return Err(ParamError::NonPositiveDuration {
                        field: "start_sec",
                        value: *start_sec,
                    });
                }
                if *end_sec <= *start_sec {
                    return Err(ParamError::TrimEndNotAfterStart {
                        start_sec: *start_sec,
                        end_sec: *end_sec,
                    });
                }
                Ok(())
            }
            OperationParams::Watermark {
                text,
                x,
                y,
                font_size,
                opacity,
                ..
            } => {
                if text.trim().is_empty() {
                    return Err(ParamError::EmptyText);
                }
                check_offset("x", *x)?;
                check_offset("y", *y)?;
                check_positive_dim("font_size", *font_size)?;
                if !(0.0..=1.0).contains(opacity) {
                    return Err(ParamError::OpacityOutOfRange { value: *opacity });
                }
                Ok(())
            }
            OperationParams::Gif {
                fps,
                width,
                start_sec,
                duration_sec,
            } => {
                if *fps <= 0.0 {
                    return Err(ParamError::NonPositiveFps { value: *fps });
                }
                check_positive_dim("width", *width)?;
                if *start_sec < 0.0 {
                    return Err(ParamError::NonPositiveDuration {
                        field: "start_sec",
                        value: *start_sec,
                    });
                }
                if *duration_sec <= 0.0 {
                    return Err(ParamError::NonPositiveDuration {
                        field: "duration_sec",
                        value: *duration_sec,
                    });
                }
                Ok(())
            }
        }
    }

    /// Case-fold free-text identifier fields so that two requests differing
    /// only in format/color casing share an idempotency fingerprint.
    pub fn normalized(&self) -> OperationParams {
        let mut out = self.clone();
        match &mut out {
            OperationParams::Convert { target_format, .. } => {
                *target_format = target_format.to_ascii_lowercase();
            }
            OperationParams::ExtractAudio { format } => {
                *format = format.to_ascii_lowercase();
            }
            OperationParams::Watermark { color, .. } => {
                *color = color.to_ascii_lowercase();
            }
            _ => {}
        }
        out
    }
}

fn check_positive_dim(field: &'static str, value: i32) -> Result<(), ParamError> {
    if value <= 0 {
        return Err(ParamError::NonPositiveDimension { field, value });
    }
    Ok(())
}

fn check_offset(field: &'static str, value: i32) -> Result<(), ParamError> {
    if value < 0 {
        return Err(ParamError::NegativeOffset { field, value });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resize_rejects_zero_width() {
        let err = OperationParams::Resize {
            width: 0,
            height: 600,
        }
        .check_shape();
        assert_eq!(
            err,
            Err(ParamError::NonPositiveDimension {
                field: "width",
                value: 0
            })
        );
    }

    #[test]
    fn trim_end_must_exceed_start() {
        let p = OperationParams::Trim {
            start_sec: 10.0,
            end_sec: 10.0,
        };
        assert!(matches!(
            p.check_shape(),
            Err(ParamError::TrimEndNotAfterStart { .. })
        ));

        let ok = OperationParams::Trim {
            start_sec: 10.0,
            end_sec: 10.5,
        };
        assert!(ok.check_shape().is_ok());
    }

    #[test]
    fn watermark_opacity_bounds() {
        let base = |opacity| OperationParams::Watermark {
            text: "demo".into(),
            x: 10,
            y: 10,
            font_size: 24,
            color: "white".into(),
            opacity,
        };
        assert!(base(0.0).check_shape().is_ok());
        assert!(base(1.0).check_shape().is_ok());
        assert!(matches!(
            base(1.01).check_shape(),
            Err(ParamError::OpacityOutOfRange { .. })
        ));
        assert!(matches!(
            base(-0.1).check_shape(),
            Err(ParamError::OpacityOutOfRange { .. })
        ));
    }

    #[test]
    fn convert_rejects_unknown_format() {
        let p = OperationParams::Convert {
            target_format: "flv".into(),
            video_codec: None,
            audio_codec: None,
        };
        assert!(matches!(
            p.check_shape(),
            Err(ParamError::UnknownFormat { .. })
        ));
    }

    #[test]
    fn codec_table_covers_all_video_formats() {
        for fmt in VIDEO_FORMATS {
            assert!(convert_codecs(fmt).is_some(), "no codecs for {fmt}");
        }
        assert_eq!(convert_codecs("webm"), Some(("libvpx-vp9", "libopus")));
        assert_eq!(convert_codecs("avi"), Some(("mpeg4", "libmp3lame")));
        assert!(convert_codecs("jpg").is_none());
    }

    #[test]
    fn normalized_folds_format_case() {
        let p = OperationParams::Convert {
            target_format: "MP4".into(),
            video_codec: None,
            audio_codec: None,
        };
        let n = p.normalized();
        match n {
            OperationParams::Convert { target_format, .. } => assert_eq!(target_format, "mp4"),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn params_json_carries_kind_tag() {
        let p = OperationParams::Resize {
            width: 800,
            height: 600,
        };
        let v = serde_json::to_value(&p).unwrap();
        assert_eq!(v["kind"], "resize");
        let back: OperationParams = serde_json::from_value(v).unwrap();
        assert_eq!(back, p);
    }
}

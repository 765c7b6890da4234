//! Parameter validation against the kind's schema and the asset's facts.
//!
//! Structural checks live on the parameter records themselves
//! (`OperationParams::check_shape`); this module adds the asset-dependent
//! preconditions and fills derived fields, returning the record that gets
//! fingerprinted and persisted.

use sqlx::PgPool;

use fm_db::assets::AssetRow;
use fm_db::operations;
use fm_schemas::params::{convert_codecs, IMAGE_FORMATS, VIDEO_FORMATS};
use fm_schemas::{AssetKind, OperationKind, OperationParams};

use crate::PipelineError;

pub async fn validate_request(
    pool: &PgPool,
    asset: &AssetRow,
    params: &OperationParams,
) -> Result<OperationParams, PipelineError> {
    let mut params = params.normalized();

    params
        .check_shape()
        .map_err(|e| PipelineError::Validation(e.to_string()))?;

    let kind = params.kind();
    if !kind.applies_to(asset.kind) {
        return Err(PipelineError::Validation(format!(
            "{} does not apply to {} assets",
            kind.as_str(),
            asset.kind.as_str()
        )));
    }

    match &mut params {
        OperationParams::Convert {
            target_format,
            video_codec,
            audio_codec,
        } => {
            if target_format.eq_ignore_ascii_case(&asset.extension) {
                return Err(PipelineError::Validation(format!(
                    "asset is already {target_format}"
                )));
            }

            let allowed: &[&str] = match asset.kind {
                AssetKind::Video => VIDEO_FORMATS,
                AssetKind::Image => IMAGE_FORMATS,
            };
            if !allowed.contains(&target_format.as_str()) {
                return Err(PipelineError::Validation(format!(
                    "{} is not a valid convert target for {} assets",
                    target_format,
                    asset.kind.as_str()
                )));
            }

            // Derived fields: persist the selected codec pair so the job is
            // reconstructible from the operation row alone.
            if asset.kind == AssetKind::Video {
                let (v, a) = convert_codecs(target_format).ok_or_else(|| {
                    PipelineError::Validation(format!("no codec table entry for {target_format}"))
                })?;
                *video_codec = Some(v.to_string());
                *audio_codec = Some(a.to_string());
            } else {
                *video_codec = None;
                *audio_codec = None;
            }
        }

        OperationParams::Crop {
            width,
            height,
            x,
            y,
        } => {
            let right = (*x as i64) + (*width as i64);
            let bottom = (*y as i64) + (*height as i64);
            if right > asset.width as i64 {
                return Err(PipelineError::Validation(format!(
                    "crop exceeds image width: x + width = {right} > {}",
                    asset.width
                )));
            }
            if bottom > asset.height as i64 {
                return Err(PipelineError::Validation(format!(
                    "crop exceeds image height: y + height = {bottom} > {}",
                    asset.height
                )));
            }
        }

        OperationParams::ExtractAudio { .. } => {
            let extracted =
                operations::has_completed_kind(pool, &asset.asset_id, OperationKind::ExtractAudio)
                    .await
                    .map_err(PipelineError::Internal)?;
            if extracted {
                return Err(PipelineError::Validation(
                    "audio already extracted for this asset".to_string(),
                ));
            }
        }

        OperationParams::Resize { .. }
        | OperationParams::Trim { .. }
        | OperationParams::Watermark { .. }
        | OperationParams::Gif { .. } => {}
    }

    Ok(params)
}

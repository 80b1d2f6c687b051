//! Pipeline and device selection.
//!
//! The engine enumerates pipeline/interop pairs and, for each pair, the
//! devices that can run it. Selection takes the requested pair (or ranks all
//! pairs when the pipeline is automatic: Metal, then CUDA, then OpenCL, then
//! CPU), then the first device of that pair whose name contains the filter.

use std::sync::Arc;

use crate::engine::{Codec, InteropKind, PipelineCandidate, PipelineDevice, PipelineKind};
use crate::error::SelectError;

/// What the caller asked for.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PipelineRequest {
    /// `None` selects automatically
    pub pipeline: Option<PipelineKind>,
    pub interop: InteropKind,
    /// Case-insensitive device name substring
    pub device_filter: Option<String>,
}

/// A device picked for a load session.
#[derive(Clone)]
pub struct SelectedDevice {
    pub candidate: PipelineCandidate,
    pub device: Arc<dyn PipelineDevice>,
    pub name: String,
}

impl std::fmt::Debug for SelectedDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelectedDevice")
            .field("candidate", &self.candidate)
            .field("name", &self.name)
            .finish()
    }
}

/// Orders the pipeline/interop pairs matching `request`, best first.
pub fn rank_candidates(
    available: &[PipelineCandidate],
    request: &PipelineRequest,
) -> Vec<PipelineCandidate> {
    let mut matching: Vec<PipelineCandidate> = available
        .iter()
        .copied()
        .filter(|c| c.interop == request.interop)
        .filter(|c| request.pipeline.map_or(true, |p| c.pipeline == p))
        .collect();
    // stable: engine enumeration order breaks ties
    matching.sort_by_key(|c| c.pipeline.rank());
    matching.dedup();
    matching
}

/// Selects a pipeline and device without binding it.
pub fn select_device(
    codec: &dyn Codec,
    request: &PipelineRequest,
) -> Result<SelectedDevice, SelectError> {
    let candidates = rank_candidates(&codec.pipelines(), request);
    let Some(&candidate) = candidates.first() else {
        return Err(SelectError::NoPipeline {
            pipeline: request.pipeline,
            interop: request.interop,
        });
    };

    let devices = codec.devices(candidate)?;
    let filter = request
        .device_filter
        .as_ref()
        .map(|f| f.to_lowercase())
        .filter(|f| !f.is_empty());

    for device in devices {
        let name = device.name();
        tracing::debug!("{:?} device: {}", candidate.pipeline, name);
        let matches = filter
            .as_ref()
            .map_or(true, |f| name.to_lowercase().contains(f.as_str()));
        if matches {
            return Ok(SelectedDevice {
                candidate,
                device,
                name,
            });
        }
    }

    Err(SelectError::NoDevice {
        pipeline: candidate.pipeline,
        filter: request.device_filter.clone(),
    })
}

/// Selects a device, binds it to the codec and pre-warms the pipeline.
pub fn select_and_bind(
    codec: &dyn Codec,
    request: &PipelineRequest,
) -> Result<SelectedDevice, SelectError> {
    let selected = select_device(codec, request)?;
    match selected.device.preferred_resource_format() {
        Ok(format) => tracing::info!(
            "selected {} device '{}' (interop {:?}), preferred resource format {:?}",
            selected.candidate.pipeline.name(),
            selected.name,
            selected.candidate.interop,
            format
        ),
        Err(e) => tracing::warn!(
            "selected {} device '{}', preferred resource format unknown: {}",
            selected.candidate.pipeline.name(),
            selected.name,
            e
        ),
    }
    codec.bind_device(&selected.device)?;
    codec.prepare_pipeline(&selected.device)?;
    Ok(selected)
}

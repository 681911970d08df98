//! Multi-model depth fusion.
//!
//! `dynfuse` fuses a stream of depth+color frames into a persistent volumetric
//! background model plus an open set of independently moving rigid objects.
//! Every frame it matches instance detections to existing models, creates and
//! retires models, computes per-pixel soft assignments across all competing
//! models, refines each model's pose with robust iterative alignment and
//! dispatches per-model volumetric integration in parallel.
//!
//! The crate owns the orchestration only. The volumetric representation, the
//! instance detector and the depth pre-filter are collaborators behind the
//! [`Volume`], [`Detector`] and [`DepthFilter`] traits.
//!
//! # Examples
//!
//! ```no_run
//! use dynfuse::{Fusion, FusionParams, Intrinsics, NullSink, PrecomputedDetections, RangeFilter};
//!
//! # fn factory() -> Box<dyn dynfuse::VolumeFactory> { unimplemented!() }
//! let params = FusionParams::default();
//! let intrinsics = Intrinsics::new(525.0, 525.0, 319.5, 239.5, 640, 480);
//!
//! let mut fusion = Fusion::new(
//!     params,
//!     intrinsics,
//!     Box::new(PrecomputedDetections::default()),
//!     Box::new(RangeFilter::new(0.1, 6.0)),
//!     factory(),
//! ).unwrap();
//!
//! let depth = ndarray::Array2::<f32>::zeros((480, 640));
//! let rgb = ndarray::Array3::<u8>::zeros((480, 640, 3));
//! let mut sink = NullSink;
//! fusion.process_frame(&depth, &rgb, &mut sink).unwrap();
//! ```

mod association;
mod config;
mod detection;
mod frame;
mod fusion;
mod lifecycle;
mod mask;
mod matching;
mod model;
mod sink;
mod tracking;
mod volume;

pub use config::FusionParams;
pub use detection::{Detection, Detector, PrecomputedDetections, Rect};
pub use frame::{backproject, DepthFilter, Frame, Intrinsics, RangeFilter};
pub use fusion::Fusion;
pub use mask::Mask;
pub use matching::{MaskMatch, MatchSet};
pub use model::ObjectModel;
pub use sink::{FrameSummary, NullSink, ObjectSummary, PoseLog, ResultSink};
pub use volume::{Extent, ModelRender, Volume, VolumeFactory, VolumeMeta};

#[cfg(test)]
pub(crate) mod testing;

//! Microscopy metadata and the external reader seam (§3, §1).
//!
//! The microscopy-file reader itself is out of scope (spec §1 names it as an
//! external collaborator). `FrameSource` is the interface such a reader
//! plugs into; this crate ships only a `FrameStore`-backed implementation
//! usable in tests and by the bundled CLI against already-materialized raw
//! stacks.

use std::collections::BTreeSet;

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Immutable metadata describing one microscopy acquisition (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MicroscopyMetadata {
    pub n_fovs: usize,
    pub n_channels: usize,
    pub n_frames: usize,
    pub height: usize,
    pub width: usize,
    pub channel_names: Vec<String>,
    pub timepoints: Vec<f64>,
    pub base_name: String,
}

impl MicroscopyMetadata {
    /// Shape invariant: all derived stacks must match (n_frames, height, width).
    pub fn stack_shape(&self) -> (usize, usize, usize) {
        (self.n_frames, self.height, self.width)
    }
}

/// { pc: channel_index | None, fl: ordered list of channel_index,
///   features_for_pc, features_for_fl } (§3).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelSelection {
    pub pc: Option<usize>,
    pub fl: Vec<usize>,
    pub features_for_pc: BTreeSet<String>,
    pub features_for_fl: std::collections::BTreeMap<usize, BTreeSet<String>>,
}

impl ChannelSelection {
    /// Invariant: pc, if set, is disjoint from fl.
    pub fn is_valid(&self) -> bool {
        match self.pc {
            Some(pc) => !self.fl.contains(&pc),
            None => true,
        }
    }
}

/// Frame and metadata access, provided by a collaborator outside this crate's
/// scope. One (fov, channel, frame) triple addresses one `Array2<u16>`.
pub trait FrameSource: Send + Sync {
    fn metadata(&self) -> &MicroscopyMetadata;
    fn read_frame(&self, fov: usize, channel: usize, frame: usize) -> Result<Array2<u16>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_selection_disjoint_invariant() {
        let mut sel = ChannelSelection {
            pc: Some(0),
            fl: vec![1, 2],
            ..Default::default()
        };
        assert!(sel.is_valid());
        sel.fl.push(0);
        assert!(!sel.is_valid());
    }
}

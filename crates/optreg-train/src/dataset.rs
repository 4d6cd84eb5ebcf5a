//! Dataset profiles: everything the orchestrator needs to know about a
//! dataset, kept as data instead of name checks.

use std::fmt;
use std::str::FromStr;

use optreg_core::VolumeShape;
use optreg_model::{GradLoss, LocalNcc, LossComposer, Similarity};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TrainError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DatasetId {
    #[serde(rename = "IXI")]
    Ixi,
    #[serde(rename = "OASIS")]
    Oasis,
    #[serde(rename = "LPBA")]
    Lpba,
}

impl DatasetId {
    pub const ALL: [DatasetId; 3] = [Self::Ixi, Self::Oasis, Self::Lpba];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Ixi => "IXI",
            Self::Oasis => "OASIS",
            Self::Lpba => "LPBA",
        }
    }
}

impl fmt::Display for DatasetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DatasetId {
    type Err = TrainError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|id| id.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| TrainError::UnknownDataset(s.to_string()))
    }
}

/// How training pairs are formed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Pairing {
    /// One atlas is the moving image for every subject.
    Atlas,
    /// Subjects are registered to each other.
    Pairwise,
}

/// Per-dataset training and validation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetProfile {
    pub id: DatasetId,
    pub image_shape: VolumeShape,
    /// Structures averaged by the Dice score.
    pub labels: Vec<u32>,
    /// Take a second, reversed optimizer step per batch.
    pub bidirectional: bool,
    pub pairing: Pairing,
    pub similarity: Similarity,
}

/// Non-background structures of the IXI segmentations that are scored.
const IXI_LABELS: [u32; 32] = [
    1, 2, 3, 4, 5, 6, 7, 8, 10, 11, 12, 13, 14, 15, 16, 17, 18, 20, 21, 22, 23, 24, 25, 26, 27, 28, 29, 30, 31, 32,
    34, 36,
];

/// LPBA40 structure ids as ranges.
const LPBA_LABEL_RANGES: [(u32, u32); 8] = [
    (21, 34),
    (41, 50),
    (61, 68),
    (81, 92),
    (101, 102),
    (121, 122),
    (161, 166),
    (181, 182),
];

impl DatasetProfile {
    pub fn ixi() -> Self {
        Self {
            id: DatasetId::Ixi,
            image_shape: VolumeShape::new(160, 192, 224),
            labels: IXI_LABELS.to_vec(),
            bidirectional: false,
            pairing: Pairing::Atlas,
            similarity: Similarity::LocalNcc(LocalNcc::default()),
        }
    }

    pub fn oasis() -> Self {
        Self {
            id: DatasetId::Oasis,
            image_shape: VolumeShape::new(160, 192, 224),
            labels: (1..=35).collect(),
            bidirectional: true,
            pairing: Pairing::Pairwise,
            similarity: Similarity::LocalNcc(LocalNcc::default()),
        }
    }

    pub fn lpba() -> Self {
        Self {
            id: DatasetId::Lpba,
            image_shape: VolumeShape::new(160, 192, 160),
            labels: LPBA_LABEL_RANGES.iter().flat_map(|&(lo, hi)| lo..=hi).collect(),
            bidirectional: false,
            pairing: Pairing::Atlas,
            similarity: Similarity::LocalNcc(LocalNcc::default()),
        }
    }

    pub fn for_id(id: DatasetId) -> Self {
        match id {
            DatasetId::Ixi => Self::ixi(),
            DatasetId::Oasis => Self::oasis(),
            DatasetId::Lpba => Self::lpba(),
        }
    }

    pub fn with_labels(mut self, labels: Vec<u32>) -> Self {
        self.labels = labels;
        self
    }

    pub fn with_similarity(mut self, similarity: Similarity) -> Self {
        self.similarity = similarity;
        self
    }

    /// Loss composer with this dataset's similarity and an L2 gradient penalty.
    pub fn composer(&self) -> LossComposer {
        LossComposer::new(self.similarity, GradLoss::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_dataset_ids() {
        assert_eq!("IXI".parse::<DatasetId>().unwrap(), DatasetId::Ixi);
        assert_eq!("oasis".parse::<DatasetId>().unwrap(), DatasetId::Oasis);
        assert!(matches!("ADNI".parse::<DatasetId>(), Err(TrainError::UnknownDataset(_))));
    }

    #[test]
    fn test_label_sets() {
        assert_eq!(DatasetProfile::ixi().labels.len(), 32);
        assert_eq!(DatasetProfile::oasis().labels.len(), 35);
        let lpba = DatasetProfile::lpba().labels;
        assert_eq!(lpba.len(), 56);
        assert_eq!(lpba.first(), Some(&21));
        assert_eq!(lpba.last(), Some(&182));
    }

    #[test]
    fn test_only_oasis_is_bidirectional() {
        for id in DatasetId::ALL {
            let profile = DatasetProfile::for_id(id);
            assert_eq!(profile.bidirectional, id == DatasetId::Oasis);
            assert_eq!(profile.pairing == Pairing::Pairwise, id == DatasetId::Oasis);
        }
        assert_eq!(DatasetProfile::lpba().image_shape, VolumeShape::new(160, 192, 160));
    }

    #[test]
    fn test_profile_serializes_with_names() {
        let json = serde_json::to_string(&DatasetProfile::ixi()).unwrap();
        assert!(json.contains("\"id\":\"IXI\""));
        assert!(json.contains("\"pairing\":\"atlas\""));
    }
}

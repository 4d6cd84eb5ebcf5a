//! Pair sources backed by NIfTI files on disk.

use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use optreg_core::{CoreError, PairData, PairSource, VolumeData};
use tracing::debug;

use crate::nifti_io::{list_volumes, read_volume};

/// Files making up one sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairFiles {
    pub fixed: PathBuf,
    pub moving: PathBuf,
    pub fixed_labels: Option<PathBuf>,
    pub moving_labels: Option<PathBuf>,
}

/// Pair source that reads NIfTI files on every fetch.
#[derive(Debug, Clone)]
pub struct NiftiPairSource {
    pairs: Vec<PairFiles>,
    normalize: bool,
}

impl NiftiPairSource {
    /// Every subject in `dir` as fixed image, with the atlas as moving image.
    ///
    /// Subject labels are looked up by file name in `label_dir`; samples
    /// carry labels only when both sides have them.
    pub fn atlas(dir: impl AsRef<Path>, atlas: PathBuf, atlas_labels: Option<PathBuf>, label_dir: Option<&Path>) -> Result<Self> {
        let subjects = list_volumes(dir.as_ref())?;
        if subjects.is_empty() {
            bail!("No NIfTI volumes found in {:?}", dir.as_ref());
        }
        let pairs = subjects
            .into_iter()
            .map(|subject| PairFiles {
                fixed_labels: label_dir.and_then(|labels| label_for(labels, &subject)),
                moving_labels: atlas_labels.clone(),
                moving: atlas.clone(),
                fixed: subject,
            })
            .collect();
        Ok(Self::new(pairs))
    }

    /// Consecutive subjects of `dir` registered to each other:
    /// sample `i` moves subject `i + 1` onto subject `i`, wrapping around.
    pub fn pairwise(dir: impl AsRef<Path>, label_dir: Option<&Path>) -> Result<Self> {
        let subjects = list_volumes(dir.as_ref())?;
        if subjects.len() < 2 {
            bail!(
                "Pairwise registration needs at least two volumes in {:?}, found {}",
                dir.as_ref(),
                subjects.len()
            );
        }
        let labels = |subject: &PathBuf| label_dir.and_then(|dir| label_for(dir, subject));
        let pairs = (0..subjects.len())
            .map(|i| {
                let fixed = &subjects[i];
                let moving = &subjects[(i + 1) % subjects.len()];
                PairFiles {
                    fixed: fixed.clone(),
                    moving: moving.clone(),
                    fixed_labels: labels(fixed),
                    moving_labels: labels(moving),
                }
            })
            .collect();
        Ok(Self::new(pairs))
    }

    pub fn new(pairs: Vec<PairFiles>) -> Self {
        Self { pairs, normalize: true }
    }

    /// Rescale image intensities to `[0, 1]` on load (on by default).
    pub fn with_normalization(mut self, normalize: bool) -> Self {
        self.normalize = normalize;
        self
    }

    pub fn pairs(&self) -> &[PairFiles] {
        &self.pairs
    }

    fn load(&self, files: &PairFiles) -> Result<PairData> {
        let image = |path: &Path| -> Result<VolumeData> {
            let volume = read_volume(path)?;
            Ok(if self.normalize { min_max(volume)? } else { volume })
        };
        let pair = PairData::new(image(&files.fixed)?, image(&files.moving)?)?;
        match (&files.fixed_labels, &files.moving_labels) {
            (Some(fixed), Some(moving)) => Ok(pair.with_labels(read_volume(fixed)?, read_volume(moving)?)?),
            _ => Ok(pair),
        }
    }
}

impl PairSource for NiftiPairSource {
    fn len(&self) -> usize {
        self.pairs.len()
    }

    fn fetch(&self, index: usize) -> optreg_core::Result<PairData> {
        let files = self.pairs.get(index).ok_or_else(|| {
            CoreError::source(format!("sample index {} out of range for {} samples", index, self.pairs.len()))
        })?;
        debug!(index, fixed = ?files.fixed, moving = ?files.moving, "loading pair");
        self.load(files).map_err(CoreError::source)
    }
}

/// Label file with the same name as `subject` inside `dir`, if present.
fn label_for(dir: &Path, subject: &Path) -> Option<PathBuf> {
    let candidate = dir.join(subject.file_name()?);
    candidate.is_file().then_some(candidate)
}

fn min_max(volume: VolumeData) -> Result<VolumeData> {
    let values = volume.values();
    let (lo, hi) = values
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    let range = hi - lo;
    if !(range.is_finite() && range > 0.0) {
        return Ok(volume);
    }
    let scaled = values.iter().map(|&v| (v - lo) / range).collect();
    Ok(VolumeData::new(volume.shape(), scaled)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nifti_io::write_volume;
    use optreg_core::VolumeShape;
    use std::fs;
    use tempfile::tempdir;

    fn write(path: &Path, value: f32) {
        let volume = VolumeData::from_fn(VolumeShape::new(2, 2, 2), |d, _, _| value + d as f32);
        write_volume(path, &volume).unwrap();
    }

    #[test]
    fn test_atlas_pairs_with_labels() -> Result<()> {
        let root = tempdir()?;
        let train = root.path().join("train");
        let labels = root.path().join("labels");
        fs::create_dir_all(&train)?;
        fs::create_dir_all(&labels)?;
        write(&train.join("s1.nii"), 10.0);
        write(&train.join("s2.nii"), 20.0);
        write(&labels.join("s1.nii"), 1.0);
        write(&root.path().join("atlas.nii"), 0.0);
        write(&root.path().join("atlas_seg.nii"), 1.0);

        let source = NiftiPairSource::atlas(
            &train,
            root.path().join("atlas.nii"),
            Some(root.path().join("atlas_seg.nii")),
            Some(&labels),
        )?;
        assert_eq!(source.len(), 2);
        assert_eq!(source.pairs()[0].moving, root.path().join("atlas.nii"));

        let first = source.fetch(0)?;
        assert!(first.fixed_labels.is_some());
        // Normalized intensities, raw labels.
        assert_eq!(first.fixed.values()[0], 0.0);
        assert_eq!(first.fixed.values()[7], 1.0);
        assert_eq!(first.fixed_labels.as_ref().map(|l| l.values()[7]), Some(2.0));

        let second = source.fetch(1)?;
        assert!(second.fixed_labels.is_none());
        Ok(())
    }

    #[test]
    fn test_pairwise_wraps_around() -> Result<()> {
        let root = tempdir()?;
        for (name, value) in [("a.nii", 1.0), ("b.nii", 2.0), ("c.nii", 3.0)] {
            write(&root.path().join(name), value);
        }
        let source = NiftiPairSource::pairwise(root.path(), None)?.with_normalization(false);
        let pairs = source.pairs();
        assert_eq!(pairs.len(), 3);
        assert_eq!(pairs[2].fixed, root.path().join("c.nii"));
        assert_eq!(pairs[2].moving, root.path().join("a.nii"));
        assert_eq!(source.fetch(0)?.moving.values()[0], 2.0);
        Ok(())
    }

    #[test]
    fn test_pairwise_needs_two_subjects() {
        let root = tempdir().unwrap();
        write(&root.path().join("only.nii"), 1.0);
        assert!(NiftiPairSource::pairwise(root.path(), None).is_err());
    }

    #[test]
    fn test_fetch_errors_become_source_errors() {
        let source = NiftiPairSource::new(vec![PairFiles {
            fixed: PathBuf::from("/missing/a.nii"),
            moving: PathBuf::from("/missing/b.nii"),
            fixed_labels: None,
            moving_labels: None,
        }]);
        assert!(matches!(source.fetch(0), Err(CoreError::Source(_))));
        assert!(matches!(source.fetch(1), Err(CoreError::Source(_))));
    }
}

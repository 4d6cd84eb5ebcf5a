//! NIfTI volume reading, writing and directory listing.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use ndarray::{Array3, Axis, Ix3};
use nifti::{writer::WriterOptions, IntoNdArray, NiftiObject, ReaderOptions};
use optreg_core::{VolumeData, VolumeShape};

/// Read a single-channel NIfTI volume into `[D, H, W]` order.
///
/// NIfTI stores `[X, Y, Z]`; the axes are reversed so that `X` becomes the
/// fastest-varying (width) axis. Trailing singleton axes are dropped.
pub fn read_volume(path: impl AsRef<Path>) -> Result<VolumeData> {
    let path = path.as_ref();
    let object = ReaderOptions::new()
        .read_file(path)
        .with_context(|| format!("Failed to read NIfTI file {:?}", path))?;
    let mut array = object
        .into_volume()
        .into_ndarray::<f32>()
        .with_context(|| format!("Failed to convert {:?} to an array", path))?;

    while array.ndim() > 3 && array.shape()[array.ndim() - 1] == 1 {
        let last = array.ndim() - 1;
        array = array.index_axis_move(Axis(last), 0);
    }
    if array.ndim() != 3 {
        bail!("Expected a 3D volume in {:?}, found shape {:?}", path, array.shape());
    }
    let array = array
        .into_dimensionality::<Ix3>()
        .with_context(|| format!("Failed to view {:?} as 3D", path))?;

    let dhw = array.permuted_axes([2, 1, 0]);
    let (d, h, w) = dhw.dim();
    let values: Vec<f32> = dhw.iter().copied().collect();
    Ok(VolumeData::new(VolumeShape::new(d, h, w), values)?)
}

/// Write a volume as NIfTI, reversing `[D, H, W]` back to `[X, Y, Z]`.
pub fn write_volume(path: impl AsRef<Path>, volume: &VolumeData) -> Result<()> {
    let path = path.as_ref();
    let [d, h, w] = volume.shape().dims();
    let array = Array3::from_shape_vec((d, h, w), volume.values().to_vec())
        .context("Volume data does not match its shape")?
        .permuted_axes([2, 1, 0]);
    WriterOptions::new(path)
        .write_nifti(&array)
        .with_context(|| format!("Failed to write NIfTI file {:?}", path))?;
    Ok(())
}

/// `.nii` and `.nii.gz` files directly inside `dir`, sorted by name.
pub fn list_volumes(dir: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
    let dir = dir.as_ref();
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("Failed to list {:?}", dir))? {
        let path = entry?.path();
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        if path.is_file() && (name.ends_with(".nii") || name.ends_with(".nii.gz")) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_round_trip_keeps_axis_order() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("volume.nii");
        let volume = VolumeData::from_fn(VolumeShape::new(2, 3, 4), |d, h, w| (d * 100 + h * 10 + w) as f32);

        write_volume(&path, &volume)?;
        let read = read_volume(&path)?;
        assert_eq!(read, volume);
        Ok(())
    }

    #[test]
    fn test_reads_xyz_files_as_dhw() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("xyz.nii.gz");
        // X = 3, Y = 4, Z = 5
        let array = Array3::from_shape_fn((3, 4, 5), |(x, y, z)| (x + 10 * y + 100 * z) as f32);
        WriterOptions::new(&path).write_nifti(&array)?;

        let volume = read_volume(&path)?;
        assert_eq!(volume.shape(), VolumeShape::new(5, 4, 3));
        // [d=1, h=2, w=0] is x=0, y=2, z=1
        assert_eq!(volume.values()[(1 * 4 + 2) * 3], 120.0);
        Ok(())
    }

    #[test]
    fn test_list_filters_extensions() -> Result<()> {
        let dir = tempdir()?;
        for name in ["b.nii.gz", "a.nii", "notes.txt"] {
            fs::write(dir.path().join(name), b"")?;
        }
        let names: Vec<String> = list_volumes(dir.path())?
            .iter()
            .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .collect();
        assert_eq!(names, vec!["a.nii", "b.nii.gz"]);
        Ok(())
    }

    #[test]
    fn test_missing_file_has_context() {
        let err = read_volume("/nonexistent/volume.nii").unwrap_err();
        assert!(err.to_string().contains("Failed to read NIfTI file"));
    }
}

//! Index file parsing and on-disk volume loading
//!
//! The dataset root follows a fixed layout:
//!
//! ```text
//! <root>/
//!   dataset.csv   # headerless: image,label[,auxiliary]
//!   images/       # primary modality (MRI)
//!   gt/           # ground-truth masks
//!   ct/           # auxiliary modality (CT); same name as the image unless a third column is given
//! ```
//!
//! Every referenced file is checked when the dataset is constructed, so a
//! missing file fails the run before the first epoch.

use std::fmt;
use std::path::{Path, PathBuf};

use image::{GrayImage, ImageReader};
use tracing::{debug, info};

use crate::dataset::burn_dataset::{SampleSource, VolumeItem};
use crate::dataset::volume::Volume;
use crate::utils::error::{CoTrainError, Result};

/// Subdirectory holding primary-modality volumes
pub const IMAGES_DIR: &str = "images";
/// Subdirectory holding ground-truth masks
pub const LABELS_DIR: &str = "gt";
/// Subdirectory holding auxiliary-modality volumes
pub const AUXILIARY_DIR: &str = "ct";

/// One row of the index file, resolved against the dataset root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub image: PathBuf,
    pub label: PathBuf,
    pub auxiliary: PathBuf,
}

impl IndexEntry {
    /// Short identifier used in logs and figure tags
    pub fn id(&self) -> String {
        self.image
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    fn paths(&self) -> [&Path; 3] {
        [&self.image, &self.label, &self.auxiliary]
    }
}

/// Parse a headerless index file.
///
/// Rows have two columns (`image,label`) or three (`image,label,auxiliary`).
/// Blank lines are ignored.
pub fn parse_index(root: &Path, index_file: &str) -> Result<Vec<IndexEntry>> {
    let path = root.join(index_file);
    if !path.exists() {
        return Err(CoTrainError::MissingFile(path));
    }

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(&path)?;

    let mut entries = Vec::new();
    for (row, record) in reader.records().enumerate() {
        let record = record?;
        if record.iter().all(|field| field.is_empty()) {
            continue;
        }
        if record.len() < 2 || record.len() > 3 {
            return Err(CoTrainError::Dataset(format!(
                "{} row {}: expected 2 or 3 columns, found {}",
                path.display(),
                row + 1,
                record.len()
            )));
        }

        let image = &record[0];
        let label = &record[1];
        let auxiliary = record.get(2).filter(|s| !s.is_empty()).unwrap_or(image);

        entries.push(IndexEntry {
            image: root.join(IMAGES_DIR).join(image),
            label: root.join(LABELS_DIR).join(label),
            auxiliary: root.join(AUXILIARY_DIR).join(auxiliary),
        });
    }

    debug!("Parsed {} index rows from {}", entries.len(), path.display());
    Ok(entries)
}

/// Reads a single-channel volume from disk
pub trait VolumeReader: Send + Sync + fmt::Debug {
    fn read(&self, path: &Path) -> Result<Volume>;
}

/// Reads grayscale images whose rows are a vertical stack of `depth` slices.
///
/// Intensities are returned raw (0-255) so label thresholds apply to stored values.
#[derive(Debug, Clone, Copy)]
pub struct SliceStackReader {
    pub depth: usize,
}

impl SliceStackReader {
    pub fn new(depth: usize) -> Self {
        Self { depth }
    }

    /// Write a volume as a slice stack, clamping values to 0-255
    pub fn write(path: &Path, volume: &Volume) -> Result<()> {
        let [d, h, w] = volume.shape;
        let pixels: Vec<u8> = volume
            .data
            .iter()
            .map(|v| v.round().clamp(0.0, 255.0) as u8)
            .collect();
        let img = GrayImage::from_raw(w as u32, (d * h) as u32, pixels).ok_or_else(|| {
            CoTrainError::Image(path.to_path_buf(), "buffer does not match dimensions".to_string())
        })?;
        img.save(path)
            .map_err(|e| CoTrainError::Image(path.to_path_buf(), e.to_string()))
    }
}

impl VolumeReader for SliceStackReader {
    fn read(&self, path: &Path) -> Result<Volume> {
        let img = ImageReader::open(path)
            .map_err(|e| CoTrainError::Image(path.to_path_buf(), e.to_string()))?
            .decode()
            .map_err(|e| CoTrainError::Image(path.to_path_buf(), e.to_string()))?
            .to_luma8();

        let (width, height) = (img.width() as usize, img.height() as usize);
        if self.depth == 0 || height % self.depth != 0 {
            return Err(CoTrainError::Image(
                path.to_path_buf(),
                format!("height {} is not a multiple of depth {}", height, self.depth),
            ));
        }

        let data = img.into_raw().into_iter().map(f32::from).collect();
        Volume::new(data, [self.depth, height / self.depth, width])
    }
}

/// File-backed dataset of `(primary, label, auxiliary)` samples
#[derive(Debug)]
pub struct VolumeDataset {
    entries: Vec<IndexEntry>,
    output_shape: [usize; 3],
    label_threshold: f32,
    reader: Box<dyn VolumeReader>,
}

impl VolumeDataset {
    /// Parse the index and check every referenced file exists
    pub fn new(
        root: &Path,
        index_file: &str,
        output_shape: [usize; 3],
        label_threshold: f32,
        reader: Box<dyn VolumeReader>,
    ) -> Result<Self> {
        let entries = parse_index(root, index_file)?;
        if entries.is_empty() {
            return Err(CoTrainError::Dataset(format!(
                "index {} lists no samples",
                root.join(index_file).display()
            )));
        }

        for entry in &entries {
            if let Some(missing) = entry.paths().into_iter().find(|p| !p.is_file()) {
                return Err(CoTrainError::MissingFile(missing.to_path_buf()));
            }
        }

        info!(
            "Dataset at {}: {} samples, output shape {:?}",
            root.display(),
            entries.len(),
            output_shape
        );

        Ok(Self {
            entries,
            output_shape,
            label_threshold,
            reader,
        })
    }

    /// Build from a [`crate::config::RunConfig`]
    pub fn from_config(config: &crate::config::RunConfig) -> Result<Self> {
        Self::new(
            &config.dataset_root,
            &config.index_file,
            config.output_shape,
            config.label_threshold,
            Box::new(SliceStackReader::new(config.source_depth)),
        )
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }
}

impl SampleSource for VolumeDataset {
    fn len(&self) -> usize {
        self.entries.len()
    }

    fn sample(&self, index: usize) -> Result<VolumeItem> {
        let entry = self.entries.get(index).ok_or_else(|| {
            CoTrainError::Dataset(format!("index {} out of range ({} samples)", index, self.entries.len()))
        })?;

        let primary = self.reader.read(&entry.image)?.normalized();
        let label = self.reader.read(&entry.label)?.binarized(self.label_threshold);
        let auxiliary = self.reader.read(&entry.auxiliary)?.normalized();

        Ok(VolumeItem {
            id: entry.id(),
            primary: primary.crop_or_pad(self.output_shape),
            label: label.crop_or_pad(self.output_shape),
            auxiliary: auxiliary.crop_or_pad(self.output_shape),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn write_layout(root: &Path, index: &str, files: &[(&str, &str)]) {
        for dir in [IMAGES_DIR, LABELS_DIR, AUXILIARY_DIR] {
            fs::create_dir_all(root.join(dir)).unwrap();
        }
        let vol = Volume::new((0..2 * 4 * 4).map(|i| (i * 8) as f32).collect(), [2, 4, 4]).unwrap();
        for (dir, name) in files {
            SliceStackReader::write(&root.join(dir).join(name), &vol).unwrap();
        }
        fs::write(root.join("dataset.csv"), index).unwrap();
    }

    #[test]
    fn test_parse_index_two_and_three_columns() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("idx.csv"), "a.png,a_gt.png\n\nb.png, b_gt.png, b_ct.png\n").unwrap();

        let entries = parse_index(dir.path(), "idx.csv").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].auxiliary, dir.path().join("ct").join("a.png"));
        assert_eq!(entries[1].label, dir.path().join("gt").join("b_gt.png"));
        assert_eq!(entries[1].auxiliary, dir.path().join("ct").join("b_ct.png"));
        assert_eq!(entries[1].id(), "b");
    }

    #[test]
    fn test_parse_index_rejects_bad_rows() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("idx.csv"), "only_one_column\n").unwrap();
        assert!(matches!(
            parse_index(dir.path(), "idx.csv"),
            Err(CoTrainError::Dataset(_))
        ));
    }

    #[test]
    fn test_missing_index_is_missing_file() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            parse_index(dir.path(), "nope.csv"),
            Err(CoTrainError::MissingFile(_))
        ));
    }

    #[test]
    fn test_slice_stack_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vol.png");
        let vol = Volume::new((0..3 * 2 * 5).map(|i| i as f32).collect(), [3, 2, 5]).unwrap();

        SliceStackReader::write(&path, &vol).unwrap();
        let read = SliceStackReader::new(3).read(&path).unwrap();
        assert_eq!(read, vol);

        assert!(SliceStackReader::new(4).read(&path).is_err());
    }

    #[test]
    fn test_dataset_loads_and_transforms() {
        let dir = tempdir().unwrap();
        write_layout(
            dir.path(),
            "s1.png,s1.png\n",
            &[("images", "s1.png"), ("gt", "s1.png"), ("ct", "s1.png")],
        );

        let ds = VolumeDataset::new(dir.path(), "dataset.csv", [2, 2, 2], 240.0, Box::new(SliceStackReader::new(2)))
            .unwrap();
        let item = ds.sample(0).unwrap();

        assert_eq!(item.primary.shape, [2, 2, 2]);
        assert!(item.primary.data.iter().all(|v| (0.0..=1.0).contains(v)));
        assert!(item.label.data.iter().all(|&v| v == 0.0 || v == 1.0));
        assert!(ds.sample(1).is_err());
    }

    #[test]
    fn test_load_failure_after_construction_is_an_error() {
        let dir = tempdir().unwrap();
        write_layout(
            dir.path(),
            "s1.png,s1.png\n",
            &[("images", "s1.png"), ("gt", "s1.png"), ("ct", "s1.png")],
        );
        let ds = VolumeDataset::new(dir.path(), "dataset.csv", [2, 2, 2], 240.0, Box::new(SliceStackReader::new(2)))
            .unwrap();

        std::fs::write(dir.path().join("ct/s1.png"), b"not a png").unwrap();
        assert!(ds.sample(0).is_err());
    }

    #[test]
    fn test_missing_label_detected_at_construction() {
        let dir = tempdir().unwrap();
        write_layout(dir.path(), "s1.png,absent.png\n", &[("images", "s1.png"), ("ct", "s1.png")]);

        let err = VolumeDataset::new(dir.path(), "dataset.csv", [2, 4, 4], 240.0, Box::new(SliceStackReader::new(2)))
            .unwrap_err();
        match err {
            CoTrainError::MissingFile(path) => assert!(path.ends_with("gt/absent.png")),
            other => panic!("unexpected error: {other}"),
        }
    }
}

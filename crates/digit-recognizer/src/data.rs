use std::fs::{self, create_dir_all};
use std::io::Read;
use std::path::{Path, PathBuf};

use burn::{
    data::{
        dataloader::batcher::Batcher,
        dataset::{transform::Mapper, Dataset},
    },
    prelude::*,
    tensor::{ElementConversion, TensorData},
};
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// CVDF mirror of http://yann.lecun.com/exdb/mnist/
const URL: &str = "https://storage.googleapis.com/cvdf-datasets/mnist/";
const TRAIN_IMAGES: &str = "train-images-idx3-ubyte";
const TRAIN_LABELS: &str = "train-labels-idx1-ubyte";
const TEST_IMAGES: &str = "t10k-images-idx3-ubyte";
const TEST_LABELS: &str = "t10k-labels-idx1-ubyte";

const IMAGES_MAGIC: u32 = 0x0000_0803;
const LABELS_MAGIC: u32 = 0x0000_0801;

/// Width of a digit image in pixels.
pub const WIDTH: usize = 28;
/// Height of a digit image in pixels.
pub const HEIGHT: usize = 28;

/// Error raised while fetching or decoding the digit dataset.
#[derive(Error, Debug)]
pub enum DatasetError {
    /// The remote file could not be fetched.
    #[error("failed to download `{url}`: {source}")]
    Download {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// I/O operation error.
    #[error("I/O error on `{}`: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// An IDX file did not start with the expected magic number.
    #[error("invalid IDX header in `{file}`: magic number {magic:#010x}")]
    InvalidHeader { file: String, magic: u32 },

    /// An IDX file is shorter than its header announces.
    #[error("truncated IDX file `{file}`: expected {expected} bytes, found {found}")]
    Truncated {
        file: String,
        expected: usize,
        found: usize,
    },

    /// The image and label files disagree on the number of samples.
    #[error("{images} images but {labels} labels")]
    Mismatch { images: usize, labels: usize },
}

/// One of the two standard splits: 60,000 training and 10,000 test samples.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Split {
    Train,
    Test,
}

impl Split {
    fn files(&self) -> (&'static str, &'static str) {
        match self {
            Split::Train => (TRAIN_IMAGES, TRAIN_LABELS),
            Split::Test => (TEST_IMAGES, TEST_LABELS),
        }
    }

    fn dir_name(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Test => "test",
        }
    }
}

/// Digit item.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct DigitItem {
    /// Image as a 2D array of raw 0-255 intensities.
    pub image: [[f32; WIDTH]; HEIGHT],

    /// Label of the image.
    pub label: u8,
}

#[derive(Debug, Clone)]
struct DigitItemRaw {
    pub image_bytes: Vec<u8>,
    pub label: u8,
}

struct BytesToImage;

impl Mapper<DigitItemRaw, DigitItem> for BytesToImage {
    /// Convert a raw item (image bytes) to a digit item (2D array image).
    fn map(&self, item: &DigitItemRaw) -> DigitItem {
        debug_assert_eq!(item.image_bytes.len(), WIDTH * HEIGHT);

        let mut image_array = [[0f32; WIDTH]; HEIGHT];
        for (i, pixel) in item.image_bytes.iter().enumerate() {
            let x = i % WIDTH;
            let y = i / WIDTH;
            image_array[y][x] = *pixel as f32;
        }

        DigitItem {
            image: image_array,
            label: item.label,
        }
    }
}

/// The handwritten digit dataset, held in memory as raw bytes.
///
/// Images are decoded lazily by [Dataset::get]; the whole training split
/// is 28 * 28 * 60000 = 47.04Mb.
#[derive(Debug, Clone)]
pub struct DigitDataset {
    items: Vec<DigitItemRaw>,
}

impl Dataset<DigitItem> for DigitDataset {
    fn get(&self, index: usize) -> Option<DigitItem> {
        self.items.get(index).map(|raw| BytesToImage.map(raw))
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

impl DigitDataset {
    /// Loads the training split, downloading it into `cache_dir` if needed.
    pub fn train<P: AsRef<Path>>(cache_dir: P) -> Result<Self, DatasetError> {
        Self::load(cache_dir, Split::Train)
    }

    /// Loads the test split, downloading it into `cache_dir` if needed.
    pub fn test<P: AsRef<Path>>(cache_dir: P) -> Result<Self, DatasetError> {
        Self::load(cache_dir, Split::Test)
    }

    /// Loads a split from `cache_dir/<split>/`, fetching the missing IDX files first.
    pub fn load<P: AsRef<Path>>(cache_dir: P, split: Split) -> Result<Self, DatasetError> {
        let split_dir = cache_dir.as_ref().join(split.dir_name());
        create_dir_all(&split_dir).map_err(|source| DatasetError::Io {
            path: split_dir.clone(),
            source,
        })?;

        let (images_name, labels_name) = split.files();
        let images_path = download_file(images_name, &split_dir)?;
        let labels_path = download_file(labels_name, &split_dir)?;

        let images = read_images(&images_path)?;
        let labels = read_labels(&labels_path)?;
        let dataset = Self::from_raw(images, labels)?;

        log::info!(
            "Loaded {} {} samples from {}",
            dataset.len(),
            split.dir_name(),
            split_dir.display()
        );

        Ok(dataset)
    }

    /// Builds a dataset from flattened 784-byte images and their labels.
    pub fn from_raw(images: Vec<Vec<u8>>, labels: Vec<u8>) -> Result<Self, DatasetError> {
        if images.len() != labels.len() {
            return Err(DatasetError::Mismatch {
                images: images.len(),
                labels: labels.len(),
            });
        }

        if let Some(image) = images.iter().find(|image| image.len() != WIDTH * HEIGHT) {
            return Err(DatasetError::Truncated {
                file: "<memory>".to_string(),
                expected: WIDTH * HEIGHT,
                found: image.len(),
            });
        }

        let items = images
            .into_iter()
            .zip(labels)
            .map(|(image_bytes, label)| DigitItemRaw { image_bytes, label })
            .collect();

        Ok(Self { items })
    }

    /// Splits off the last `fraction` of the samples as a validation set.
    ///
    /// Returns `(train, validation)`.
    pub fn split_validation(mut self, fraction: f64) -> (Self, Self) {
        let fraction = fraction.clamp(0.0, 1.0);
        let num_valid = (self.items.len() as f64 * fraction).round() as usize;
        let valid = self.items.split_off(self.items.len() - num_valid);

        (self, Self { items: valid })
    }
}

/// Default location of the downloaded dataset files.
pub fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from(".cache"))
        .join("digit-recognizer")
        .join("mnist")
}

/// Download a gzipped IDX file to the destination directory, unless it is already there.
fn download_file(name: &str, dest_dir: &Path) -> Result<PathBuf, DatasetError> {
    let file_name = dest_dir.join(name);

    if file_name.exists() {
        return Ok(file_name);
    }

    let url = format!("{URL}{name}.gz");
    log::info!("Downloading {url}");

    let bytes = reqwest::blocking::get(&url)
        .and_then(|response| response.error_for_status())
        .and_then(|response| response.bytes())
        .map_err(|source| DatasetError::Download {
            url: url.clone(),
            source,
        })?;

    let mut content = Vec::new();
    GzDecoder::new(&bytes[..])
        .read_to_end(&mut content)
        .map_err(|source| DatasetError::Io {
            path: file_name.clone(),
            source,
        })?;

    fs::write(&file_name, content).map_err(|source| DatasetError::Io {
        path: file_name.clone(),
        source,
    })?;

    Ok(file_name)
}

fn read_file(path: &Path) -> Result<Vec<u8>, DatasetError> {
    fs::read(path).map_err(|source| DatasetError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn read_images(path: &Path) -> Result<Vec<Vec<u8>>, DatasetError> {
    let bytes = read_file(path)?;
    parse_images(&bytes, &path.display().to_string())
}

fn read_labels(path: &Path) -> Result<Vec<u8>, DatasetError> {
    let bytes = read_file(path)?;
    parse_labels(&bytes, &path.display().to_string())
}

fn header_u32(bytes: &[u8], offset: usize, file: &str) -> Result<u32, DatasetError> {
    bytes
        .get(offset..offset + 4)
        .and_then(|slice| slice.try_into().ok())
        .map(u32::from_be_bytes)
        .ok_or_else(|| DatasetError::Truncated {
            file: file.to_string(),
            expected: offset + 4,
            found: bytes.len(),
        })
}

/// Parses an IDX3 image file: 16-byte header (magic, count, rows, cols), then pixels.
pub(crate) fn parse_images(bytes: &[u8], file: &str) -> Result<Vec<Vec<u8>>, DatasetError> {
    let magic = header_u32(bytes, 0, file)?;
    if magic != IMAGES_MAGIC {
        return Err(DatasetError::InvalidHeader {
            file: file.to_string(),
            magic,
        });
    }

    let size = header_u32(bytes, 4, file)? as usize;
    let expected = 16 + size * WIDTH * HEIGHT;
    if bytes.len() < expected {
        return Err(DatasetError::Truncated {
            file: file.to_string(),
            expected,
            found: bytes.len(),
        });
    }

    Ok(bytes[16..expected]
        .chunks(WIDTH * HEIGHT)
        .map(|chunk| chunk.to_vec())
        .collect())
}

/// Parses an IDX1 label file: 8-byte header (magic, count), then one byte per label.
pub(crate) fn parse_labels(bytes: &[u8], file: &str) -> Result<Vec<u8>, DatasetError> {
    let magic = header_u32(bytes, 0, file)?;
    if magic != LABELS_MAGIC {
        return Err(DatasetError::InvalidHeader {
            file: file.to_string(),
            magic,
        });
    }

    let size = header_u32(bytes, 4, file)? as usize;
    let expected = 8 + size;
    if bytes.len() < expected {
        return Err(DatasetError::Truncated {
            file: file.to_string(),
            expected,
            found: bytes.len(),
        });
    }

    Ok(bytes[8..expected].to_vec())
}

#[derive(Clone, Debug)]
pub struct DigitBatcher<B: Backend> {
    device: B::Device,
}

#[derive(Clone, Debug)]
pub struct DigitBatch<B: Backend> {
    /// Images with shape `[batch_size, 1, 28, 28]`, normalized to [0, 1].
    pub images: Tensor<B, 4>,
    pub targets: Tensor<B, 1, Int>,
}

impl<B: Backend> DigitBatcher<B> {
    pub fn new(device: B::Device) -> Self {
        Self { device }
    }
}

impl<B: Backend> Batcher<DigitItem, DigitBatch<B>> for DigitBatcher<B> {
    fn batch(&self, items: Vec<DigitItem>) -> DigitBatch<B> {
        let images = items
            .iter()
            .map(|item| TensorData::from(item.image).convert::<B::FloatElem>())
            .map(|data| Tensor::<B, 2>::from_data(data, &self.device))
            .map(|tensor| tensor.reshape([1, 1, HEIGHT, WIDTH]))
            .map(|tensor| tensor / 255)
            .collect();

        let targets = items
            .iter()
            .map(|item| {
                Tensor::<B, 1, Int>::from_data(
                    [(item.label as i64).elem::<B::IntElem>()],
                    &self.device,
                )
            })
            .collect();

        let images = Tensor::cat(images, 0);
        let targets = Tensor::cat(targets, 0);

        DigitBatch { images, targets }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    fn idx_images(images: &[Vec<u8>]) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&IMAGES_MAGIC.to_be_bytes());
        bytes.extend_from_slice(&(images.len() as u32).to_be_bytes());
        bytes.extend_from_slice(&(HEIGHT as u32).to_be_bytes());
        bytes.extend_from_slice(&(WIDTH as u32).to_be_bytes());
        for image in images {
            bytes.extend_from_slice(image);
        }
        bytes
    }

    fn idx_labels(labels: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&LABELS_MAGIC.to_be_bytes());
        bytes.extend_from_slice(&(labels.len() as u32).to_be_bytes());
        bytes.extend_from_slice(labels);
        bytes
    }

    fn sample_images() -> Vec<Vec<u8>> {
        (0..4u8)
            .map(|i| vec![i * 60; WIDTH * HEIGHT])
            .collect()
    }

    #[test]
    fn parses_idx_files() {
        let images = sample_images();
        let parsed = parse_images(&idx_images(&images), "images").unwrap();
        let labels = parse_labels(&idx_labels(&[3, 1, 4, 1]), "labels").unwrap();

        assert_eq!(parsed, images);
        assert_eq!(labels, vec![3, 1, 4, 1]);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = idx_labels(&[1, 2]);
        bytes[3] = 0x03;

        let err = parse_labels(&bytes, "labels").unwrap_err();
        assert!(matches!(
            err,
            DatasetError::InvalidHeader { magic: 0x0803, .. }
        ));
    }

    #[test]
    fn rejects_truncated_images() {
        let mut bytes = idx_images(&sample_images());
        bytes.truncate(bytes.len() - 1);

        let err = parse_images(&bytes, "images").unwrap_err();
        assert!(matches!(err, DatasetError::Truncated { .. }));
    }

    #[test]
    fn rejects_label_count_mismatch() {
        let err = DigitDataset::from_raw(sample_images(), vec![1, 2]).unwrap_err();
        assert!(matches!(
            err,
            DatasetError::Mismatch {
                images: 4,
                labels: 2
            }
        ));
    }

    #[test]
    fn loads_split_from_cache_without_download() {
        let dir = tempfile::tempdir().unwrap();
        let split_dir = dir.path().join("test");
        fs::create_dir_all(&split_dir).unwrap();
        fs::write(split_dir.join(TEST_IMAGES), idx_images(&sample_images())).unwrap();
        fs::write(split_dir.join(TEST_LABELS), idx_labels(&[0, 1, 2, 3])).unwrap();

        let dataset = DigitDataset::test(dir.path()).unwrap();

        assert_eq!(dataset.len(), 4);
        let item = dataset.get(2).unwrap();
        assert_eq!(item.label, 2);
        assert_eq!(item.image[27][27], 120.0);
    }

    #[test]
    fn validation_split_takes_the_tail() {
        let labels = vec![0, 1, 2, 3, 4, 5, 6, 7, 8, 9];
        let images = vec![vec![0u8; WIDTH * HEIGHT]; labels.len()];
        let dataset = DigitDataset::from_raw(images, labels).unwrap();

        let (train, valid) = dataset.split_validation(0.2);

        assert_eq!(train.len(), 8);
        assert_eq!(valid.len(), 2);
        assert_eq!(valid.get(0).unwrap().label, 8);
        assert_eq!(valid.get(1).unwrap().label, 9);
    }

    #[test]
    fn batcher_normalizes_to_unit_range() {
        let device = Default::default();
        let dataset = DigitDataset::from_raw(
            vec![vec![255u8; WIDTH * HEIGHT], vec![0u8; WIDTH * HEIGHT]],
            vec![7, 2],
        )
        .unwrap();
        let items = vec![dataset.get(0).unwrap(), dataset.get(1).unwrap()];

        let batch = DigitBatcher::<TestBackend>::new(device).batch(items);

        assert_eq!(batch.images.dims(), [2, 1, HEIGHT, WIDTH]);
        let max = batch.images.clone().max().into_scalar();
        let min = batch.images.min().into_scalar();
        assert_eq!(max, 1.0);
        assert_eq!(min, 0.0);
        assert_eq!(
            batch.targets.into_data().to_vec::<i64>().unwrap(),
            vec![7, 2]
        );
    }
}

//! Chunked on-disk (T, Y, X) frame stores, backed by Zarr v3 (§4.J).
//!
//! One array per stack (mask / labels / raw / corrected fluorescence), chunked
//! one frame per chunk (`[1, H, W]`) so that reading or writing a single frame
//! touches exactly one chunk: O(Y·X) per frame regardless of stack length.

use std::path::Path;
use std::sync::Arc;

use ndarray::Array2;
use zarrs::array::builder::ArrayBuilderFillValue;
use zarrs::array::{data_type, Array as ZarrArray, DataType};
use zarrs::config::MetadataRetrieveVersion;
use zarrs::filesystem::FilesystemStore;
use zarrs::storage::ReadableWritableListableStorageTraits;

use crate::error::{PipelineError, Result};

pub type Store = Arc<FilesystemStore>;
pub type StoreArray = ZarrArray<dyn ReadableWritableListableStorageTraits>;

pub fn open_store(root: &Path) -> Result<Store> {
    let store = FilesystemStore::new(root)?;
    Ok(Arc::new(store))
}

/// A Zarr element type usable as one of the four stack roles (§1, §4.J).
pub trait FrameElement: zarrs::array::Element + zarrs::array::ElementOwned + Default + Clone {
    fn data_type() -> DataType;
    fn fill_value() -> ArrayBuilderFillValue;
}

impl FrameElement for bool {
    fn data_type() -> DataType {
        data_type::bool()
    }
    fn fill_value() -> ArrayBuilderFillValue {
        zarrs::array::FillValue::from(false).into()
    }
}

impl FrameElement for u16 {
    fn data_type() -> DataType {
        data_type::uint16()
    }
    fn fill_value() -> ArrayBuilderFillValue {
        0u16.into()
    }
}

impl FrameElement for f32 {
    fn data_type() -> DataType {
        data_type::float32()
    }
    fn fill_value() -> ArrayBuilderFillValue {
        0.0f32.into()
    }
}

impl FrameElement for f64 {
    fn data_type() -> DataType {
        data_type::float64()
    }
    fn fill_value() -> ArrayBuilderFillValue {
        0.0f64.into()
    }
}

/// A single (T, H, W) stack, chunked one frame per chunk.
pub struct FrameStore<T: FrameElement> {
    array: StoreArray,
    height: usize,
    width: usize,
    n_frames: usize,
    _marker: std::marker::PhantomData<T>,
}

impl<T: FrameElement> FrameStore<T> {
    /// Create a new array at `path` within `store`, shape `(n_frames, height, width)`.
    pub fn create(store: &Store, path: &str, n_frames: usize, height: usize, width: usize) -> Result<Self> {
        let store_trait: Arc<dyn ReadableWritableListableStorageTraits> = store.clone();
        let shape = vec![n_frames as u64, height as u64, width as u64];
        let chunks = vec![1u64, height as u64, width as u64];
        let builder = zarrs::array::ArrayBuilder::new(shape, chunks, T::data_type(), T::fill_value());
        let array = builder.build(store_trait, path)?;
        array.store_metadata()?;
        Ok(Self {
            array,
            height,
            width,
            n_frames,
            _marker: std::marker::PhantomData,
        })
    }

    /// Open an existing array at `path`.
    pub fn open(store: &Store, path: &str, n_frames: usize, height: usize, width: usize) -> Result<Self> {
        let store_trait: Arc<dyn ReadableWritableListableStorageTraits> = store.clone();
        let array = StoreArray::open_opt(store_trait, path, &MetadataRetrieveVersion::V3)?;
        Ok(Self {
            array,
            height,
            width,
            n_frames,
            _marker: std::marker::PhantomData,
        })
    }

    pub fn n_frames(&self) -> usize {
        self.n_frames
    }

    pub fn read_frame(&self, t: usize) -> Result<Array2<T>> {
        if t >= self.n_frames {
            return Err(PipelineError::InvalidArgument(format!(
                "frame index {t} out of range for {} frames",
                self.n_frames
            )));
        }
        let data = self.array.retrieve_chunk::<Vec<T>>(&[t as u64, 0, 0])?;
        Array2::from_shape_vec((self.height, self.width), data)
            .map_err(|e| PipelineError::ShapeMismatch(e.to_string()))
    }

    pub fn write_frame(&self, t: usize, frame: &Array2<T>) -> Result<()> {
        if t >= self.n_frames {
            return Err(PipelineError::InvalidArgument(format!(
                "frame index {t} out of range for {} frames",
                self.n_frames
            )));
        }
        if frame.dim() != (self.height, self.width) {
            return Err(PipelineError::ShapeMismatch(format!(
                "expected frame shape ({}, {}), got {:?}",
                self.height,
                self.width,
                frame.dim()
            )));
        }
        let data: Vec<T> = frame.iter().cloned().collect();
        self.array.store_chunk(&[t as u64, 0, 0], data)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_u16_frames() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).unwrap();
        let fs = FrameStore::<u16>::create(&store, "/raw", 3, 4, 5).unwrap();
        let frame = Array2::from_shape_fn((4, 5), |(y, x)| (y * 5 + x) as u16);
        fs.write_frame(1, &frame).unwrap();
        let got = fs.read_frame(1).unwrap();
        assert_eq!(got, frame);
        let empty = fs.read_frame(0).unwrap();
        assert!(empty.iter().all(|&v| v == 0));
    }

    #[test]
    fn round_trips_bool_masks() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).unwrap();
        let fs = FrameStore::<bool>::create(&store, "/mask", 2, 3, 3).unwrap();
        let mut frame = Array2::from_elem((3, 3), false);
        frame[[1, 1]] = true;
        fs.write_frame(0, &frame).unwrap();
        assert_eq!(fs.read_frame(0).unwrap(), frame);
    }

    #[test]
    fn rejects_out_of_range_frame() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).unwrap();
        let fs = FrameStore::<f32>::create(&store, "/fl", 2, 2, 2).unwrap();
        assert!(fs.read_frame(2).is_err());
    }

    #[test]
    fn reopen_reads_persisted_data() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).unwrap();
        {
            let fs = FrameStore::<f64>::create(&store, "/corrected", 1, 2, 2).unwrap();
            let frame = Array2::from_shape_vec((2, 2), vec![1.0, 2.0, 3.0, 4.0]).unwrap();
            fs.write_frame(0, &frame).unwrap();
        }
        let store2 = open_store(dir.path()).unwrap();
        let reopened = FrameStore::<f64>::open(&store2, "/corrected", 1, 2, 2).unwrap();
        assert_eq!(
            reopened.read_frame(0).unwrap(),
            Array2::from_shape_vec((2, 2), vec![1.0, 2.0, 3.0, 4.0]).unwrap()
        );
    }
}

//! Recognition engine: ties the embedding model, the similarity index and the
//! identity store together.
//!
//! The engine owns the in-memory label maps (id <-> name), which are always
//! rebuilt from the store when one is attached. Training builds a fresh index
//! and only swaps it in on success, so a failed run leaves the previous state
//! usable.

use crate::dataset;
use crate::detector::{largest_face, DetectorError, FaceDetect};
use crate::extractor::{ArcFaceExtractor, EmbeddingModel, ExtractorError};
use crate::index::{IndexError, SimilarityIndex};
use crate::types::{crop, Recognition, NO_MATCH, UNKNOWN_NAME};
use frec_store::{vector_to_bytes, IdentityStore, StoreError};
use image::RgbImage;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

pub const DEFAULT_THRESHOLD: f32 = 0.70;
pub const DEFAULT_MIN_FACE_SIZE: u32 = 80;
/// Margin added around detector boxes before cropping enrollment images.
pub const FACE_MARGIN: f32 = 0.10;
const INCREMENTAL_CAPACITY: usize = 1000;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("embedding model not loaded")]
    ModelNotLoaded,
    #[error("face detector not loaded")]
    DetectorNotLoaded,
    #[error("identity store not attached")]
    StoreNotSet,
    #[error("face too small: {width}x{height}, minimum {min}")]
    FaceTooSmall { width: u32, height: u32, min: u32 },
    #[error("index dimension {index} does not match model dimension {model}")]
    DimensionMismatch { index: usize, model: usize },
    #[error("no training data: {0}")]
    NoTrainingData(String),
    #[error("extractor: {0}")]
    Extractor(#[from] ExtractorError),
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("index: {0}")]
    Index(#[from] IndexError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("image: {0}")]
    Image(#[from] image::ImageError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Anything that can label face crops. The frame pipeline only needs this.
pub trait Recognizer: Send {
    fn is_trained(&self) -> bool;
    fn recognize(&mut self, face: &RgbImage) -> Result<Recognition, EngineError>;
    fn label_name(&self, identity_id: i64) -> String;
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub threshold: f32,
    pub min_face_size: u32,
    /// Where the index is persisted after training and incremental adds.
    pub index_path: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            min_face_size: DEFAULT_MIN_FACE_SIZE,
            index_path: PathBuf::from("face_index.bin"),
        }
    }
}

/// Result of a successful training run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrainingSummary {
    pub identities: usize,
    pub embeddings: usize,
}

pub struct RecognitionEngine {
    model: Option<Box<dyn EmbeddingModel>>,
    detector: Option<Box<dyn FaceDetect>>,
    store: Option<Arc<IdentityStore>>,
    index: SimilarityIndex,
    id_to_name: HashMap<i64, String>,
    name_to_id: HashMap<String, i64>,
    threshold: f32,
    min_face_size: u32,
    index_path: PathBuf,
    trained: bool,
}

impl RecognitionEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            model: None,
            detector: None,
            store: None,
            index: SimilarityIndex::new(0),
            id_to_name: HashMap::new(),
            name_to_id: HashMap::new(),
            threshold: config.threshold.clamp(0.0, 1.0),
            min_face_size: config.min_face_size,
            index_path: config.index_path,
            trained: false,
        }
    }

    /// Load an ArcFace ONNX model from disk.
    pub fn load_model(&mut self, path: impl AsRef<Path>) -> Result<(), EngineError> {
        let model = ArcFaceExtractor::load(path)?;
        self.set_model(Box::new(model));
        Ok(())
    }

    /// Install an embedding model. Any existing index is discarded since its
    /// vectors may come from a different model.
    pub fn set_model(&mut self, model: Box<dyn EmbeddingModel>) {
        self.index = SimilarityIndex::new(model.dimension());
        self.trained = false;
        self.model = Some(model);
    }

    pub fn set_detector(&mut self, detector: Box<dyn FaceDetect>) {
        self.detector = Some(detector);
    }

    pub fn set_store(&mut self, store: Arc<IdentityStore>) {
        self.store = Some(store);
        self.reload_labels();
    }

    pub fn store(&self) -> Option<&Arc<IdentityStore>> {
        self.store.as_ref()
    }

    pub fn has_model(&self) -> bool {
        self.model.is_some()
    }

    pub fn has_detector(&self) -> bool {
        self.detector.is_some()
    }

    pub fn index(&self) -> &SimilarityIndex {
        &self.index
    }

    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn set_threshold(&mut self, threshold: f32) {
        self.threshold = threshold.clamp(0.0, 1.0);
    }

    pub fn min_face_size(&self) -> u32 {
        self.min_face_size
    }

    pub fn set_min_face_size(&mut self, min_face_size: u32) {
        self.min_face_size = min_face_size;
    }

    pub fn is_trained(&self) -> bool {
        self.trained && self.index.is_built() && !self.index.is_empty()
    }

    /// Number of identities with a known name.
    pub fn identity_count(&self) -> usize {
        self.id_to_name.len()
    }

    pub fn identity_id(&self, name: &str) -> Option<i64> {
        self.name_to_id.get(name).copied()
    }

    pub fn label_name(&self, identity_id: i64) -> String {
        self.id_to_name
            .get(&identity_id)
            .cloned()
            .unwrap_or_else(|| UNKNOWN_NAME.to_string())
    }

    /// Embed a face crop. Crops smaller than the minimum face size on either
    /// side are rejected.
    pub fn extract_embedding(&mut self, face: &RgbImage) -> Result<Vec<f32>, EngineError> {
        let (width, height) = face.dimensions();
        if width < self.min_face_size || height < self.min_face_size {
            return Err(EngineError::FaceTooSmall {
                width,
                height,
                min: self.min_face_size,
            });
        }
        let model = self.model.as_mut().ok_or(EngineError::ModelNotLoaded)?;
        Ok(model.embed(face)?)
    }

    /// Id for `name`, creating the identity if needed.
    pub fn register_identity(&mut self, name: &str) -> Result<i64, EngineError> {
        if let Some(&id) = self.name_to_id.get(name) {
            return Ok(id);
        }
        let id = match &self.store {
            Some(store) => match store.get_identity_by_name(name)? {
                Some(identity) => identity.id,
                None => match store.add_identity(name) {
                    Ok(id) => id,
                    Err(StoreError::DuplicateName(_)) => store
                        .get_identity_by_name(name)?
                        .map(|identity| identity.id)
                        .ok_or_else(|| StoreError::DuplicateName(name.to_string()))?,
                    Err(e) => return Err(e.into()),
                },
            },
            None => self.id_to_name.keys().max().map_or(1, |max| max + 1),
        };
        self.id_to_name.insert(id, name.to_string());
        self.name_to_id.insert(name.to_string(), id);
        tracing::debug!(name, id, "identity registered");
        Ok(id)
    }

    /// Rebuild the label maps from the store. A no-op without a store.
    pub fn load_labels(&mut self) -> Result<(), EngineError> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let identities = store.list_identities()?;
        self.id_to_name.clear();
        self.name_to_id.clear();
        for identity in identities {
            self.name_to_id.insert(identity.name.clone(), identity.id);
            self.id_to_name.insert(identity.id, identity.name);
        }
        Ok(())
    }

    fn reload_labels(&mut self) {
        if let Err(e) = self.load_labels() {
            tracing::warn!(error = %e, "failed to reload identity labels");
        }
    }

    /// Detect the largest face in an image file and embed it.
    /// `Ok(None)` means no usable face was found.
    pub fn embed_image_file(&mut self, path: &Path) -> Result<Option<Vec<f32>>, EngineError> {
        let image = image::open(path)?.to_rgb8();
        match self.crop_largest_face(&image)? {
            Some(face) => self.extract_embedding(&face).map(Some),
            None => Ok(None),
        }
    }

    /// Crop of the largest detected face, with [`FACE_MARGIN`] added.
    pub fn crop_largest_face(&mut self, image: &RgbImage) -> Result<Option<RgbImage>, EngineError> {
        let detector = self.detector.as_mut().ok_or(EngineError::DetectorNotLoaded)?;
        let faces = detector.detect(image)?;
        let rect = largest_face(&faces)
            .and_then(|face| face.expanded(FACE_MARGIN).to_rect(image.width(), image.height()));
        Ok(rect.map(|rect| crop(image, rect)))
    }

    /// Train from a dataset directory with one subdirectory per identity.
    ///
    /// Every usable image is embedded first. Only then are the stored
    /// embeddings replaced and the new index swapped in.
    pub fn train_from_directory(&mut self, root: &Path) -> Result<TrainingSummary, EngineError> {
        if self.model.is_none() {
            return Err(EngineError::ModelNotLoaded);
        }
        if self.detector.is_none() {
            return Err(EngineError::DetectorNotLoaded);
        }
        if !root.is_dir() {
            return Err(EngineError::NoTrainingData(format!(
                "{} is not a directory",
                root.display()
            )));
        }

        let mut samples: Vec<(i64, PathBuf, Vec<f32>)> = Vec::new();
        for (name, dir) in dataset::identity_dirs(root)? {
            let identity_id = self.register_identity(&name)?;
            let mut accepted = 0usize;
            for path in dataset::image_files(&dir)? {
                match self.embed_image_file(&path) {
                    Ok(Some(embedding)) => {
                        samples.push((identity_id, path, embedding));
                        accepted += 1;
                    }
                    Ok(None) => tracing::debug!(path = %path.display(), "no face in training image"),
                    Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping training image"),
                }
            }
            tracing::info!(name = %name, identity_id, images = accepted, "identity embedded");
        }

        if samples.is_empty() {
            return Err(EngineError::NoTrainingData(format!(
                "no usable face images under {}",
                root.display()
            )));
        }

        if let Some(store) = self.store.clone() {
            let rows: Vec<(i64, String, Vec<u8>)> = samples
                .iter()
                .map(|(id, path, embedding)| (*id, path.to_string_lossy().into_owned(), vector_to_bytes(embedding)))
                .collect();
            store.replace_all_embeddings(&rows)?;
        }

        let (ids, vectors): (Vec<i64>, Vec<Vec<f32>>) =
            samples.into_iter().map(|(id, _, v)| (id, v)).unzip();
        self.train_from_embeddings(&ids, &vectors)
    }

    /// Rebuild the index from every embedding in the store. Records whose
    /// length does not match the model are skipped.
    pub fn train_from_store(&mut self) -> Result<TrainingSummary, EngineError> {
        let store = self.store.clone().ok_or(EngineError::StoreNotSet)?;
        let records = store.list_embeddings(None)?;
        let dimension = match &self.model {
            Some(model) => model.dimension(),
            None => records.first().map_or(0, |r| r.vector_bytes.len() / 4),
        };

        let mut ids = Vec::with_capacity(records.len());
        let mut vectors = Vec::with_capacity(records.len());
        for record in &records {
            match record.vector(dimension) {
                Some(v) => {
                    ids.push(record.identity_id);
                    vectors.push(v);
                }
                None => tracing::warn!(
                    embedding_id = record.id,
                    bytes = record.vector_bytes.len(),
                    dimension,
                    "skipping stored embedding with wrong length"
                ),
            }
        }
        self.train_from_embeddings(&ids, &vectors)
    }

    /// Build a fresh index from the given vectors and swap it in.
    pub fn train_from_embeddings(
        &mut self,
        ids: &[i64],
        vectors: &[Vec<f32>],
    ) -> Result<TrainingSummary, EngineError> {
        if ids.is_empty() || vectors.is_empty() {
            return Err(EngineError::NoTrainingData("no embeddings".into()));
        }
        let dimension = match &self.model {
            Some(model) => model.dimension(),
            None => vectors[0].len(),
        };

        let mut index = SimilarityIndex::new(dimension);
        index.build(vectors.len());
        index.add_batch(ids, vectors)?;

        if let Err(e) = index.save(&self.index_path) {
            tracing::warn!(path = %self.index_path.display(), error = %e, "failed to persist index");
        }

        let identities = ids.iter().collect::<BTreeSet<_>>().len();
        self.index = index;
        self.trained = true;
        self.reload_labels();

        tracing::info!(identities, embeddings = ids.len(), "recognition index trained");
        Ok(TrainingSummary {
            identities,
            embeddings: ids.len(),
        })
    }

    /// Rebuild the index from the store. The current index stays live
    /// until the new one is ready.
    pub fn retrain(&mut self) -> Result<TrainingSummary, EngineError> {
        self.train_from_store()
    }

    /// Enroll one more face for `identity_id` without retraining.
    ///
    /// The embedding row is stored and the extended index persisted before
    /// the face becomes searchable. If either step fails the live index is
    /// unchanged.
    pub fn add_incremental(
        &mut self,
        face: &RgbImage,
        identity_id: i64,
        source_path: &str,
    ) -> Result<(), EngineError> {
        let embedding = self.extract_embedding(face)?;
        let mut index = self.index.clone();
        if !index.is_built() {
            index.build(INCREMENTAL_CAPACITY);
        }
        index.add(identity_id, &embedding)?;

        let stored = match &self.store {
            Some(store) => Some(store.add_embedding(identity_id, source_path, &vector_to_bytes(&embedding))?),
            None => None,
        };
        if let Err(e) = index.save(&self.index_path) {
            if let (Some(store), Some(embedding_id)) = (&self.store, stored) {
                if let Err(undo) = store.delete_embedding(embedding_id) {
                    tracing::error!(embedding_id, error = %undo, "failed to undo stored embedding");
                }
            }
            return Err(e.into());
        }

        self.index = index;
        self.trained = true;
        self.reload_labels();

        tracing::info!(identity_id, entries = self.index.len(), "incremental face added");
        Ok(())
    }

    /// Match a face crop against the index.
    ///
    /// Untrained engines and faces under the minimum size report no match
    /// with confidence 0.0. Below-threshold matches report no match with the
    /// similarity that was found.
    pub fn recognize(&mut self, face: &RgbImage) -> Result<Recognition, EngineError> {
        if !self.is_trained() {
            return Ok(Recognition::unknown(0.0));
        }
        let embedding = match self.extract_embedding(face) {
            Ok(embedding) => embedding,
            Err(EngineError::FaceTooSmall { .. }) => return Ok(Recognition::unknown(0.0)),
            Err(e) => return Err(e),
        };

        let (identity_id, confidence) = self.index.search(&embedding);
        if identity_id == NO_MATCH || confidence < self.threshold {
            return Ok(Recognition::unknown(confidence));
        }
        Ok(Recognition {
            identity_id,
            confidence,
        })
    }

    /// [`RecognitionEngine::recognize`] with the identity resolved to a name.
    pub fn recognize_with_name(&mut self, face: &RgbImage) -> Result<(String, f32), EngineError> {
        let result = self.recognize(face)?;
        Ok((self.label_name(result.identity_id), result.confidence))
    }

    /// Load a persisted index. Its dimension must match the loaded model.
    pub fn load_index(&mut self, path: &Path) -> Result<usize, EngineError> {
        let mut index = SimilarityIndex::new(self.index.dimension());
        index.load(path)?;
        if let Some(model) = &self.model {
            if index.dimension() != model.dimension() {
                return Err(EngineError::DimensionMismatch {
                    index: index.dimension(),
                    model: model.dimension(),
                });
            }
        }
        self.index = index;
        self.trained = !self.index.is_empty();
        self.index_path = path.to_path_buf();
        self.reload_labels();
        Ok(self.index.len())
    }

    /// Forget the index and labels. Stored data is untouched.
    pub fn clear(&mut self) {
        self.index.clear();
        self.trained = false;
        self.id_to_name.clear();
        self.name_to_id.clear();
    }
}

impl Recognizer for RecognitionEngine {
    fn is_trained(&self) -> bool {
        RecognitionEngine::is_trained(self)
    }

    fn recognize(&mut self, face: &RgbImage) -> Result<Recognition, EngineError> {
        RecognitionEngine::recognize(self, face)
    }

    fn label_name(&self, identity_id: i64) -> String {
        RecognitionEngine::label_name(self, identity_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{solid, ColorModel, WholeFrameDetector};
    use std::fs;

    fn engine(dir: &Path, store: Option<Arc<IdentityStore>>) -> RecognitionEngine {
        let mut engine = RecognitionEngine::new(EngineConfig {
            index_path: dir.join("index.bin"),
            ..EngineConfig::default()
        });
        engine.set_model(Box::new(ColorModel));
        engine.set_detector(Box::new(WholeFrameDetector));
        if let Some(store) = store {
            engine.set_store(store);
        }
        engine
    }

    fn memory_store() -> Arc<IdentityStore> {
        let store = IdentityStore::open_in_memory().unwrap();
        store.initialize().unwrap();
        Arc::new(store)
    }

    fn write_dataset(root: &Path) {
        for (name, rgb) in [("A1", [255, 0, 0]), ("B2", [0, 0, 255])] {
            let dir = root.join(name);
            fs::create_dir_all(&dir).unwrap();
            solid(rgb).save(dir.join("1.png")).unwrap();
            solid(rgb).save(dir.join("2.png")).unwrap();
        }
        fs::create_dir_all(root.join(".hidden")).unwrap();
        solid([0, 255, 0]).save(root.join(".hidden/1.png")).unwrap();
        fs::write(root.join("A1/readme.txt"), "not an image").unwrap();
        // no face found in a black image
        solid([0, 0, 0]).save(root.join("B2/3.png")).unwrap();
    }

    #[test]
    fn test_untrained_recognize_is_no_match() {
        let mut engine = RecognitionEngine::new(EngineConfig::default());
        let r = engine.recognize(&solid([255, 0, 0])).unwrap();
        assert_eq!(r, Recognition::unknown(0.0));
        assert!(!engine.is_trained());
    }

    #[test]
    fn test_extract_rejects_small_face() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine(dir.path(), None);
        let small = RgbImage::from_pixel(79, 200, image::Rgb([1, 2, 3]));
        assert!(matches!(
            engine.extract_embedding(&small),
            Err(EngineError::FaceTooSmall { width: 79, height: 200, min: 80 })
        ));
        assert_eq!(engine.extract_embedding(&solid([1, 2, 3])).unwrap().len(), 3);
    }

    #[test]
    fn test_train_from_embeddings_and_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine(dir.path(), None);
        let red = engine.register_identity("red").unwrap();
        let blue = engine.register_identity("blue").unwrap();
        assert_ne!(red, blue);

        let summary = engine
            .train_from_embeddings(&[red, blue], &[vec![1.0, 0.0, 0.0], vec![0.0, 0.0, 1.0]])
            .unwrap();
        assert_eq!(summary, TrainingSummary { identities: 2, embeddings: 2 });
        assert!(engine.is_trained());
        assert!(dir.path().join("index.bin").exists());

        let (name, confidence) = engine.recognize_with_name(&solid([250, 5, 0])).unwrap();
        assert_eq!(name, "red");
        assert!(confidence > 0.99);

        // green is orthogonal to both: similarity 0.5, under the threshold
        let r = engine.recognize(&solid([0, 255, 0])).unwrap();
        assert_eq!(r.identity_id, NO_MATCH);
        assert!((r.confidence - 0.5).abs() < 1e-4);

        engine.set_threshold(0.4);
        assert!(engine.recognize(&solid([0, 255, 0])).unwrap().is_match());
        engine.set_threshold(7.0);
        assert_eq!(engine.threshold(), 1.0);
    }

    #[test]
    fn test_train_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("dataset");
        write_dataset(&data);
        let store = memory_store();
        let mut engine = engine(dir.path(), Some(store.clone()));

        let summary = engine.train_from_directory(&data).unwrap();
        assert_eq!(summary, TrainingSummary { identities: 2, embeddings: 4 });
        assert_eq!(engine.identity_count(), 2);
        assert_eq!(store.count_embeddings().unwrap(), 4);
        assert!(store.get_identity_by_name(".hidden").unwrap().is_none());

        let (name, _) = engine.recognize_with_name(&solid([200, 0, 0])).unwrap();
        assert_eq!(name, "A1");
        let (name, _) = engine.recognize_with_name(&solid([0, 0, 200])).unwrap();
        assert_eq!(name, "B2");

        // retraining replaces rather than appends stored embeddings
        engine.train_from_directory(&data).unwrap();
        assert_eq!(store.count_embeddings().unwrap(), 4);
    }

    #[test]
    fn test_failed_training_keeps_previous_state() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("dataset");
        write_dataset(&data);
        let store = memory_store();
        let mut engine = engine(dir.path(), Some(store.clone()));
        engine.train_from_directory(&data).unwrap();

        let empty = dir.path().join("empty");
        fs::create_dir_all(empty.join("C3")).unwrap();
        solid([0, 0, 0]).save(empty.join("C3/1.png")).unwrap();

        assert!(matches!(
            engine.train_from_directory(&empty),
            Err(EngineError::NoTrainingData(_))
        ));
        assert!(engine.is_trained());
        assert_eq!(store.count_embeddings().unwrap(), 4);
        assert_eq!(engine.recognize_with_name(&solid([255, 0, 0])).unwrap().0, "A1");
    }

    #[test]
    fn test_train_from_directory_requires_model() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = RecognitionEngine::new(EngineConfig::default());
        assert!(matches!(
            engine.train_from_directory(dir.path()),
            Err(EngineError::ModelNotLoaded)
        ));
    }

    #[test]
    fn test_add_incremental_is_searchable_and_durable() {
        let dir = tempfile::tempdir().unwrap();
        let store = memory_store();
        let mut engine = engine(dir.path(), Some(store.clone()));

        let id = engine.register_identity("G7").unwrap();
        engine.add_incremental(&solid([0, 255, 0]), id, "dataset/G7/1.jpg").unwrap();

        assert!(engine.is_trained());
        let r = engine.recognize(&solid([0, 250, 0])).unwrap();
        assert_eq!(r.identity_id, id);
        assert_eq!(store.count_embeddings().unwrap(), 1);

        let mut reloaded = SimilarityIndex::new(0);
        reloaded.load(&dir.path().join("index.bin")).unwrap();
        assert_eq!(reloaded.len(), 1);
    }

    #[test]
    fn test_add_incremental_failure_leaves_index_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let store = memory_store();
        let mut engine = RecognitionEngine::new(EngineConfig {
            // a directory cannot be written as the index file
            index_path: dir.path().to_path_buf(),
            ..EngineConfig::default()
        });
        engine.set_model(Box::new(ColorModel));
        engine.set_store(store.clone());

        let id = engine.register_identity("A1").unwrap();
        assert!(engine.add_incremental(&solid([255, 0, 0]), id, "a.jpg").is_err());
        assert!(!engine.is_trained());
        assert!(engine.index().is_empty());
        assert_eq!(engine.recognize(&solid([255, 0, 0])).unwrap(), Recognition::unknown(0.0));
        assert_eq!(store.count_embeddings().unwrap(), 0);
    }

    #[test]
    fn test_add_incremental_store_error_is_returned() {
        let dir = tempfile::tempdir().unwrap();
        let store = memory_store();
        let mut engine = engine(dir.path(), Some(store.clone()));
        let id = engine.register_identity("A1").unwrap();
        engine.add_incremental(&solid([255, 0, 0]), id, "a.jpg").unwrap();

        store.close();
        assert!(matches!(
            engine.add_incremental(&solid([0, 0, 255]), id, "b.jpg"),
            Err(EngineError::Store(StoreError::NotOpen))
        ));
        assert_eq!(engine.index().len(), 1);
        let mut on_disk = SimilarityIndex::new(0);
        on_disk.load(&dir.path().join("index.bin")).unwrap();
        assert_eq!(on_disk.len(), 1);
    }

    #[test]
    fn test_retrain_failure_keeps_trained_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = memory_store();
        let mut engine = engine(dir.path(), Some(store.clone()));
        let id = engine.register_identity("A1").unwrap();
        engine.add_incremental(&solid([255, 0, 0]), id, "a.jpg").unwrap();

        store.close();
        assert!(matches!(engine.retrain(), Err(EngineError::Store(StoreError::NotOpen))));
        assert!(engine.is_trained());
        assert_eq!(engine.recognize_with_name(&solid([255, 0, 0])).unwrap().0, "A1");
    }

    #[test]
    fn test_train_from_store_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        let store = memory_store();
        {
            let mut engine = engine(dir.path(), Some(store.clone()));
            let id = engine.register_identity("A1").unwrap();
            engine.add_incremental(&solid([255, 0, 0]), id, "a.jpg").unwrap();
        }

        let mut engine = engine(dir.path(), Some(store.clone()));
        assert!(!engine.is_trained());
        assert_eq!(engine.identity_count(), 1);
        let summary = engine.retrain().unwrap();
        assert_eq!(summary.embeddings, 1);
        assert_eq!(engine.recognize_with_name(&solid([255, 0, 0])).unwrap().0, "A1");
    }

    #[test]
    fn test_train_from_store_skips_wrong_length() {
        let dir = tempfile::tempdir().unwrap();
        let store = memory_store();
        let id = store.add_identity("A1").unwrap();
        store.add_embedding(id, "a", &vector_to_bytes(&[1.0, 0.0, 0.0])).unwrap();
        store.add_embedding(id, "b", &vector_to_bytes(&[1.0, 0.0])).unwrap();

        let mut engine = engine(dir.path(), Some(store));
        assert_eq!(engine.train_from_store().unwrap().embeddings, 1);
    }

    #[test]
    fn test_load_index_dimension_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("other.bin");
        let mut index = SimilarityIndex::new(4);
        index.build(1);
        index.add(1, &[0.5; 4]).unwrap();
        index.save(&path).unwrap();

        let mut engine = engine(dir.path(), None);
        assert!(matches!(
            engine.load_index(&path),
            Err(EngineError::DimensionMismatch { index: 4, model: 3 })
        ));
        assert!(!engine.is_trained());
    }

    #[test]
    fn test_clear_forgets_everything() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine(dir.path(), None);
        let id = engine.register_identity("A1").unwrap();
        engine.train_from_embeddings(&[id], &[vec![1.0, 0.0, 0.0]]).unwrap();
        engine.clear();
        assert!(!engine.is_trained());
        assert_eq!(engine.identity_count(), 0);
        assert_eq!(engine.label_name(id), UNKNOWN_NAME);
    }
}

//! Explicit embedding-model cache
//!
//! Owned by the caller and passed by reference. Starts empty, is filled
//! lazily per model identifier and never evicts.

use std::collections::HashMap;
use std::sync::Arc;

use burn::prelude::*;
use tracing::debug;

use crate::model::EmbeddingModel;

pub type SharedModel<B> = Arc<dyn EmbeddingModel<B>>;

pub struct ModelCache<B: Backend> {
    models: HashMap<String, SharedModel<B>>,
}

impl<B: Backend> Default for ModelCache<B> {
    fn default() -> Self {
        Self {
            models: HashMap::new(),
        }
    }
}

impl<B: Backend> ModelCache<B> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached model or load and cache it
    pub fn get_or_load<F, E>(&mut self, id: &str, load: F) -> Result<SharedModel<B>, E>
    where
        F: FnOnce(&str) -> Result<SharedModel<B>, E>,
    {
        if let Some(model) = self.models.get(id) {
            return Ok(model.clone());
        }
        debug!("loading embedding model {}", id);
        let model = load(id)?;
        self.models.insert(id.to_string(), model.clone());
        Ok(model)
    }

    pub fn insert(&mut self, id: impl Into<String>, model: SharedModel<B>) {
        self.models.insert(id.into(), model);
    }

    pub fn get(&self, id: &str) -> Option<SharedModel<B>> {
        self.models.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.models.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;
    use std::cell::Cell;

    type TestBackend = NdArray<f32>;

    struct Fixed;

    impl EmbeddingModel<TestBackend> for Fixed {
        fn encode_text(&self, _tokens: &[String]) -> Tensor<TestBackend, 2> {
            Tensor::ones([1, 4], &Default::default())
        }

        fn encode_image(&self, images: Tensor<TestBackend, 4>) -> Tensor<TestBackend, 2> {
            let [n, _, _, _] = images.dims();
            Tensor::ones([n, 4], &images.device())
        }
    }

    #[test]
    fn test_loads_once() {
        let mut cache = ModelCache::<TestBackend>::new();
        let loads = Cell::new(0);
        let load = |_: &str| -> Result<SharedModel<TestBackend>, String> {
            loads.set(loads.get() + 1);
            Ok(Arc::new(Fixed))
        };

        assert!(cache.is_empty());
        cache.get_or_load("ViT-B-32::openai", load).unwrap();
        cache.get_or_load("ViT-B-32::openai", load).unwrap();
        assert_eq!(loads.get(), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.contains("ViT-B-32::openai"));
        assert_eq!(cache.get("ViT-B-32::openai").unwrap().input_resolution(), 224);
    }

    #[test]
    fn test_load_error_not_cached() {
        let mut cache = ModelCache::<TestBackend>::new();
        let result = cache.get_or_load("RN50::openai", |id| {
            Err::<SharedModel<TestBackend>, _>(format!("{} unavailable", id))
        });
        assert_eq!(result.err().as_deref(), Some("RN50::openai unavailable"));
        assert!(cache.is_empty());
    }
}

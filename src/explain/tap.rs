//! Activation tap selection and its process-wide cache.

use crate::explain::network::{ConvNetwork, LayerMeta, TapModel};
use crate::explain::ExplainError;
use std::fmt;
use std::sync::{Arc, Mutex};

/// Multi-output model over every feature-map layer of one source network.
pub struct ActivationTap {
    source: String,
    model: Box<dyn TapModel>,
    layers: Vec<LayerMeta>,
}

impl ActivationTap {
    pub fn new(source: impl Into<String>, model: Box<dyn TapModel>, layers: Vec<LayerMeta>) -> Self {
        Self {
            source: source.into(),
            model,
            layers,
        }
    }

    /// Name of the network the tap was built from.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Tapped layers, in output order.
    pub fn layers(&self) -> &[LayerMeta] {
        &self.layers
    }

    pub fn model(&self) -> &dyn TapModel {
        self.model.as_ref()
    }
}

impl fmt::Debug for ActivationTap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivationTap")
            .field("source", &self.source)
            .field("layers", &self.layers)
            .finish_non_exhaustive()
    }
}

/// Build a tap over the first candidate that has any rank-4 output layer.
///
/// Candidates are tried in order and layers are never mixed across networks.
pub fn build_tap(candidates: &[&dyn ConvNetwork]) -> Result<ActivationTap, ExplainError> {
    for network in candidates {
        let layers: Vec<LayerMeta> = network
            .layers()
            .into_iter()
            .filter(LayerMeta::is_feature_map)
            .collect();

        if layers.is_empty() {
            tracing::debug!(network = network.name(), "no feature-map layers; trying next candidate");
            continue;
        }

        let names: Vec<String> = layers.iter().map(|l| l.name.clone()).collect();
        let model = network.tap(&names).map_err(ExplainError::Network)?;
        tracing::info!(
            network = network.name(),
            layers = layers.len(),
            "activation tap built"
        );
        return Ok(ActivationTap::new(network.name(), model, layers));
    }

    Err(ExplainError::NoCompatibleLayers {
        candidates: candidates.iter().map(|n| n.name().to_string()).collect(),
    })
}

/// Lazily built, shared [`ActivationTap`].
///
/// The first successful build is kept for the lifetime of the cache;
/// concurrent first callers wait on the lock and then share that instance.
/// Failed builds are not cached.
#[derive(Debug, Default)]
pub struct TapCache {
    slot: Mutex<Option<Arc<ActivationTap>>>,
}

impl TapCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_build(
        &self,
        candidates: &[&dyn ConvNetwork],
    ) -> Result<Arc<ActivationTap>, ExplainError> {
        let mut slot = self
            .slot
            .lock()
            .map_err(|_| ExplainError::Inference("activation tap cache lock poisoned".to_string()))?;

        if let Some(tap) = slot.as_ref() {
            return Ok(Arc::clone(tap));
        }

        let tap = Arc::new(build_tap(candidates)?);
        *slot = Some(Arc::clone(&tap));
        Ok(tap)
    }

    /// The cached tap, if one has been built.
    pub fn get(&self) -> Option<Arc<ActivationTap>> {
        self.slot.lock().ok().and_then(|slot| slot.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::explain::network::NetworkError;
    use ndarray::{Array4, ArrayD, IxDyn};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubTap(usize);

    impl TapModel for StubTap {
        fn run(&self, _input: &Array4<f32>) -> Result<Vec<ArrayD<f32>>, NetworkError> {
            Ok((0..self.0).map(|_| ArrayD::zeros(IxDyn(&[1, 2, 2, 1]))).collect())
        }
    }

    struct StubNetwork {
        name: &'static str,
        layers: Vec<LayerMeta>,
        taps_built: AtomicUsize,
    }

    impl StubNetwork {
        fn new(name: &'static str, layers: Vec<LayerMeta>) -> Self {
            Self {
                name,
                layers,
                taps_built: AtomicUsize::new(0),
            }
        }
    }

    impl ConvNetwork for StubNetwork {
        fn name(&self) -> &str {
            self.name
        }

        fn layers(&self) -> Vec<LayerMeta> {
            self.layers.clone()
        }

        fn tap(&self, layer_names: &[String]) -> Result<Box<dyn TapModel>, NetworkError> {
            self.taps_built.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(StubTap(layer_names.len())))
        }
    }

    fn dense_only(name: &'static str) -> StubNetwork {
        StubNetwork::new(
            name,
            vec![
                LayerMeta::new("flatten", "Flatten", vec![None, Some(64)]),
                LayerMeta::new("dense", "Dense", vec![None, Some(1)]),
            ],
        )
    }

    fn convolutional(name: &'static str) -> StubNetwork {
        StubNetwork::new(
            name,
            vec![
                LayerMeta::new("conv1", "Conv2D", vec![None, Some(126), Some(126), Some(8)]),
                LayerMeta::new("pool1", "MaxPool2D", vec![None, Some(63), Some(63), Some(8)]),
                LayerMeta::new("flatten", "Flatten", vec![None, Some(31752)]),
            ],
        )
    }

    #[test]
    fn test_selects_first_candidate_with_feature_maps() {
        let first = dense_only("spiral");
        let second = convolutional("wave");
        let tap = build_tap(&[&first, &second]).unwrap();

        assert_eq!(tap.source(), "wave");
        let names: Vec<&str> = tap.layers().iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, vec!["conv1", "pool1"]);
        assert_eq!(first.taps_built.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_no_candidate_is_configuration_error() {
        let a = dense_only("spiral");
        let b = dense_only("wave");
        match build_tap(&[&a, &b]) {
            Err(ExplainError::NoCompatibleLayers { candidates }) => {
                assert_eq!(candidates, vec!["spiral", "wave"]);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_cache_returns_same_instance() {
        let network = convolutional("wave");
        let cache = TapCache::new();
        assert!(cache.get().is_none());

        let first = cache.get_or_build(&[&network]).unwrap();
        let second = cache.get_or_build(&[&network]).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(network.taps_built.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cache_builds_once_under_contention() {
        let network = Arc::new(convolutional("wave"));
        let cache = Arc::new(TapCache::new());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let network = Arc::clone(&network);
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || cache.get_or_build(&[&*network]).unwrap())
            })
            .collect();
        let taps: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(network.taps_built.load(Ordering::SeqCst), 1);
        assert!(taps.iter().all(|t| Arc::ptr_eq(t, &taps[0])));
    }

    #[test]
    fn test_failed_build_is_not_cached() {
        let cache = TapCache::new();
        let dense = dense_only("spiral");
        assert!(cache.get_or_build(&[&dense]).is_err());

        let conv = convolutional("wave");
        assert_eq!(cache.get_or_build(&[&conv]).unwrap().source(), "wave");
    }
}

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Generate a random `f64` in the range `[low, high)`.
#[inline]
pub(crate) fn f64_range(rng: &mut fastrand::Rng, low: f64, high: f64) -> f64 {
    low + rng.f64() * (high - low)
}

/// A `fastrand::Rng` that serializes as its current state.
///
/// Restoring from the serialized state continues the exact same stream,
/// which is what checkpoint/resume relies on.
#[derive(Clone, Debug)]
pub(crate) struct SeededRng(fastrand::Rng);

impl SeededRng {
    pub(crate) fn new(seed: Option<u64>) -> Self {
        Self(seed.map_or_else(fastrand::Rng::new, fastrand::Rng::with_seed))
    }

    pub(crate) fn get(&mut self) -> &mut fastrand::Rng {
        &mut self.0
    }

    /// Ten alphanumeric characters, used as vertex correlation ids.
    pub(crate) fn token(&mut self) -> String {
        core::iter::repeat_with(|| self.0.alphanumeric())
            .take(10)
            .collect()
    }
}

impl PartialEq for SeededRng {
    fn eq(&self, other: &Self) -> bool {
        self.0.get_seed() == other.0.get_seed()
    }
}

impl Serialize for SeededRng {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.get_seed().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for SeededRng {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        u64::deserialize(deserializer).map(|state| Self(fastrand::Rng::with_seed(state)))
    }
}

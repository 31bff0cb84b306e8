use image::DynamicImage;
use std::collections::HashMap;

#[cfg(feature = "ort-backend")]
pub mod ort;

/// Label to confidence score.
pub type Scores = HashMap<String, f32>;

/// Raw output of one interrogation, before any filtering.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Interrogation {
    /// Content-rating categories (e.g. `general`, `explicit`)
    pub ratings: Scores,
    /// Descriptive tags
    pub tags: Scores,
}

impl Interrogation {
    pub fn new(ratings: Scores, tags: Scores) -> Self {
        Self { ratings, tags }
    }
}

/// A tagging engine bound to one model.
///
/// Engines are stateful (lazily loaded sessions, scratch buffers) and are not
/// expected to be safe for concurrent use; the registry wraps each one in a
/// mutex and the service serializes calls on top of that.
pub trait Interrogator: Send {
    /// Run the model against a decoded image.
    fn interrogate(&mut self, image: &DynamicImage) -> anyhow::Result<Interrogation>;

    /// Release the model's resources.
    ///
    /// Returns `true` only if something was actually freed; an engine that is
    /// not loaded declines and returns `false`.
    fn unload(&mut self) -> bool;
}

impl<F> Interrogator for F
where
    F: FnMut(&DynamicImage) -> anyhow::Result<Interrogation> + Send,
{
    fn interrogate(&mut self, image: &DynamicImage) -> anyhow::Result<Interrogation> {
        self(image)
    }

    fn unload(&mut self) -> bool {
        false
    }
}

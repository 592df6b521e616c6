//! Analysis provider implementations.
//!
//! Each provider normalizes its own response schema into canonical
//! [`NutritionItem`](crate::NutritionItem)s behind [`AnalysisProvider`].

pub mod traits;

#[cfg(feature = "gemini")]
pub mod gemini;

#[cfg(feature = "edamam")]
pub mod edamam;

pub use traits::{AnalysisProvider, DEFAULT_PROVIDER_TIMEOUT, ImageData};

#[cfg(feature = "gemini")]
pub use gemini::GeminiProvider;

#[cfg(feature = "edamam")]
pub use edamam::EdamamProvider;

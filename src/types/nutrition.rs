//! Canonical nutrition types.

use serde::{Deserialize, Serialize};
use tracing::debug;

/// A single canonical food entry.
///
/// Numeric fields are `None` when the value is unknown. Known values are
/// always finite and non-negative; use the builder setters (or
/// [`sanitized()`](Self::sanitized)) to enforce that on provider data.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NutritionItem {
    pub name: String,
    #[serde(default)]
    pub calories: Option<f64>,
    #[serde(default)]
    pub protein: Option<f64>,
    #[serde(default)]
    pub carbs: Option<f64>,
    #[serde(default)]
    pub fat: Option<f64>,
    #[serde(default)]
    pub sugar: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub portion: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}

/// Accept a measured value only if it is finite and non-negative.
fn measured(value: f64) -> Option<f64> {
    (value.is_finite() && value >= 0.0).then_some(value)
}

impl NutritionItem {
    /// Create an item with every nutrient unknown.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn calories(mut self, kcal: f64) -> Self {
        self.calories = measured(kcal);
        self
    }

    pub fn protein(mut self, grams: f64) -> Self {
        self.protein = measured(grams);
        self
    }

    pub fn carbs(mut self, grams: f64) -> Self {
        self.carbs = measured(grams);
        self
    }

    pub fn fat(mut self, grams: f64) -> Self {
        self.fat = measured(grams);
        self
    }

    pub fn sugar(mut self, grams: f64) -> Self {
        self.sugar = measured(grams);
        self
    }

    pub fn portion(mut self, portion: impl Into<String>) -> Self {
        self.portion = Some(portion.into());
        self
    }

    /// Set provider confidence, clamped to `0.0..=1.0`. Non-finite values are dropped.
    pub fn confidence(mut self, score: f32) -> Self {
        self.confidence = score.is_finite().then(|| score.clamp(0.0, 1.0));
        self
    }

    fn nutrients(&self) -> [(&'static str, Option<f64>); 5] {
        [
            ("calories", self.calories),
            ("protein", self.protein),
            ("carbs", self.carbs),
            ("fat", self.fat),
            ("sugar", self.sugar),
        ]
    }

    /// Check the numeric invariants without modifying the item.
    ///
    /// Used for user-supplied items, which are rejected rather than repaired.
    pub fn validate(&self) -> crate::Result<()> {
        if self.name.trim().is_empty() {
            return Err(crate::MealSyncError::InvalidInput(
                "nutrition item has an empty name".into(),
            ));
        }
        for (field, value) in self.nutrients() {
            if let Some(v) = value
                && measured(v).is_none()
            {
                return Err(crate::MealSyncError::InvalidInput(format!(
                    "{field} for '{}' must be finite and non-negative, got {v}",
                    self.name
                )));
            }
        }
        Ok(())
    }

    /// Repair provider output: out-of-range numbers become unknown, names are trimmed.
    ///
    /// Returns `None` when the item has no usable name.
    pub fn sanitized(mut self) -> Option<Self> {
        let name = self.name.trim();
        if name.is_empty() {
            return None;
        }
        self.name = name.to_string();
        for slot in [
            &mut self.calories,
            &mut self.protein,
            &mut self.carbs,
            &mut self.fat,
            &mut self.sugar,
        ] {
            if let Some(v) = *slot
                && measured(v).is_none()
            {
                debug!(item = %self.name, value = v, "dropping out-of-range nutrient value");
                *slot = None;
            }
        }
        self.confidence = self
            .confidence
            .and_then(|c| c.is_finite().then(|| c.clamp(0.0, 1.0)));
        Some(self)
    }

    /// Whether any nutrient value is unknown.
    pub fn has_unknowns(&self) -> bool {
        self.nutrients().iter().any(|(_, v)| v.is_none())
    }
}

/// Aggregate totals across a list of items.
///
/// Unknown values contribute nothing to the sums; `incomplete` records that
/// at least one contributing value was unknown.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Totals {
    pub calories: f64,
    pub protein: f64,
    pub carbs: f64,
    pub fat: f64,
    pub sugar: f64,
    #[serde(default)]
    pub incomplete: bool,
}

impl Totals {
    /// Sum every numeric field across `items`.
    pub fn from_items(items: &[NutritionItem]) -> Self {
        items.iter().fold(Totals::default(), |mut acc, item| {
            acc.calories += item.calories.unwrap_or(0.0);
            acc.protein += item.protein.unwrap_or(0.0);
            acc.carbs += item.carbs.unwrap_or(0.0);
            acc.fat += item.fat.unwrap_or(0.0);
            acc.sugar += item.sugar.unwrap_or(0.0);
            acc.incomplete |= item.has_unknowns();
            acc
        })
    }
}

/// The canonical output of one analysis.
///
/// Totals are computed at construction and are not editable afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    items: Vec<NutritionItem>,
    totals: Totals,
    provider: String,
    version: String,
}

impl AnalysisResult {
    /// Build a result from normalized items, computing totals.
    pub fn new(
        items: Vec<NutritionItem>,
        provider: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        let totals = Totals::from_items(&items);
        Self {
            items,
            totals,
            provider: provider.into(),
            version: version.into(),
        }
    }

    pub fn items(&self) -> &[NutritionItem] {
        &self.items
    }

    pub fn totals(&self) -> &Totals {
        &self.totals
    }

    /// Identifier of the provider that produced this result.
    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Provider model or schema tag.
    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn into_items(self) -> Vec<NutritionItem> {
        self.items
    }
}

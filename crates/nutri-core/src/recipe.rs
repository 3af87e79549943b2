//! # Recipes
//!
//! Ingredients carry nutrition per 100 g. A recipe lists ingredient
//! weights and a serving count; totals scale each ingredient by its weight.

use std::collections::HashMap;
use std::ops::{Add, Mul};

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::identity::{IngredientId, RecipeId, UserId};

/// Macronutrient values.
///
/// On an [`Ingredient`] these are per 100 g; on a recipe total they are
/// absolute.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Nutrition {
    /// Energy in kcal.
    pub kcal: f64,
    /// Protein in grams.
    pub protein_g: f64,
    /// Carbohydrates in grams.
    pub carbs_g: f64,
    /// Fat in grams.
    pub fat_g: f64,
}

impl Nutrition {
    fn is_valid(&self) -> bool {
        [self.kcal, self.protein_g, self.carbs_g, self.fat_g]
            .iter()
            .all(|v| v.is_finite() && *v >= 0.0)
    }

    /// Values rounded to one decimal, for display.
    pub fn rounded(&self) -> Self {
        let r = |v: f64| (v * 10.0).round() / 10.0;
        Self {
            kcal: r(self.kcal),
            protein_g: r(self.protein_g),
            carbs_g: r(self.carbs_g),
            fat_g: r(self.fat_g),
        }
    }
}

impl Add for Nutrition {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            kcal: self.kcal + rhs.kcal,
            protein_g: self.protein_g + rhs.protein_g,
            carbs_g: self.carbs_g + rhs.carbs_g,
            fat_g: self.fat_g + rhs.fat_g,
        }
    }
}

impl Mul<f64> for Nutrition {
    type Output = Self;

    fn mul(self, k: f64) -> Self {
        Self {
            kcal: self.kcal * k,
            protein_g: self.protein_g * k,
            carbs_g: self.carbs_g * k,
            fat_g: self.fat_g * k,
        }
    }
}

/// A food ingredient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ingredient {
    /// Identifier.
    pub id: IngredientId,
    /// Display name.
    pub name: String,
    /// Nutrition per 100 g.
    pub per_100g: Nutrition,
}

impl Ingredient {
    /// Validate name and nutrition values.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::Recipe("ingredient name must not be empty".into()));
        }
        if !self.per_100g.is_valid() {
            return Err(ValidationError::Recipe(format!(
                "nutrition of '{}' must be finite and non-negative",
                self.name
            )));
        }
        Ok(())
    }
}

/// An ingredient quantity within a recipe.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RecipeItem {
    /// Ingredient used.
    pub ingredient_id: IngredientId,
    /// Weight in grams.
    pub grams: f64,
}

/// A recipe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recipe {
    /// Identifier.
    pub id: RecipeId,
    /// Title.
    pub title: String,
    /// Preparation instructions.
    #[serde(default)]
    pub instructions: String,
    /// Number of servings the recipe yields (≥ 1).
    pub servings: u32,
    /// Ingredient quantities.
    pub items: Vec<RecipeItem>,
    /// Free-form tags (e.g. `vegetarian`).
    #[serde(default)]
    pub tags: Vec<String>,
    /// Author.
    pub created_by: UserId,
}

impl Recipe {
    /// Validate the recipe against the known ingredients.
    pub fn validate(&self, ingredients: &HashMap<IngredientId, Ingredient>) -> Result<(), ValidationError> {
        if self.title.trim().is_empty() {
            return Err(ValidationError::Recipe("title must not be empty".into()));
        }
        if self.servings == 0 {
            return Err(ValidationError::Recipe("servings must be at least 1".into()));
        }
        for item in &self.items {
            if !(item.grams.is_finite() && item.grams > 0.0) {
                return Err(ValidationError::Recipe("ingredient grams must be positive".into()));
            }
            if !ingredients.contains_key(&item.ingredient_id) {
                return Err(ValidationError::Recipe(format!(
                    "unknown ingredient {}",
                    item.ingredient_id
                )));
            }
        }
        Ok(())
    }

    /// Total nutrition of the whole recipe. Unknown ingredients count as zero.
    pub fn nutrition_totals(&self, ingredients: &HashMap<IngredientId, Ingredient>) -> Nutrition {
        self.items
            .iter()
            .filter_map(|item| {
                ingredients
                    .get(&item.ingredient_id)
                    .map(|ing| ing.per_100g * (item.grams / 100.0))
            })
            .fold(Nutrition::default(), Add::add)
    }

    /// Nutrition of a single serving.
    pub fn per_serving(&self, ingredients: &HashMap<IngredientId, Ingredient>) -> Nutrition {
        self.nutrition_totals(ingredients) * (1.0 / f64::from(self.servings.max(1)))
    }
}

//! # Ingredients & Recipes
//!
//! Nutrition totals are computed on request from the current ingredient
//! table, so correcting an ingredient updates every recipe that uses it.

use std::collections::HashMap;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use nutri_core::{Ingredient, IngredientId, Nutrition, Permission, Recipe, RecipeId, RecipeItem, UserId};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use crate::auth::{require_permission, CallerIdentity};
use crate::error::AppError;
use crate::extractors::{extract_json, extract_query};
use crate::state::AppState;

// ── DTOs ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, ToSchema)]
pub struct NutritionBody {
    pub kcal: f64,
    pub protein_g: f64,
    pub carbs_g: f64,
    pub fat_g: f64,
}

impl From<Nutrition> for NutritionBody {
    fn from(n: Nutrition) -> Self {
        Self {
            kcal: n.kcal,
            protein_g: n.protein_g,
            carbs_g: n.carbs_g,
            fat_g: n.fat_g,
        }
    }
}

impl From<NutritionBody> for Nutrition {
    fn from(n: NutritionBody) -> Self {
        Self {
            kcal: n.kcal,
            protein_g: n.protein_g,
            carbs_g: n.carbs_g,
            fat_g: n.fat_g,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct IngredientView {
    #[schema(value_type = String)]
    pub id: IngredientId,
    pub name: String,
    pub per_100g: NutritionBody,
}

impl From<&Ingredient> for IngredientView {
    fn from(i: &Ingredient) -> Self {
        Self {
            id: i.id,
            name: i.name.clone(),
            per_100g: i.per_100g.into(),
        }
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateIngredientRequest {
    pub name: String,
    pub per_100g: NutritionBody,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, ToSchema)]
pub struct RecipeItemBody {
    #[schema(value_type = String)]
    pub ingredient_id: IngredientId,
    pub grams: f64,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct RecipeView {
    #[schema(value_type = String)]
    pub id: RecipeId,
    pub title: String,
    pub instructions: String,
    pub servings: u32,
    pub items: Vec<RecipeItemBody>,
    pub tags: Vec<String>,
    #[schema(value_type = String)]
    pub created_by: UserId,
}

impl From<&Recipe> for RecipeView {
    fn from(r: &Recipe) -> Self {
        Self {
            id: r.id,
            title: r.title.clone(),
            instructions: r.instructions.clone(),
            servings: r.servings,
            items: r
                .items
                .iter()
                .map(|i| RecipeItemBody {
                    ingredient_id: i.ingredient_id,
                    grams: i.grams,
                })
                .collect(),
            tags: r.tags.clone(),
            created_by: r.created_by,
        }
    }
}

/// Body for creating or replacing a recipe.
#[derive(Debug, Deserialize, ToSchema)]
pub struct SaveRecipeRequest {
    pub title: String,
    #[serde(default)]
    pub instructions: String,
    pub servings: u32,
    pub items: Vec<RecipeItemBody>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct RecipeNutrition {
    #[schema(value_type = String)]
    pub recipe_id: RecipeId,
    pub servings: u32,
    /// Whole recipe, rounded to one decimal.
    pub total: NutritionBody,
    /// One serving, rounded to one decimal.
    pub per_serving: NutritionBody,
}

#[derive(Debug, Default, Deserialize, IntoParams)]
pub struct SearchQuery {
    /// Case-insensitive substring of the name or title.
    pub q: Option<String>,
    /// Recipes carrying this tag.
    pub tag: Option<String>,
}

// ── Router ──────────────────────────────────────────────────────────

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/ingredients", get(list_ingredients).post(create_ingredient))
        .route("/v1/recipes", get(list_recipes).post(create_recipe))
        .route(
            "/v1/recipes/:id",
            get(get_recipe).put(update_recipe).delete(delete_recipe),
        )
        .route("/v1/recipes/:id/nutrition", get(recipe_nutrition))
}

// ── Helpers ─────────────────────────────────────────────────────────

fn ingredient_table(state: &AppState) -> HashMap<IngredientId, Ingredient> {
    state
        .ingredients
        .list()
        .into_iter()
        .map(|i| (i.id, i))
        .collect()
}

fn normalize_tags(tags: Vec<String>) -> Vec<String> {
    let mut tags: Vec<String> = tags
        .into_iter()
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect();
    tags.sort();
    tags.dedup();
    tags
}

fn build_recipe(id: RecipeId, created_by: UserId, req: SaveRecipeRequest) -> Recipe {
    Recipe {
        id,
        title: req.title.trim().to_string(),
        instructions: req.instructions,
        servings: req.servings,
        items: req
            .items
            .into_iter()
            .map(|i| RecipeItem {
                ingredient_id: i.ingredient_id,
                grams: i.grams,
            })
            .collect(),
        tags: normalize_tags(req.tags),
        created_by,
    }
}

// ── Handlers ────────────────────────────────────────────────────────

/// GET /v1/ingredients — Ingredients by name.
#[utoipa::path(
    get,
    path = "/v1/ingredients",
    params(SearchQuery),
    responses((status = 200, description = "Ingredients", body = Vec<IngredientView>)),
    tag = "recipes"
)]
async fn list_ingredients(
    State(state): State<AppState>,
    caller: CallerIdentity,
    query: Result<Query<SearchQuery>, QueryRejection>,
) -> Result<Json<Vec<IngredientView>>, AppError> {
    require_permission(&caller, Permission::RecipesRead)?;
    let q = extract_query(query)?;
    let needle = q.q.map(|s| s.trim().to_lowercase());
    let mut items = state.ingredients.filter(|i| {
        needle
            .as_deref()
            .map_or(true, |n| i.name.to_lowercase().contains(n))
    });
    items.sort_by_key(|i| i.name.to_lowercase());
    Ok(Json(items.iter().map(IngredientView::from).collect()))
}

/// POST /v1/ingredients — Add an ingredient.
#[utoipa::path(
    post,
    path = "/v1/ingredients",
    request_body = CreateIngredientRequest,
    responses(
        (status = 201, description = "Created", body = IngredientView),
        (status = 400, description = "Empty name or invalid nutrition", body = crate::error::ErrorBody),
        (status = 409, description = "Name already exists", body = crate::error::ErrorBody),
    ),
    tag = "recipes"
)]
async fn create_ingredient(
    State(state): State<AppState>,
    caller: CallerIdentity,
    body: Result<Json<CreateIngredientRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<IngredientView>), AppError> {
    require_permission(&caller, Permission::RecipesWrite)?;
    let req = extract_json(body)?;
    let ingredient = Ingredient {
        id: IngredientId::new(),
        name: req.name.trim().to_string(),
        per_100g: req.per_100g.into(),
    };
    ingredient.validate()?;
    let key = ingredient.name.to_lowercase();
    if state
        .ingredients
        .find(|i| i.name.to_lowercase() == key)
        .is_some()
    {
        return Err(AppError::Conflict(format!(
            "ingredient '{}' already exists",
            ingredient.name
        )));
    }
    state
        .ingredients
        .insert(*ingredient.id.as_uuid(), ingredient.clone());
    state
        .record_audit(
            Some(caller.user_id()),
            "ingredient.create",
            "ingredient",
            ingredient.id,
            serde_json::json!({ "name": ingredient.name }),
        )
        .await;
    Ok((StatusCode::CREATED, Json(IngredientView::from(&ingredient))))
}

/// GET /v1/recipes — Recipes by title.
#[utoipa::path(
    get,
    path = "/v1/recipes",
    params(SearchQuery),
    responses((status = 200, description = "Recipes", body = Vec<RecipeView>)),
    tag = "recipes"
)]
async fn list_recipes(
    State(state): State<AppState>,
    caller: CallerIdentity,
    query: Result<Query<SearchQuery>, QueryRejection>,
) -> Result<Json<Vec<RecipeView>>, AppError> {
    require_permission(&caller, Permission::RecipesRead)?;
    let q = extract_query(query)?;
    let needle = q.q.map(|s| s.trim().to_lowercase());
    let tag = q.tag.map(|t| t.trim().to_lowercase());
    let mut recipes = state.recipes.filter(|r| {
        needle
            .as_deref()
            .map_or(true, |n| r.title.to_lowercase().contains(n))
            && tag.as_ref().map_or(true, |t| r.tags.contains(t))
    });
    recipes.sort_by_key(|r| r.title.to_lowercase());
    Ok(Json(recipes.iter().map(RecipeView::from).collect()))
}

/// POST /v1/recipes — Create a recipe.
#[utoipa::path(
    post,
    path = "/v1/recipes",
    request_body = SaveRecipeRequest,
    responses(
        (status = 201, description = "Created", body = RecipeView),
        (status = 400, description = "Invalid recipe or unknown ingredient", body = crate::error::ErrorBody),
    ),
    tag = "recipes"
)]
async fn create_recipe(
    State(state): State<AppState>,
    caller: CallerIdentity,
    body: Result<Json<SaveRecipeRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<RecipeView>), AppError> {
    require_permission(&caller, Permission::RecipesWrite)?;
    let req = extract_json(body)?;
    let recipe = build_recipe(RecipeId::new(), caller.user_id(), req);
    recipe.validate(&ingredient_table(&state))?;
    state.recipes.insert(*recipe.id.as_uuid(), recipe.clone());
    state
        .record_audit(
            Some(caller.user_id()),
            "recipe.create",
            "recipe",
            recipe.id,
            serde_json::json!({ "title": recipe.title }),
        )
        .await;
    Ok((StatusCode::CREATED, Json(RecipeView::from(&recipe))))
}

/// GET /v1/recipes/:id — Get a recipe.
#[utoipa::path(
    get,
    path = "/v1/recipes/{id}",
    params(("id" = Uuid, Path, description = "Recipe ID")),
    responses(
        (status = 200, description = "Recipe", body = RecipeView),
        (status = 404, description = "Not found", body = crate::error::ErrorBody),
    ),
    tag = "recipes"
)]
async fn get_recipe(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path(id): Path<Uuid>,
) -> Result<Json<RecipeView>, AppError> {
    require_permission(&caller, Permission::RecipesRead)?;
    let recipe = state
        .recipes
        .get(&id)
        .ok_or_else(|| AppError::not_found("recipe", id))?;
    Ok(Json(RecipeView::from(&recipe)))
}

/// PUT /v1/recipes/:id — Replace a recipe.
#[utoipa::path(
    put,
    path = "/v1/recipes/{id}",
    params(("id" = Uuid, Path, description = "Recipe ID")),
    request_body = SaveRecipeRequest,
    responses(
        (status = 200, description = "Updated", body = RecipeView),
        (status = 400, description = "Invalid recipe or unknown ingredient", body = crate::error::ErrorBody),
        (status = 404, description = "Not found", body = crate::error::ErrorBody),
    ),
    tag = "recipes"
)]
async fn update_recipe(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path(id): Path<Uuid>,
    body: Result<Json<SaveRecipeRequest>, JsonRejection>,
) -> Result<Json<RecipeView>, AppError> {
    require_permission(&caller, Permission::RecipesWrite)?;
    let existing = state
        .recipes
        .get(&id)
        .ok_or_else(|| AppError::not_found("recipe", id))?;
    let req = extract_json(body)?;
    let recipe = build_recipe(existing.id, existing.created_by, req);
    recipe.validate(&ingredient_table(&state))?;
    state.recipes.insert(id, recipe.clone());
    state
        .record_audit(
            Some(caller.user_id()),
            "recipe.update",
            "recipe",
            id,
            serde_json::json!({ "title": recipe.title }),
        )
        .await;
    Ok(Json(RecipeView::from(&recipe)))
}

/// DELETE /v1/recipes/:id — Delete a recipe.
#[utoipa::path(
    delete,
    path = "/v1/recipes/{id}",
    params(("id" = Uuid, Path, description = "Recipe ID")),
    responses(
        (status = 204, description = "Deleted"),
        (status = 404, description = "Not found", body = crate::error::ErrorBody),
    ),
    tag = "recipes"
)]
async fn delete_recipe(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    require_permission(&caller, Permission::RecipesWrite)?;
    state
        .recipes
        .remove(&id)
        .ok_or_else(|| AppError::not_found("recipe", id))?;
    state
        .record_audit(Some(caller.user_id()), "recipe.delete", "recipe", id, serde_json::json!({}))
        .await;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /v1/recipes/:id/nutrition — Totals and per-serving nutrition.
#[utoipa::path(
    get,
    path = "/v1/recipes/{id}/nutrition",
    params(("id" = Uuid, Path, description = "Recipe ID")),
    responses(
        (status = 200, description = "Nutrition", body = RecipeNutrition),
        (status = 404, description = "Not found", body = crate::error::ErrorBody),
    ),
    tag = "recipes"
)]
async fn recipe_nutrition(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path(id): Path<Uuid>,
) -> Result<Json<RecipeNutrition>, AppError> {
    require_permission(&caller, Permission::RecipesRead)?;
    let recipe = state
        .recipes
        .get(&id)
        .ok_or_else(|| AppError::not_found("recipe", id))?;
    let table = ingredient_table(&state);
    Ok(Json(RecipeNutrition {
        recipe_id: recipe.id,
        servings: recipe.servings,
        total: recipe.nutrition_totals(&table).rounded().into(),
        per_serving: recipe.per_serving(&table).rounded().into(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_are_normalized() {
        let tags = normalize_tags(vec![" Vegan".into(), "vegan".into(), "".into(), "Quick".into()]);
        assert_eq!(tags, vec!["quick".to_string(), "vegan".to_string()]);
    }
}

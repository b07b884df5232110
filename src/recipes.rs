//! Compression recipes for written exposures.
//!
//! A recipe is a named configuration controlling lossy compression and
//! quantization/scaling for each of the three planes (image, mask,
//! variance) of a stored exposure. Raw recipes arrive as uncoerced JSON
//! values from configuration loading; [`validate_recipes`] normalizes them
//! against a fixed schema so that no partial recipe ever reaches the codec.
//!
//! A scaling seed of exactly 0 is a sentinel meaning "derive the seed from
//! the dataset identity", not "use literal seed zero"; the substitution
//! happens in [`resolve_recipe`] at write time.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use thiserror::Error;

/// Plane names a recipe may configure.
const PLANES: [&str; 3] = ["image", "mask", "variance"];

/// Sub-sections a plane may configure.
const SECTIONS: [&str; 2] = ["compression", "scaling"];

/// Errors raised while validating or resolving recipes.
#[derive(Error, Debug)]
pub enum RecipeError {
    #[error("unrecognized entries when parsing image compression recipe {location}: {keys}")]
    UnrecognizedKeys { location: String, keys: String },
    #[error("image compression recipe {location} is not a mapping")]
    NotAMapping { location: String },
    #[error("image compression recipe {location} expects {expected}, got {found}")]
    InvalidValue {
        location: String,
        expected: &'static str,
        found: String,
    },
    #[error("unrecognized recipe option given for compression: {name}")]
    UnknownRecipe { name: String },
}

/// Compression sub-section of one plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressionSettings {
    pub algorithm: String,
    pub rows: i64,
    pub columns: i64,
    #[serde(rename = "quantizeLevel")]
    pub quantize_level: f64,
}

impl Default for CompressionSettings {
    fn default() -> Self {
        Self {
            algorithm: "NONE".to_string(),
            rows: 1,
            columns: 0,
            quantize_level: 0.0,
        }
    }
}

/// Scaling/quantization sub-section of one plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingSettings {
    pub algorithm: String,
    pub bitpix: i64,
    #[serde(rename = "maskPlanes")]
    pub mask_planes: Vec<String>,
    pub seed: i64,
    #[serde(rename = "quantizeLevel")]
    pub quantize_level: f64,
    #[serde(rename = "quantizePad")]
    pub quantize_pad: f64,
    pub fuzz: bool,
    pub bscale: f64,
    pub bzero: f64,
}

impl Default for ScalingSettings {
    fn default() -> Self {
        Self {
            algorithm: "NONE".to_string(),
            bitpix: 0,
            mask_planes: vec!["NO_DATA".to_string()],
            seed: 0,
            quantize_level: 4.0,
            quantize_pad: 5.0,
            fuzz: true,
            bscale: 1.0,
            bzero: 0.0,
        }
    }
}

/// Fully populated settings for one plane.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PlaneRecipe {
    pub compression: CompressionSettings,
    pub scaling: ScalingSettings,
}

/// A normalized recipe: every plane, sub-section and field populated.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Recipe {
    pub image: PlaneRecipe,
    pub mask: PlaneRecipe,
    pub variance: PlaneRecipe,
}

impl Recipe {
    pub fn plane(&self, name: &str) -> Option<&PlaneRecipe> {
        match name {
            "image" => Some(&self.image),
            "mask" => Some(&self.mask),
            "variance" => Some(&self.variance),
            _ => None,
        }
    }

    fn plane_mut(&mut self, name: &str) -> &mut PlaneRecipe {
        match name {
            "image" => &mut self.image,
            "mask" => &mut self.mask,
            "variance" => &mut self.variance,
            _ => unreachable!("plane names are fixed"),
        }
    }
}

/// Named, normalized recipes.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecipeSet(pub BTreeMap<String, Recipe>);

impl RecipeSet {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Recipe> {
        self.0.get(name)
    }
}

/// Ordered key/value pairs identifying one dataset.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DatasetIdentity {
    pairs: Vec<(String, String)>,
}

impl DatasetIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one key/value pair; order is significant.
    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.pairs.push((key.into(), value.into()));
    }

    /// Derive a reproducible seed from the identity.
    ///
    /// Pure function of the ordered key/value pairs: SHA-256 over the pairs,
    /// first four digest bytes reduced into a non-negative signed 31-bit
    /// integer.
    pub fn derive_seed(&self) -> i64 {
        let mut hasher = Sha256::new();
        for (key, value) in &self.pairs {
            hasher.update(key.as_bytes());
            hasher.update([0u8]);
            hasher.update(value.as_bytes());
            hasher.update([0u8]);
        }
        let digest = hasher.finalize();
        let word = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
        i64::from(word & 0x7fff_ffff)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for DatasetIdentity {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            pairs: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

fn check_unrecognized<'a, I>(keys: I, allowed: &[&str], location: &str) -> Result<(), RecipeError>
where
    I: Iterator<Item = &'a String>,
{
    let unrecognized: Vec<&str> = keys
        .map(|k| k.as_str())
        .filter(|k| !allowed.contains(k))
        .collect();
    if unrecognized.is_empty() {
        Ok(())
    } else {
        Err(RecipeError::UnrecognizedKeys {
            location: location.to_string(),
            keys: unrecognized.join(", "),
        })
    }
}

fn as_mapping<'a>(
    value: &'a Value,
    location: &str,
) -> Result<&'a serde_json::Map<String, Value>, RecipeError> {
    value.as_object().ok_or_else(|| RecipeError::NotAMapping {
        location: location.to_string(),
    })
}

fn type_name(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(_) => "bool".to_string(),
        Value::Number(_) => "number".to_string(),
        Value::String(_) => "string".to_string(),
        Value::Array(_) => "array".to_string(),
        Value::Object(_) => "mapping".to_string(),
    }
}

fn coerce_string(value: &Value, location: &str) -> Result<String, RecipeError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(RecipeError::InvalidValue {
            location: location.to_string(),
            expected: "a string",
            found: type_name(other),
        }),
    }
}

fn coerce_i64(value: &Value, location: &str) -> Result<i64, RecipeError> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .ok_or_else(|| RecipeError::InvalidValue {
                location: location.to_string(),
                expected: "an integer",
                found: n.to_string(),
            }),
        Value::Bool(b) => Ok(i64::from(*b)),
        Value::String(s) => s.parse::<i64>().map_err(|_| RecipeError::InvalidValue {
            location: location.to_string(),
            expected: "an integer",
            found: s.clone(),
        }),
        other => Err(RecipeError::InvalidValue {
            location: location.to_string(),
            expected: "an integer",
            found: type_name(other),
        }),
    }
}

fn coerce_f64(value: &Value, location: &str) -> Result<f64, RecipeError> {
    match value {
        Value::Number(n) => n.as_f64().ok_or_else(|| RecipeError::InvalidValue {
            location: location.to_string(),
            expected: "a number",
            found: n.to_string(),
        }),
        Value::Bool(b) => Ok(f64::from(u8::from(*b))),
        Value::String(s) => s.parse::<f64>().map_err(|_| RecipeError::InvalidValue {
            location: location.to_string(),
            expected: "a number",
            found: s.clone(),
        }),
        other => Err(RecipeError::InvalidValue {
            location: location.to_string(),
            expected: "a number",
            found: type_name(other),
        }),
    }
}

fn coerce_bool(value: &Value, location: &str) -> Result<bool, RecipeError> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::Number(n) => Ok(n.as_f64().unwrap_or(0.0) != 0.0),
        other => Err(RecipeError::InvalidValue {
            location: location.to_string(),
            expected: "a boolean",
            found: type_name(other),
        }),
    }
}

fn coerce_string_list(value: &Value, location: &str) -> Result<Vec<String>, RecipeError> {
    match value {
        Value::Array(items) => items
            .iter()
            .map(|item| coerce_string(item, location))
            .collect(),
        other => Err(RecipeError::InvalidValue {
            location: location.to_string(),
            expected: "a list of strings",
            found: type_name(other),
        }),
    }
}

const COMPRESSION_FIELDS: [&str; 4] = ["algorithm", "rows", "columns", "quantizeLevel"];
const SCALING_FIELDS: [&str; 9] = [
    "algorithm",
    "bitpix",
    "maskPlanes",
    "seed",
    "quantizeLevel",
    "quantizePad",
    "fuzz",
    "bscale",
    "bzero",
];

fn validate_compression(
    raw: Option<&Value>,
    location: &str,
) -> Result<CompressionSettings, RecipeError> {
    let mut settings = CompressionSettings::default();
    let Some(raw) = raw else {
        return Ok(settings);
    };
    let entry = as_mapping(raw, location)?;
    check_unrecognized(entry.keys(), &COMPRESSION_FIELDS, location)?;

    if let Some(v) = entry.get("algorithm") {
        settings.algorithm = coerce_string(v, location)?;
    }
    if let Some(v) = entry.get("rows") {
        settings.rows = coerce_i64(v, location)?;
    }
    if let Some(v) = entry.get("columns") {
        settings.columns = coerce_i64(v, location)?;
    }
    if let Some(v) = entry.get("quantizeLevel") {
        settings.quantize_level = coerce_f64(v, location)?;
    }
    Ok(settings)
}

fn validate_scaling(raw: Option<&Value>, location: &str) -> Result<ScalingSettings, RecipeError> {
    let mut settings = ScalingSettings::default();
    let Some(raw) = raw else {
        return Ok(settings);
    };
    let entry = as_mapping(raw, location)?;
    check_unrecognized(entry.keys(), &SCALING_FIELDS, location)?;

    if let Some(v) = entry.get("algorithm") {
        settings.algorithm = coerce_string(v, location)?;
    }
    if let Some(v) = entry.get("bitpix") {
        settings.bitpix = coerce_i64(v, location)?;
    }
    if let Some(v) = entry.get("maskPlanes") {
        settings.mask_planes = coerce_string_list(v, location)?;
    }
    if let Some(v) = entry.get("seed") {
        settings.seed = coerce_i64(v, location)?;
    }
    if let Some(v) = entry.get("quantizeLevel") {
        settings.quantize_level = coerce_f64(v, location)?;
    }
    if let Some(v) = entry.get("quantizePad") {
        settings.quantize_pad = coerce_f64(v, location)?;
    }
    if let Some(v) = entry.get("fuzz") {
        settings.fuzz = coerce_bool(v, location)?;
    }
    if let Some(v) = entry.get("bscale") {
        settings.bscale = coerce_f64(v, location)?;
    }
    if let Some(v) = entry.get("bzero") {
        settings.bzero = coerce_f64(v, location)?;
    }
    Ok(settings)
}

/// Validate raw recipes against the fixed schema.
///
/// `None` and an empty mapping are identity operations (no recipes
/// configured is valid). Unknown keys at any nesting level (plane,
/// sub-section, field) are fatal; omitted keys receive their documented
/// defaults; present values are coerced to the declared type. Applying this
/// function to its own (re-serialized) output is idempotent.
pub fn validate_recipes(
    raw: Option<&serde_json::Map<String, Value>>,
) -> Result<RecipeSet, RecipeError> {
    let Some(raw) = raw else {
        return Ok(RecipeSet::default());
    };

    let mut validated = RecipeSet::default();
    for (name, value) in raw {
        let entry = as_mapping(value, name)?;
        check_unrecognized(entry.keys(), &PLANES, name)?;

        let mut recipe = Recipe::default();
        for plane in PLANES {
            let location = format!("{name}->{plane}");
            // A missing plane is fully populated from defaults.
            let Some(plane_value) = entry.get(plane) else {
                continue;
            };
            let plane_entry = as_mapping(plane_value, &location)?;
            check_unrecognized(plane_entry.keys(), &SECTIONS, &location)?;

            let target = recipe.plane_mut(plane);
            target.compression = validate_compression(
                plane_entry.get("compression"),
                &format!("{location}->compression"),
            )?;
            target.scaling = validate_scaling(
                plane_entry.get("scaling"),
                &format!("{location}->scaling"),
            )?;
        }
        validated.0.insert(name.clone(), recipe);
    }
    Ok(validated)
}

/// Select and finalize the recipe to use for one write.
///
/// With no requested name and no recipe named "default", returns `None`
/// (write uncompressed). A requested name absent from the set is fatal.
/// Otherwise the recipe is cloned and every plane whose scaling seed is the
/// sentinel 0 gets a seed derived from the dataset identity.
pub fn resolve_recipe(
    requested: Option<&str>,
    identity: &DatasetIdentity,
    recipes: &RecipeSet,
) -> Result<Option<Recipe>, RecipeError> {
    let name = match requested {
        Some(name) => name,
        None => {
            if recipes.get("default").is_none() {
                return Ok(None);
            }
            "default"
        }
    };

    let recipe = recipes.get(name).ok_or_else(|| RecipeError::UnknownRecipe {
        name: name.to_string(),
    })?;

    let mut resolved = recipe.clone();
    let seed = identity.derive_seed();
    for plane in PLANES {
        let scaling = &mut resolved.plane_mut(plane).scaling;
        if scaling.seed == 0 {
            scaling.seed = seed;
        }
    }
    Ok(Some(resolved))
}

//! FITS-backed exposure codec.
//!
//! Stores a three-plane exposure (image, mask, variance) as one image HDU
//! per plane with the header cards on the primary HDU. This is the concrete
//! [`ExposureCodec`] the formatter ships with; alternative codecs only need
//! to implement the trait.
//!
//! When a compression recipe is in effect, the resolved per-plane plan is
//! recorded as header cards on each plane HDU so a reader can see exactly
//! what was requested.

use crate::formatter::{Component, ExposureCodec, FormatError, ReadParameters};
use crate::recipes::{PlaneRecipe, Recipe};
use fitsio::hdu::{FitsHdu, HduInfo};
use fitsio::images::{ImageDescription, ImageType};
use fitsio::FitsFile;
use ndarray::{s, Array2};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Header cards parsed into the `wcs` component.
const WCS_CARDS: [&str; 14] = [
    "CTYPE1", "CTYPE2", "CRPIX1", "CRPIX2", "CRVAL1", "CRVAL2", "CD1_1", "CD1_2", "CD2_1",
    "CD2_2", "CUNIT1", "CUNIT2", "RADESYS", "EQUINOX",
];

/// Header cards parsed into the `bbox`/`xy0` components.
const BBOX_CARDS: [&str; 2] = ["LTV1", "LTV2"];

/// A single header card value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CardValue {
    Int(i64),
    Float(f64),
    Logical(bool),
    Text(String),
}

/// Ordered FITS-like header metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeaderMetadata {
    cards: Vec<(String, CardValue)>,
}

impl HeaderMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a card, replacing an existing one with the same key.
    pub fn set(&mut self, key: impl Into<String>, value: CardValue) {
        let key = key.into();
        if let Some(card) = self.cards.iter_mut().find(|(k, _)| *k == key) {
            card.1 = value;
        } else {
            self.cards.push((key, value));
        }
    }

    pub fn get(&self, key: &str) -> Option<&CardValue> {
        self.cards.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.get(key) {
            Some(CardValue::Text(s)) => Some(s),
            _ => None,
        }
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        match self.get(key) {
            Some(CardValue::Int(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        match self.get(key) {
            Some(CardValue::Float(v)) => Some(*v),
            Some(CardValue::Int(v)) => Some(*v as f64),
            _ => None,
        }
    }

    /// Remove a card; returns whether it was present.
    pub fn remove(&mut self, key: &str) -> bool {
        let before = self.cards.len();
        self.cards.retain(|(k, _)| k != key);
        self.cards.len() != before
    }

    /// Remove cards that are exposed as their own components (WCS and
    /// bounding-box families), so a metadata read does not double-report
    /// them.
    pub fn strip_component_cards(&mut self) {
        for key in WCS_CARDS.iter().chain(BBOX_CARDS.iter()) {
            self.remove(key);
        }
    }

    /// Cards belonging to the `wcs` component.
    pub fn wcs_cards(&self) -> HeaderMetadata {
        HeaderMetadata {
            cards: self
                .cards
                .iter()
                .filter(|(k, _)| WCS_CARDS.contains(&k.as_str()))
                .cloned()
                .collect(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, CardValue)> {
        self.cards.iter()
    }

    pub fn len(&self) -> usize {
        self.cards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }
}

/// Observation bookkeeping extracted as the `visitInfo` component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisitInfo {
    pub exposure_time: f64,
    pub observation_id: String,
}

/// Three-plane in-memory exposure.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaneStack {
    pub image: Array2<f32>,
    pub mask: Array2<i32>,
    pub variance: Array2<f32>,
    pub header: HeaderMetadata,
}

impl PlaneStack {
    /// Build a stack; all three planes must share one shape.
    pub fn new(
        image: Array2<f32>,
        mask: Array2<i32>,
        variance: Array2<f32>,
    ) -> Result<Self, FormatError> {
        if image.dim() != mask.dim() || image.dim() != variance.dim() {
            return Err(FormatError::InvalidShape {
                detail: format!(
                    "plane shapes differ: image {:?}, mask {:?}, variance {:?}",
                    image.dim(),
                    mask.dim(),
                    variance.dim()
                ),
            });
        }
        Ok(Self {
            image,
            mask,
            variance,
            header: HeaderMetadata::new(),
        })
    }

    pub fn with_header(mut self, header: HeaderMetadata) -> Self {
        self.header = header;
        self
    }

    /// (height, width) of the planes.
    pub fn dim(&self) -> (usize, usize) {
        self.image.dim()
    }
}

/// A single extracted component, as produced by [`FitsPlaneCodec`].
#[derive(Debug, Clone, PartialEq)]
pub enum ComponentValue {
    Image(Array2<f32>),
    Mask(Array2<i32>),
    Variance(Array2<f32>),
    /// `[x0, y0, width, height]`.
    Bbox([i64; 4]),
    Xy0((i64, i64)),
    Wcs(HeaderMetadata),
    Filter(String),
    VisitInfo(VisitInfo),
    Detector(i64),
    Metadata(HeaderMetadata),
}

/// Header cards the codec reads back, with their declared types.
enum CardKind {
    Int,
    Float,
    Text,
}

const KNOWN_CARDS: [(&str, CardKind); 23] = [
    ("INSTRUME", CardKind::Text),
    ("DETECTOR", CardKind::Int),
    ("OBSTYPE", CardKind::Text),
    ("FILTER", CardKind::Text),
    ("OBSID", CardKind::Text),
    ("DATE-OBS", CardKind::Text),
    ("EXPTIME", CardKind::Float),
    ("LTV1", CardKind::Int),
    ("LTV2", CardKind::Int),
    ("CTYPE1", CardKind::Text),
    ("CTYPE2", CardKind::Text),
    ("CUNIT1", CardKind::Text),
    ("CUNIT2", CardKind::Text),
    ("RADESYS", CardKind::Text),
    ("EQUINOX", CardKind::Float),
    ("CRPIX1", CardKind::Float),
    ("CRPIX2", CardKind::Float),
    ("CRVAL1", CardKind::Float),
    ("CRVAL2", CardKind::Float),
    ("CD1_1", CardKind::Float),
    ("CD1_2", CardKind::Float),
    ("CD2_1", CardKind::Float),
    ("CD2_2", CardKind::Float),
];

/// Optional `bbox` parameter: `[x0, y0, width, height]`.
fn bbox_from_parameters(
    parameters: &ReadParameters,
) -> Result<Option<(usize, usize, usize, usize)>, FormatError> {
    let Some(value) = parameters.get("bbox") else {
        return Ok(None);
    };
    let items = value
        .as_array()
        .filter(|a| a.len() == 4)
        .ok_or_else(|| FormatError::BadParameter {
            name: "bbox".to_string(),
            detail: "expected [x0, y0, width, height]".to_string(),
        })?;
    let mut fields = [0usize; 4];
    for (slot, item) in fields.iter_mut().zip(items) {
        *slot = item
            .as_u64()
            .and_then(|v| usize::try_from(v).ok())
            .ok_or_else(|| FormatError::BadParameter {
                name: "bbox".to_string(),
                detail: format!("expected a non-negative integer, got {item}"),
            })?;
    }
    Ok(Some((fields[0], fields[1], fields[2], fields[3])))
}

fn slice_plane<T: Clone>(
    plane: &Array2<T>,
    bbox: Option<(usize, usize, usize, usize)>,
) -> Result<Array2<T>, FormatError> {
    let Some((x0, y0, width, height)) = bbox else {
        return Ok(plane.clone());
    };
    let (rows, cols) = plane.dim();
    let within = x0.checked_add(width).is_some_and(|x| x <= cols)
        && y0.checked_add(height).is_some_and(|y| y <= rows);
    if !within {
        return Err(FormatError::BadParameter {
            name: "bbox".to_string(),
            detail: format!(
                "[{x0}, {y0}, {width}, {height}] exceeds plane shape {rows}x{cols}"
            ),
        });
    }
    Ok(plane.slice(s![y0..y0 + height, x0..x0 + width]).to_owned())
}

/// FITS codec over three plane HDUs (`IMAGE`, `MASK`, `VARIANCE`).
pub struct FitsPlaneCodec {
    fptr: FitsFile,
}

impl FitsPlaneCodec {
    fn plane_shape(&mut self, name: &str) -> Result<(usize, usize), FormatError> {
        let hdu = self.hdu(name)?;
        match &hdu.info {
            HduInfo::ImageInfo { shape, .. } if shape.len() == 2 => Ok((shape[0], shape[1])),
            _ => Err(FormatError::InvalidShape {
                detail: format!("HDU '{name}' is not a 2-dimensional image"),
            }),
        }
    }

    fn hdu(&mut self, name: &str) -> Result<FitsHdu, FormatError> {
        self.fptr.hdu(name).map_err(|_| FormatError::MissingHdu {
            name: name.to_string(),
        })
    }

    fn read_plane_f32(&mut self, name: &str) -> Result<Array2<f32>, FormatError> {
        let shape = self.plane_shape(name)?;
        let hdu = self.hdu(name)?;
        let data: Vec<f32> = hdu.read_image(&mut self.fptr)?;
        Array2::from_shape_vec(shape, data).map_err(|e| FormatError::InvalidShape {
            detail: e.to_string(),
        })
    }

    fn read_plane_i32(&mut self, name: &str) -> Result<Array2<i32>, FormatError> {
        let shape = self.plane_shape(name)?;
        let hdu = self.hdu(name)?;
        let data: Vec<i32> = hdu.read_image(&mut self.fptr)?;
        Array2::from_shape_vec(shape, data).map_err(|e| FormatError::InvalidShape {
            detail: e.to_string(),
        })
    }

    fn require_str(header: &HeaderMetadata, key: &'static str) -> Result<String, FormatError> {
        header
            .get_str(key)
            .map(|s| s.to_string())
            .ok_or(FormatError::MissingCard { key })
    }

    fn write_planes(
        exposure: &PlaneStack,
        path: &Path,
        recipe: Option<&Recipe>,
    ) -> Result<(), FormatError> {
        let mut fptr = FitsFile::create(path).overwrite().open()?;

        let primary = fptr.primary_hdu()?;
        for (key, value) in exposure.header.iter() {
            write_card(&mut fptr, &primary, key, value)?;
        }

        let (height, width) = exposure.dim();
        let dimensions = [height, width];

        let planes: [(&str, ImageType); 3] = [
            ("IMAGE", ImageType::Float),
            ("MASK", ImageType::Long),
            ("VARIANCE", ImageType::Float),
        ];
        for (name, data_type) in planes {
            let description = ImageDescription {
                data_type,
                dimensions: &dimensions,
            };
            let hdu = fptr.create_image(name, &description)?;
            match name {
                "IMAGE" => {
                    let flat: Vec<f32> = exposure.image.iter().copied().collect();
                    hdu.write_image(&mut fptr, &flat)?;
                }
                "MASK" => {
                    let flat: Vec<i32> = exposure.mask.iter().copied().collect();
                    hdu.write_image(&mut fptr, &flat)?;
                }
                _ => {
                    let flat: Vec<f32> = exposure.variance.iter().copied().collect();
                    hdu.write_image(&mut fptr, &flat)?;
                }
            }
            if let Some(recipe) = recipe {
                let plane_recipe = match name {
                    "IMAGE" => &recipe.image,
                    "MASK" => &recipe.mask,
                    _ => &recipe.variance,
                };
                write_recipe_cards(&mut fptr, &hdu, plane_recipe)?;
            }
        }
        Ok(())
    }
}

fn write_card(
    fptr: &mut FitsFile,
    hdu: &FitsHdu,
    key: &str,
    value: &CardValue,
) -> Result<(), FormatError> {
    match value {
        CardValue::Int(v) => hdu.write_key(fptr, key, *v)?,
        CardValue::Float(v) => hdu.write_key(fptr, key, *v)?,
        // Logical cards are stored as 0/1 integers.
        CardValue::Logical(v) => hdu.write_key(fptr, key, i64::from(*v))?,
        CardValue::Text(v) => hdu.write_key(fptr, key, v.clone())?,
    }
    Ok(())
}

/// Record the resolved compression plan on a plane HDU.
fn write_recipe_cards(
    fptr: &mut FitsFile,
    hdu: &FitsHdu,
    plane: &PlaneRecipe,
) -> Result<(), FormatError> {
    hdu.write_key(fptr, "ZCMPTYPE", plane.compression.algorithm.clone())?;
    hdu.write_key(fptr, "ZTILE1", plane.compression.columns)?;
    hdu.write_key(fptr, "ZTILE2", plane.compression.rows)?;
    hdu.write_key(fptr, "ZQLEVEL", plane.compression.quantize_level)?;
    hdu.write_key(fptr, "ZSCALG", plane.scaling.algorithm.clone())?;
    hdu.write_key(fptr, "ZBITPIX", plane.scaling.bitpix)?;
    hdu.write_key(fptr, "ZSEED", plane.scaling.seed)?;
    hdu.write_key(fptr, "ZFUZZ", i64::from(plane.scaling.fuzz))?;
    hdu.write_key(fptr, "ZQPAD", plane.scaling.quantize_pad)?;
    hdu.write_key(fptr, "ZBSCALE", plane.scaling.bscale)?;
    hdu.write_key(fptr, "ZBZERO", plane.scaling.bzero)?;
    Ok(())
}

impl ExposureCodec for FitsPlaneCodec {
    type Exposure = PlaneStack;
    type ComponentValue = ComponentValue;

    fn construct_direct(
        path: &Path,
        parameters: &ReadParameters,
    ) -> Result<Option<PlaneStack>, FormatError> {
        // Direct construction takes only a path; slicing parameters force
        // the fallback through the generic reader.
        if !parameters.is_empty() {
            return Ok(None);
        }
        let mut codec = Self::open(path)?;
        codec.read_full(&ReadParameters::new()).map(Some)
    }

    fn open(path: &Path) -> Result<Self, FormatError> {
        Ok(Self {
            fptr: FitsFile::open(path)?,
        })
    }

    fn read_full(&mut self, parameters: &ReadParameters) -> Result<PlaneStack, FormatError> {
        let bbox = bbox_from_parameters(parameters)?;
        let image = slice_plane(&self.read_plane_f32("IMAGE")?, bbox)?;
        let mask = slice_plane(&self.read_plane_i32("MASK")?, bbox)?;
        let variance = slice_plane(&self.read_plane_f32("VARIANCE")?, bbox)?;
        let header = self.read_metadata()?;
        Ok(PlaneStack::new(image, mask, variance)?.with_header(header))
    }

    fn read_component(
        &mut self,
        component: Component,
        parameters: &ReadParameters,
    ) -> Result<ComponentValue, FormatError> {
        let bbox = bbox_from_parameters(parameters)?;
        match component {
            Component::Image => Ok(ComponentValue::Image(slice_plane(
                &self.read_plane_f32("IMAGE")?,
                bbox,
            )?)),
            Component::Mask => Ok(ComponentValue::Mask(slice_plane(
                &self.read_plane_i32("MASK")?,
                bbox,
            )?)),
            Component::Variance => Ok(ComponentValue::Variance(slice_plane(
                &self.read_plane_f32("VARIANCE")?,
                bbox,
            )?)),
            Component::Bbox => {
                let (rows, cols) = self.plane_shape("IMAGE")?;
                let value = match bbox {
                    Some((x0, y0, width, height)) => {
                        [x0 as i64, y0 as i64, width as i64, height as i64]
                    }
                    None => [0, 0, cols as i64, rows as i64],
                };
                Ok(ComponentValue::Bbox(value))
            }
            Component::Xy0 => {
                let header = self.read_metadata()?;
                Ok(ComponentValue::Xy0((
                    header.get_i64("LTV1").unwrap_or(0),
                    header.get_i64("LTV2").unwrap_or(0),
                )))
            }
            Component::Wcs => {
                let header = self.read_metadata()?;
                Ok(ComponentValue::Wcs(header.wcs_cards()))
            }
            Component::Filter => {
                let header = self.read_metadata()?;
                Ok(ComponentValue::Filter(Self::require_str(
                    &header, "FILTER",
                )?))
            }
            Component::VisitInfo => {
                let header = self.read_metadata()?;
                let exposure_time = header
                    .get_f64("EXPTIME")
                    .ok_or(FormatError::MissingCard { key: "EXPTIME" })?;
                let observation_id = Self::require_str(&header, "OBSID")?;
                Ok(ComponentValue::VisitInfo(VisitInfo {
                    exposure_time,
                    observation_id,
                }))
            }
            Component::Detector => {
                let header = self.read_metadata()?;
                Ok(ComponentValue::Detector(
                    header
                        .get_i64("DETECTOR")
                        .ok_or(FormatError::MissingCard { key: "DETECTOR" })?,
                ))
            }
            Component::Metadata => Ok(ComponentValue::Metadata(self.read_metadata()?)),
        }
    }

    fn read_metadata(&mut self) -> Result<HeaderMetadata, FormatError> {
        let primary = self.fptr.primary_hdu()?;
        let mut header = HeaderMetadata::new();
        for (key, kind) in KNOWN_CARDS {
            match kind {
                CardKind::Int => {
                    if let Ok(v) = primary.read_key::<i64>(&mut self.fptr, key) {
                        header.set(key, CardValue::Int(v));
                    }
                }
                CardKind::Float => {
                    if let Ok(v) = primary.read_key::<f64>(&mut self.fptr, key) {
                        header.set(key, CardValue::Float(v));
                    }
                }
                CardKind::Text => {
                    if let Ok(v) = primary.read_key::<String>(&mut self.fptr, key) {
                        header.set(key, CardValue::Text(v));
                    }
                }
            }
        }
        Ok(header)
    }

    fn write(exposure: &PlaneStack, path: &Path) -> Result<(), FormatError> {
        Self::write_planes(exposure, path, None)
    }

    fn write_with_options(
        exposure: &PlaneStack,
        path: &Path,
        recipe: &Recipe,
    ) -> Result<(), FormatError> {
        Self::write_planes(exposure, path, Some(recipe))
    }
}

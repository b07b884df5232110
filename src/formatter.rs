//! Component-addressable exposure formatter.
//!
//! The formatter sits between a dataset store and an exposure codec. A
//! [`FileDescriptor`] names the target file, the storage class the file was
//! written as and the storage class the caller wants to read as; when the
//! two differ, the caller must name a single component to extract. The
//! component table is a closed, finite mapping from component names to
//! loader operations, and anything outside it is rejected.
//!
//! Writing resolves a named compression recipe (see [`crate::recipes`]) and
//! routes to the codec's options-aware or plain write entry point.

use crate::fits::HeaderMetadata;
use crate::recipes::{resolve_recipe, DatasetIdentity, Recipe, RecipeError, RecipeSet};
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

/// File extension the formatter writes.
const EXTENSION: &str = "fits";

/// Slicing/selection parameters, as uncoerced values from the caller.
pub type ReadParameters = BTreeMap<String, serde_json::Value>;

/// Errors raised by the formatter and its codecs.
#[derive(Error, Debug)]
pub enum FormatError {
    #[error("unknown component requested: {name}")]
    UnknownComponent { name: String },
    #[error("storage class inconsistency ({read} vs {stored}) but no component requested")]
    StorageClassMismatch { read: String, stored: String },
    #[error("storage class {class} does not accept parameters: {keys}")]
    UnsupportedParameters { class: String, keys: String },
    #[error("unsupported write parameters: {keys}; only 'recipe' is recognized")]
    UnsupportedWriteParameters { keys: String },
    #[error("bad value for parameter '{name}': {detail}")]
    BadParameter { name: String, detail: String },
    #[error(transparent)]
    Recipe(#[from] RecipeError),
    #[error("FITS I/O error: {0}")]
    Fits(#[from] fitsio::errors::Error),
    #[error("HDU not found: {name}")]
    MissingHdu { name: String },
    #[error("required header card not found: {key}")]
    MissingCard { key: &'static str },
    #[error("invalid image shape: {detail}")]
    InvalidShape { detail: String },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Storage class: a type name plus the parameter keys it accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageClass {
    pub name: String,
    parameters: Vec<String>,
}

impl StorageClass {
    pub fn new(name: impl Into<String>, parameters: &[&str]) -> Self {
        Self {
            name: name.into(),
            parameters: parameters.iter().map(|p| p.to_string()).collect(),
        }
    }

    /// Reject parameters outside the declared schema.
    pub fn validate_parameters(&self, parameters: &ReadParameters) -> Result<(), FormatError> {
        let unsupported: Vec<&str> = parameters
            .keys()
            .map(|k| k.as_str())
            .filter(|k| !self.parameters.iter().any(|p| p == k))
            .collect();
        if unsupported.is_empty() {
            Ok(())
        } else {
            Err(FormatError::UnsupportedParameters {
                class: self.name.clone(),
                keys: unsupported.join(", "),
            })
        }
    }
}

/// Location of a dataset inside a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    store_root: PathBuf,
    relative: PathBuf,
}

impl Location {
    pub fn new(store_root: impl Into<PathBuf>, relative: impl Into<PathBuf>) -> Self {
        Self {
            store_root: store_root.into(),
            relative: relative.into(),
        }
    }

    /// Absolute path of the dataset.
    pub fn path(&self) -> PathBuf {
        self.store_root.join(&self.relative)
    }

    /// Path relative to the store root.
    pub fn path_in_store(&self) -> &Path {
        &self.relative
    }

    fn update_extension(&mut self, extension: &str) {
        self.relative.set_extension(extension);
    }
}

/// Everything the formatter needs to know about one target file.
#[derive(Debug, Clone)]
pub struct FileDescriptor {
    pub location: Location,
    /// Storage class the file was written as.
    pub storage_class: StorageClass,
    /// Storage class the caller wants to read as.
    pub read_storage_class: StorageClass,
    /// Default slicing parameters, overridable per read call.
    pub parameters: Option<ReadParameters>,
}

/// The closed set of components an exposure file exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    Image,
    Mask,
    Variance,
    Bbox,
    Xy0,
    Wcs,
    Filter,
    VisitInfo,
    Detector,
    Metadata,
}

impl Component {
    /// The component table: name, variant, accepts slicing parameters.
    const TABLE: [(&'static str, Component, bool); 10] = [
        ("image", Component::Image, true),
        ("mask", Component::Mask, true),
        ("variance", Component::Variance, true),
        ("bbox", Component::Bbox, true),
        ("xy0", Component::Xy0, true),
        ("wcs", Component::Wcs, false),
        ("filter", Component::Filter, false),
        ("visitInfo", Component::VisitInfo, false),
        ("detector", Component::Detector, false),
        ("metadata", Component::Metadata, false),
    ];

    pub fn from_name(name: &str) -> Result<Self, FormatError> {
        Self::TABLE
            .iter()
            .find(|(n, _, _)| *n == name)
            .map(|(_, c, _)| *c)
            .ok_or_else(|| FormatError::UnknownComponent {
                name: name.to_string(),
            })
    }

    pub fn name(&self) -> &'static str {
        Self::TABLE
            .iter()
            .find(|(_, c, _)| c == self)
            .map(|(n, _, _)| *n)
            .unwrap_or("")
    }

    /// Whether the loader operation accepts slicing parameters.
    pub fn accepts_parameters(&self) -> bool {
        Self::TABLE
            .iter()
            .find(|(_, c, _)| c == self)
            .map(|(_, _, p)| *p)
            .unwrap_or(false)
    }
}

/// Write-time options; the only recognized option is the recipe name.
#[derive(Debug, Clone, Default)]
pub struct WriteParameters {
    pub recipe: Option<String>,
}

impl WriteParameters {
    /// Build from a raw option map, rejecting anything but `recipe`.
    pub fn from_map(map: &BTreeMap<String, String>) -> Result<Self, FormatError> {
        let unsupported: Vec<&str> = map
            .keys()
            .map(|k| k.as_str())
            .filter(|k| *k != "recipe")
            .collect();
        if !unsupported.is_empty() {
            return Err(FormatError::UnsupportedWriteParameters {
                keys: unsupported.join(", "),
            });
        }
        Ok(Self {
            recipe: map.get("recipe").cloned(),
        })
    }
}

/// The codec seam: how exposures are actually read and written.
pub trait ExposureCodec: Sized {
    /// The whole in-memory object.
    type Exposure;
    /// A single extracted component.
    type ComponentValue;

    /// Attempt the target type's direct path-based construction.
    ///
    /// Returns `Ok(None)` when direct construction is not applicable for
    /// the given parameters, in which case the formatter falls back to
    /// [`ExposureCodec::read_full`].
    fn construct_direct(
        path: &Path,
        parameters: &ReadParameters,
    ) -> Result<Option<Self::Exposure>, FormatError>;

    fn open(path: &Path) -> Result<Self, FormatError>;

    fn read_full(&mut self, parameters: &ReadParameters) -> Result<Self::Exposure, FormatError>;

    fn read_component(
        &mut self,
        component: Component,
        parameters: &ReadParameters,
    ) -> Result<Self::ComponentValue, FormatError>;

    fn read_metadata(&mut self) -> Result<HeaderMetadata, FormatError>;

    fn write(exposure: &Self::Exposure, path: &Path) -> Result<(), FormatError>;

    fn write_with_options(
        exposure: &Self::Exposure,
        path: &Path,
        recipe: &Recipe,
    ) -> Result<(), FormatError>;
}

/// What a read produced, depending on what was asked for.
#[derive(Debug)]
pub enum ReadProduct<C: ExposureCodec> {
    Full(C::Exposure),
    Component(C::ComponentValue),
    Metadata(HeaderMetadata),
}

/// Formatter for exposures stored in FITS files.
pub struct ExposureFormatter<C: ExposureCodec> {
    descriptor: FileDescriptor,
    write_recipes: RecipeSet,
    write_parameters: WriteParameters,
    data_id: DatasetIdentity,
    /// Lazily loaded header metadata; never invalidated within an instance.
    metadata: Option<HeaderMetadata>,
    _codec: PhantomData<C>,
}

impl<C: ExposureCodec> ExposureFormatter<C> {
    pub fn new(
        descriptor: FileDescriptor,
        write_recipes: RecipeSet,
        write_parameters: WriteParameters,
        data_id: DatasetIdentity,
    ) -> Self {
        Self {
            descriptor,
            write_recipes,
            write_parameters,
            data_id,
            metadata: None,
            _codec: PhantomData,
        }
    }

    pub fn descriptor(&self) -> &FileDescriptor {
        &self.descriptor
    }

    /// Header metadata, loaded on first access.
    pub fn metadata(&mut self) -> Result<&HeaderMetadata, FormatError> {
        let metadata = match self.metadata.take() {
            Some(metadata) => metadata,
            None => {
                let mut codec = C::open(&self.descriptor.location.path())?;
                codec.read_metadata()?
            }
        };
        Ok(self.metadata.insert(metadata))
    }

    /// Metadata with entries that are exposed as their own components
    /// removed, so they are not double-read.
    fn stripped_metadata(&mut self) -> Result<HeaderMetadata, FormatError> {
        let mut metadata = self.metadata()?.clone();
        metadata.strip_component_cards();
        Ok(metadata)
    }

    fn resolve_parameters(&self, parameters: Option<&ReadParameters>) -> ReadParameters {
        parameters
            .or(self.descriptor.parameters.as_ref())
            .cloned()
            .unwrap_or_default()
    }

    /// Read the whole object or one named component.
    ///
    /// When the read storage class differs from the stored one, a component
    /// must be named; "metadata" returns the stripped header.
    pub fn read(
        &mut self,
        component: Option<&str>,
        parameters: Option<&ReadParameters>,
    ) -> Result<ReadProduct<C>, FormatError> {
        if self.descriptor.read_storage_class.name != self.descriptor.storage_class.name {
            return match component {
                Some("metadata") => Ok(ReadProduct::Metadata(self.stripped_metadata()?)),
                Some(name) => Ok(ReadProduct::Component(
                    self.read_component(name, parameters)?,
                )),
                None => Err(FormatError::StorageClassMismatch {
                    read: self.descriptor.read_storage_class.name.clone(),
                    stored: self.descriptor.storage_class.name.clone(),
                }),
            };
        }
        Ok(ReadProduct::Full(self.read_full(parameters)?))
    }

    /// Read a single component through the closed component table.
    pub fn read_component(
        &mut self,
        name: &str,
        parameters: Option<&ReadParameters>,
    ) -> Result<C::ComponentValue, FormatError> {
        let component = Component::from_name(name)?;
        let parameters = self.resolve_parameters(parameters);
        self.descriptor
            .storage_class
            .validate_parameters(&parameters)?;

        let effective = if component.accepts_parameters() {
            parameters
        } else {
            ReadParameters::new()
        };
        let mut codec = C::open(&self.descriptor.location.path())?;
        codec.read_component(component, &effective)
    }

    /// Read the full exposure.
    pub fn read_full(
        &mut self,
        parameters: Option<&ReadParameters>,
    ) -> Result<C::Exposure, FormatError> {
        let parameters = self.resolve_parameters(parameters);
        self.descriptor
            .storage_class
            .validate_parameters(&parameters)?;

        let path = self.descriptor.location.path();
        if let Some(exposure) = C::construct_direct(&path, &parameters)? {
            return Ok(exposure);
        }
        let mut codec = C::open(&path)?;
        codec.read_full(&parameters)
    }

    /// Write an exposure, applying the configured recipe if one resolves.
    ///
    /// Returns the path actually written, relative to the store root.
    pub fn write(&mut self, exposure: &C::Exposure) -> Result<PathBuf, FormatError> {
        self.descriptor.location.update_extension(EXTENSION);
        let path = self.descriptor.location.path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let recipe_name = self.write_parameters.recipe.clone();
        let recipe = self.image_compression_settings(recipe_name.as_deref())?;
        match &recipe {
            Some(recipe) => C::write_with_options(exposure, &path, recipe)?,
            None => C::write(exposure, &path)?,
        }
        info!(
            "wrote exposure to {} (recipe: {})",
            path.display(),
            recipe_name.as_deref().unwrap_or("none")
        );
        Ok(self.descriptor.location.path_in_store().to_path_buf())
    }

    /// Resolve the compression settings for a recipe name, substituting
    /// sentinel seeds from the dataset identity.
    pub fn image_compression_settings(
        &self,
        recipe_name: Option<&str>,
    ) -> Result<Option<Recipe>, FormatError> {
        Ok(resolve_recipe(recipe_name, &self.data_id, &self.write_recipes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fits::CardValue;
    use serde_json::json;
    use std::fs;

    /// Test codec backed by a plain text file; the "exposure" is the file
    /// content and a component read returns the component's name.
    #[derive(Debug)]
    struct TextCodec {
        path: PathBuf,
    }

    impl ExposureCodec for TextCodec {
        type Exposure = String;
        type ComponentValue = String;

        fn construct_direct(
            path: &Path,
            parameters: &ReadParameters,
        ) -> Result<Option<String>, FormatError> {
            // The direct constructor takes only a path; with parameters the
            // formatter must fall back to the generic reader.
            if parameters.is_empty() {
                Ok(Some(format!("direct:{}", fs::read_to_string(path)?)))
            } else {
                Ok(None)
            }
        }

        fn open(path: &Path) -> Result<Self, FormatError> {
            Ok(Self {
                path: path.to_path_buf(),
            })
        }

        fn read_full(&mut self, _parameters: &ReadParameters) -> Result<String, FormatError> {
            Ok(format!("full:{}", fs::read_to_string(&self.path)?))
        }

        fn read_component(
            &mut self,
            component: Component,
            parameters: &ReadParameters,
        ) -> Result<String, FormatError> {
            Ok(format!("{}:{}", component.name(), parameters.len()))
        }

        fn read_metadata(&mut self) -> Result<HeaderMetadata, FormatError> {
            let mut metadata = HeaderMetadata::new();
            metadata.set("INSTRUME", CardValue::Text("testcam".to_string()));
            metadata.set("CRVAL1", CardValue::Float(180.0));
            metadata.set("LTV1", CardValue::Int(0));
            Ok(metadata)
        }

        fn write(exposure: &String, path: &Path) -> Result<(), FormatError> {
            fs::write(path, format!("plain:{exposure}"))?;
            Ok(())
        }

        fn write_with_options(
            exposure: &String,
            path: &Path,
            recipe: &Recipe,
        ) -> Result<(), FormatError> {
            fs::write(
                path,
                format!("options:{}:{}", recipe.image.scaling.seed, exposure),
            )?;
            Ok(())
        }
    }

    fn descriptor(
        root: &Path,
        relative: &str,
        stored: &str,
        read: &str,
    ) -> FileDescriptor {
        FileDescriptor {
            location: Location::new(root, relative),
            storage_class: StorageClass::new(stored, &["bbox"]),
            read_storage_class: StorageClass::new(read, &["bbox"]),
            parameters: None,
        }
    }

    fn formatter(descriptor: FileDescriptor) -> ExposureFormatter<TextCodec> {
        ExposureFormatter::new(
            descriptor,
            RecipeSet::default(),
            WriteParameters::default(),
            DatasetIdentity::new(),
        )
    }

    #[test]
    fn test_component_table_is_closed() {
        assert!(Component::from_name("image").is_ok());
        assert!(Component::from_name("visitInfo").is_ok());

        let err = Component::from_name("psfMatchedWarp").unwrap_err();
        assert!(err.to_string().contains("psfMatchedWarp"));

        assert!(Component::Image.accepts_parameters());
        assert!(!Component::Wcs.accepts_parameters());
    }

    #[test]
    fn test_matching_classes_read_full() {
        let tmp = tempfile::TempDir::new().unwrap();
        fs::write(tmp.path().join("a.fits"), "payload").unwrap();

        let mut fmt = formatter(descriptor(tmp.path(), "a.fits", "Exposure", "Exposure"));
        let product = fmt.read(None, None).unwrap();
        let ReadProduct::Full(exposure) = product else {
            panic!("expected full read");
        };
        assert_eq!(exposure, "direct:payload");
    }

    #[test]
    fn test_read_full_falls_back_when_direct_does_not_apply() {
        let tmp = tempfile::TempDir::new().unwrap();
        fs::write(tmp.path().join("a.fits"), "payload").unwrap();

        let mut fmt = formatter(descriptor(tmp.path(), "a.fits", "Exposure", "Exposure"));
        let mut params = ReadParameters::new();
        params.insert("bbox".to_string(), json!([0, 0, 1, 1]));

        let exposure = fmt.read_full(Some(&params)).unwrap();
        assert_eq!(exposure, "full:payload");
    }

    #[test]
    fn test_mismatch_without_component_is_an_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut fmt = formatter(descriptor(tmp.path(), "a.fits", "Exposure", "ImageF"));

        let err = fmt.read(None, None).unwrap_err();
        let msg = err.to_string();
        assert!(matches!(err, FormatError::StorageClassMismatch { .. }));
        assert!(msg.contains("ImageF"), "{msg}");
        assert!(msg.contains("Exposure"), "{msg}");
    }

    #[test]
    fn test_component_read_dispatches_through_table() {
        let tmp = tempfile::TempDir::new().unwrap();
        fs::write(tmp.path().join("a.fits"), "x").unwrap();

        let mut fmt = formatter(descriptor(tmp.path(), "a.fits", "Exposure", "ImageF"));
        let mut params = ReadParameters::new();
        params.insert("bbox".to_string(), json!([0, 0, 2, 2]));

        let ReadProduct::Component(value) = fmt.read(Some("image"), Some(&params)).unwrap()
        else {
            panic!("expected component read");
        };
        assert_eq!(value, "image:1");

        // Components that do not accept parameters get an empty set.
        let ReadProduct::Component(value) = fmt.read(Some("wcs"), Some(&params)).unwrap()
        else {
            panic!("expected component read");
        };
        assert_eq!(value, "wcs:0");
    }

    #[test]
    fn test_unknown_component_is_rejected() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut fmt = formatter(descriptor(tmp.path(), "a.fits", "Exposure", "ImageF"));
        let err = fmt.read(Some("coaddInputs"), None).unwrap_err();
        assert!(matches!(err, FormatError::UnknownComponent { .. }));
    }

    #[test]
    fn test_parameters_are_validated_against_schema() {
        let tmp = tempfile::TempDir::new().unwrap();
        fs::write(tmp.path().join("a.fits"), "x").unwrap();

        let mut fmt = formatter(descriptor(tmp.path(), "a.fits", "Exposure", "ImageF"));
        let mut params = ReadParameters::new();
        params.insert("rotation".to_string(), json!(90));

        let err = fmt.read(Some("image"), Some(&params)).unwrap_err();
        assert!(matches!(err, FormatError::UnsupportedParameters { .. }));
        assert!(err.to_string().contains("rotation"));
    }

    #[test]
    fn test_metadata_component_is_stripped_and_cached() {
        let tmp = tempfile::TempDir::new().unwrap();
        fs::write(tmp.path().join("a.fits"), "x").unwrap();

        let mut fmt = formatter(descriptor(tmp.path(), "a.fits", "Exposure", "PropertyList"));
        let ReadProduct::Metadata(metadata) = fmt.read(Some("metadata"), None).unwrap() else {
            panic!("expected metadata read");
        };

        // WCS and bbox cards are exposed as their own components.
        assert!(metadata.get("CRVAL1").is_none());
        assert!(metadata.get("LTV1").is_none());
        assert!(metadata.get("INSTRUME").is_some());

        // The unstripped cache is still intact.
        assert!(fmt.metadata().unwrap().get("CRVAL1").is_some());
    }

    #[test]
    fn test_write_plain_and_with_recipe() {
        let tmp = tempfile::TempDir::new().unwrap();

        let mut fmt = formatter(descriptor(tmp.path(), "out.dat", "Exposure", "Exposure"));
        let rel = fmt.write(&"data".to_string()).unwrap();
        assert_eq!(rel, PathBuf::from("out.fits"));
        assert_eq!(
            fs::read_to_string(tmp.path().join("out.fits")).unwrap(),
            "plain:data"
        );

        let raw = json!({"default": {"image": {"scaling": {"seed": 0}}}});
        let recipes =
            crate::recipes::validate_recipes(Some(raw.as_object().unwrap())).unwrap();
        let identity: DatasetIdentity = [("exposure", "42")].into_iter().collect();
        let expected_seed = identity.derive_seed();

        let mut fmt = ExposureFormatter::<TextCodec>::new(
            descriptor(tmp.path(), "out2.dat", "Exposure", "Exposure"),
            recipes,
            WriteParameters::default(),
            identity,
        );
        fmt.write(&"data".to_string()).unwrap();
        assert_eq!(
            fs::read_to_string(tmp.path().join("out2.fits")).unwrap(),
            format!("options:{expected_seed}:data")
        );
    }

    #[test]
    fn test_write_parameters_accept_only_recipe() {
        let mut map = BTreeMap::new();
        map.insert("recipe".to_string(), "lossy".to_string());
        let params = WriteParameters::from_map(&map).unwrap();
        assert_eq!(params.recipe.as_deref(), Some("lossy"));

        map.insert("chunking".to_string(), "row".to_string());
        let err = WriteParameters::from_map(&map).unwrap_err();
        assert!(err.to_string().contains("chunking"));
    }
}

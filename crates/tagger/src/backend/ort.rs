use super::{Interrogation, Interrogator, Scores};
use crate::config::ExecutionProvider;
use image::{DynamicImage, Rgb, RgbImage, imageops, imageops::FilterType};
use ndarray::{Array, Array4};
use ort::{
    session::{Session, builder::GraphOptimizationLevel},
    value::TensorRef,
};
use std::fs;
use std::path::{Path, PathBuf};

const MODEL_FILE: &str = "model.onnx";
const LABELS_FILE: &str = "selected_tags.csv";
const RATING_CATEGORY: &str = "9";
const PAD_COLOR: Rgb<u8> = Rgb([255, 255, 255]);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Category {
    Rating,
    Tag,
}

/// Output labels of a model, index-aligned with its probability vector.
#[derive(Debug)]
struct Labels {
    names: Vec<String>,
    categories: Vec<Category>,
}

impl Labels {
    fn load(path: &Path) -> anyhow::Result<Self> {
        let csv = fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read labels {}: {}", path.display(), e))?;
        Self::parse(&csv)
    }

    /// Parse `tag_id,name,category,count` rows. Names may be double-quoted
    /// (with `""` escapes) or contain bare commas.
    fn parse(csv: &str) -> anyhow::Result<Self> {
        let mut names = Vec::new();
        let mut categories = Vec::new();

        for (line_number, line) in csv.lines().enumerate() {
            let line = line.trim_end_matches('\r');
            if line.is_empty() || (line_number == 0 && line.starts_with("tag_id")) {
                continue;
            }

            let fields = split_row(line);
            if fields.len() < 4 {
                anyhow::bail!("Malformed label row {}: `{}`", line_number + 1, line);
            }

            let category = fields[fields.len() - 2].trim();
            names.push(fields[1..fields.len() - 2].join(","));
            categories.push(if category == RATING_CATEGORY {
                Category::Rating
            } else {
                Category::Tag
            });
        }

        if names.is_empty() {
            anyhow::bail!("Label file contains no labels");
        }

        Ok(Self { names, categories })
    }

    fn len(&self) -> usize {
        self.names.len()
    }

    fn split(&self, probabilities: &[f32]) -> anyhow::Result<Interrogation> {
        if probabilities.len() != self.len() {
            anyhow::bail!(
                "Model produced {} scores for {} labels",
                probabilities.len(),
                self.len()
            );
        }

        let mut ratings = Scores::new();
        let mut tags = Scores::new();
        for ((name, category), &score) in self
            .names
            .iter()
            .zip(&self.categories)
            .zip(probabilities)
        {
            match category {
                Category::Rating => ratings.insert(name.clone(), score),
                Category::Tag => tags.insert(name.clone(), score),
            };
        }

        Ok(Interrogation::new(ratings, tags))
    }
}

/// Split one CSV row into unquoted fields.
fn split_row(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut at_start = true;
    let mut quoted = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if quoted => {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    field.push('"');
                } else {
                    quoted = false;
                }
            }
            '"' if at_start => quoted = true,
            ',' if !quoted => {
                fields.push(std::mem::take(&mut field));
                at_start = true;
                continue;
            }
            _ => field.push(c),
        }
        at_start = false;
    }

    fields.push(field);
    fields
}

struct LoadedModel {
    session: Session,
    labels: Labels,
}

/// WD14-style ONNX tagger: square BGR input, one sigmoid output per label.
///
/// The session is created on first use and dropped by [`Interrogator::unload`].
pub struct WaifuDiffusionInterrogator {
    name: String,
    model_path: PathBuf,
    labels_path: PathBuf,
    input_size: u32,
    provider: ExecutionProvider,
    loaded: Option<LoadedModel>,
}

impl WaifuDiffusionInterrogator {
    /// Expects `model.onnx` and `selected_tags.csv` inside `dir`.
    pub fn new(
        name: impl Into<String>,
        dir: &Path,
        input_size: u32,
        provider: ExecutionProvider,
    ) -> Self {
        Self {
            name: name.into(),
            model_path: dir.join(MODEL_FILE),
            labels_path: dir.join(LABELS_FILE),
            input_size,
            provider,
            loaded: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.is_some()
    }

    /// One interrogator per subdirectory of `models_dir` holding both model
    /// files, named after the subdirectory, in sorted order.
    pub fn discover(
        models_dir: &Path,
        input_size: u32,
        provider: ExecutionProvider,
    ) -> anyhow::Result<Vec<Self>> {
        let mut dirs: Vec<PathBuf> = fs::read_dir(models_dir)
            .map_err(|e| {
                anyhow::anyhow!("Failed to read models dir {}: {}", models_dir.display(), e)
            })?
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| path.is_dir())
            .collect();
        dirs.sort();

        let mut interrogators = Vec::with_capacity(dirs.len());
        for dir in dirs {
            let Some(name) = dir.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !dir.join(MODEL_FILE).is_file() || !dir.join(LABELS_FILE).is_file() {
                tracing::warn!(dir = %dir.display(), "Skipping model dir without {} and {}", MODEL_FILE, LABELS_FILE);
                continue;
            }
            interrogators.push(Self::new(name, &dir, input_size, provider));
        }

        Ok(interrogators)
    }

    fn ensure_loaded(&mut self) -> anyhow::Result<&mut LoadedModel> {
        if self.loaded.is_none() {
            tracing::info!(model = %self.name, "Loading interrogator");
            let labels = Labels::load(&self.labels_path)?;
            let session = build_session(&self.model_path, self.provider)?;
            tracing::info!(model = %self.name, labels = labels.len(), "Interrogator loaded");
            self.loaded = Some(LoadedModel { session, labels });
        }

        self.loaded
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("Model {} failed to load", self.name))
    }
}

fn build_session(path: &Path, provider: ExecutionProvider) -> anyhow::Result<Session> {
    // Initialize ORT environment (idempotent)
    let _ = ort::init().commit();

    #[allow(unused_mut)]
    let mut builder = Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_intra_threads(4)?;

    match provider {
        #[cfg(feature = "cuda")]
        ExecutionProvider::Cuda => {
            tracing::info!("Initializing ONNX Runtime with CUDA execution provider");
            builder = builder.with_execution_providers([
                ort::execution_providers::CUDAExecutionProvider::default()
                    .with_device_id(0)
                    .build()
                    .error_on_failure(),
            ])?;
        }
        #[cfg(not(feature = "cuda"))]
        ExecutionProvider::Cuda => {
            tracing::warn!("CUDA requested but the `cuda` feature is disabled, using CPU");
        }
        ExecutionProvider::Cpu => {
            tracing::info!("Initializing ONNX Runtime with CPU execution provider");
        }
    }

    let session = builder.commit_from_file(path)?;
    tracing::info!("Model loaded from {}", path.display());
    Ok(session)
}

/// Flatten alpha onto white, pad to a centered white square, resize to
/// `size` and lay out as BGR `f32` in `[1, size, size, 3]`, values 0..=255.
pub fn preprocess(image: &DynamicImage, size: u32) -> Array4<f32> {
    let rgba = image.to_rgba8();
    let (width, height) = rgba.dimensions();

    let side = width.max(height).max(1);
    let mut square = RgbImage::from_pixel(side, side, PAD_COLOR);
    let (offset_x, offset_y) = ((side - width) / 2, (side - height) / 2);
    for (x, y, pixel) in rgba.enumerate_pixels() {
        let [r, g, b, a] = pixel.0;
        let blend = |c: u8| ((c as u32 * a as u32 + 255 * (255 - a as u32)) / 255) as u8;
        square.put_pixel(x + offset_x, y + offset_y, Rgb([blend(r), blend(g), blend(b)]));
    }

    let filter = if side > size {
        FilterType::Triangle
    } else {
        FilterType::CatmullRom
    };
    let resized = if side == size {
        square
    } else {
        imageops::resize(&square, size, size, filter)
    };

    let mut tensor = Array::zeros((1, size as usize, size as usize, 3));
    for (x, y, pixel) in resized.enumerate_pixels() {
        let [r, g, b] = pixel.0;
        let (x, y) = (x as usize, y as usize);
        tensor[[0, y, x, 0]] = b as f32;
        tensor[[0, y, x, 1]] = g as f32;
        tensor[[0, y, x, 2]] = r as f32;
    }
    tensor
}

impl Interrogator for WaifuDiffusionInterrogator {
    fn interrogate(&mut self, image: &DynamicImage) -> anyhow::Result<Interrogation> {
        let input = {
            let _s = common::span_debug!("preprocess");
            preprocess(image, self.input_size).into_dyn()
        };

        let model = self.ensure_loaded()?;
        let outputs = model
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let probabilities = outputs[0].try_extract_array::<f32>()?;
        let probabilities: Vec<f32> = probabilities.iter().copied().collect();

        model.labels.split(&probabilities)
    }

    fn unload(&mut self) -> bool {
        match self.loaded.take() {
            Some(_) => {
                tracing::info!(model = %self.name, "Interrogator unloaded");
                true
            }
            None => false,
        }
    }
}

//! Image token codec.
//!
//! At ingestion time, image-bearing cells are replaced by tokens of the form
//! `ea://image/<column>/<filename>` and the image itself is registered as an
//! [`ImageAsset`]. The client fetches `/data/images/<column>/<filename>` to
//! resolve a token.
//!
//! # Accepted cell shapes
//!
//! Each cell is classified into one [`ImageInput`] variant, tried in this
//! order:
//!
//! | # | Variant | Cell |
//! |---|---------|------|
//! | 1 | `Bytes` | raw byte buffer |
//! | 2 | `Record` | object with `bytes` (array or base64), `path`, or `array` |
//! | 3 | `DataUri` | `data:image/...;base64,...` |
//! | 4 | `Base64` | bare base64 text whose decoded bytes sniff as an image |
//! | 5 | `Decoded` | decoded image handle |
//! | 6 | `PixelArray` | 2-D gray or 3-D RGB/RGBA numeric array |
//!
//! Byte-resolvable values are thumbnailed: images with alpha or a palette
//! stay PNG, opaque images become quality-85 JPEG. A `path` record is kept
//! as a lazy file reference and only read when requested.

use anyhow::{bail, Context, Result};
use axum::body::Bytes;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use image::{DynamicImage, GrayImage, ImageFormat, RgbImage, RgbaImage};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::models::{Cell, Dataset};

pub const IMAGE_TOKEN_PREFIX: &str = "ea://image/";
pub const IMAGE_RELATIVE_PATH: &str = "images";
pub const DEFAULT_THUMBNAIL_SIZE: u32 = 256;

/// column → (filename → asset)
pub type ImageAssets = BTreeMap<String, BTreeMap<String, ImageAsset>>;

/// True when `name` can be used as one path segment, both in a token and
/// inside the archive: non-empty, no separators, no `..`, no NUL.
pub fn is_path_segment(name: &str) -> bool {
    !name.is_empty() && !name.contains(['/', '\\', '\0']) && !name.contains("..")
}

/// Sniff the image format from magic numbers.
pub fn detect_image_type(data: &[u8]) -> Option<&'static str> {
    if data.starts_with(b"\x89PNG\r\n\x1a\n") {
        Some("image/png")
    } else if data.starts_with(b"\xff\xd8\xff") {
        Some("image/jpeg")
    } else if data.starts_with(b"GIF87a") || data.starts_with(b"GIF89a") {
        Some("image/gif")
    } else if data.starts_with(b"BM") {
        Some("image/bmp")
    } else if data.starts_with(b"II*\x00") || data.starts_with(b"MM\x00*") {
        Some("image/tiff")
    } else {
        None
    }
}

fn extension_for_mime(mime: &str) -> &'static str {
    match mime {
        "image/png" => ".png",
        "image/jpeg" => ".jpg",
        "image/gif" => ".gif",
        "image/bmp" => ".bmp",
        "image/tiff" => ".tiff",
        _ => ".bin",
    }
}

fn mime_for_extension(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "gif" => Some("image/gif"),
        "bmp" => Some("image/bmp"),
        "tif" | "tiff" => Some("image/tiff"),
        _ => None,
    }
}

/// Resolved image bytes and their MIME type.
#[derive(Debug, Clone)]
pub struct ResolvedImage {
    pub bytes: Bytes,
    pub mime: &'static str,
}

#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    #[error("image file not found: {}", path.display())]
    Missing { path: PathBuf },
    #[error("failed to read image file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("unrecognized image format: {}", path.display())]
    Unrecognized { path: PathBuf },
}

#[derive(Debug)]
enum AssetSource {
    Inline,
    File(PathBuf),
}

/// A registered image, either inline or a lazily-read file.
///
/// Resolution is memoized without a lock: two requests racing on the same
/// cold asset may both read the file, but they store identical bytes, so the
/// race is harmless.
#[derive(Debug)]
pub struct ImageAsset {
    source: AssetSource,
    resolved: OnceLock<ResolvedImage>,
}

impl ImageAsset {
    pub fn inline(bytes: Vec<u8>, mime: &'static str) -> Self {
        let resolved = OnceLock::new();
        let _ = resolved.set(ResolvedImage {
            bytes: Bytes::from(bytes),
            mime,
        });
        Self {
            source: AssetSource::Inline,
            resolved,
        }
    }

    pub fn lazy(path: PathBuf) -> Self {
        Self {
            source: AssetSource::File(path),
            resolved: OnceLock::new(),
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved.get().is_some()
    }

    /// Bytes and MIME type, reading the backing file on first use.
    pub fn load(&self) -> Result<ResolvedImage, ImageError> {
        if let Some(resolved) = self.resolved.get() {
            return Ok(resolved.clone());
        }
        let path = match &self.source {
            AssetSource::File(path) => path,
            // Inline assets are resolved at construction.
            AssetSource::Inline => unreachable!("inline image asset without bytes"),
        };
        let bytes = std::fs::read(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ImageError::Missing { path: path.clone() },
            _ => ImageError::Io {
                path: path.clone(),
                source: e,
            },
        })?;
        let mime = detect_image_type(&bytes).ok_or_else(|| ImageError::Unrecognized {
            path: path.clone(),
        })?;
        let fresh = ResolvedImage {
            bytes: Bytes::from(bytes),
            mime,
        };
        let _ = self.resolved.set(fresh.clone());
        Ok(self.resolved.get().cloned().unwrap_or(fresh))
    }
}

/// Closed set of image representations a cell may hold.
#[derive(Debug)]
enum ImageInput<'a> {
    Bytes(&'a [u8]),
    Record(&'a Map<String, Value>),
    DataUri(&'a str),
    Base64(&'a str),
    Decoded(&'a DynamicImage),
    PixelArray(&'a [Value]),
}

impl<'a> ImageInput<'a> {
    fn classify(cell: &'a Cell) -> Option<Self> {
        match cell {
            Cell::Bytes(b) => Some(ImageInput::Bytes(b)),
            Cell::Json(Value::Object(map)) => Some(ImageInput::Record(map)),
            Cell::Text(s) if s.starts_with("data:image/") => Some(ImageInput::DataUri(s)),
            Cell::Text(s) => Some(ImageInput::Base64(s)),
            Cell::Image(img) => Some(ImageInput::Decoded(img)),
            Cell::Json(Value::Array(items)) => Some(ImageInput::PixelArray(items)),
            _ => None,
        }
    }
}

/// What a normalized cell points at.
#[derive(Debug)]
enum Normalized {
    Bytes(Vec<u8>),
    File(PathBuf),
}

fn normalize(input: ImageInput<'_>) -> Option<Normalized> {
    match input {
        ImageInput::Bytes(bytes) => Some(Normalized::Bytes(bytes.to_vec())),
        ImageInput::Record(map) => normalize_record(map),
        ImageInput::DataUri(text) => decode_data_uri(text).map(Normalized::Bytes),
        ImageInput::Base64(text) => decode_image_base64(text).map(Normalized::Bytes),
        ImageInput::Decoded(img) => encode_png(img).ok().map(Normalized::Bytes),
        ImageInput::PixelArray(items) => pixel_array_png(items).map(Normalized::Bytes),
    }
}

fn normalize_record(map: &Map<String, Value>) -> Option<Normalized> {
    match map.get("bytes") {
        Some(Value::String(text)) => {
            if let Some(bytes) = decode_image_base64(text) {
                return Some(Normalized::Bytes(bytes));
            }
        }
        Some(Value::Array(items)) => {
            if let Some(bytes) = byte_array(items) {
                return Some(Normalized::Bytes(bytes));
            }
        }
        _ => {}
    }
    if let Some(Value::String(path)) = map.get("path") {
        return Some(Normalized::File(PathBuf::from(path)));
    }
    if let Some(Value::Array(items)) = map.get("array") {
        return pixel_array_png(items).map(Normalized::Bytes);
    }
    None
}

fn byte_array(items: &[Value]) -> Option<Vec<u8>> {
    items
        .iter()
        .map(|v| v.as_u64().and_then(|n| u8::try_from(n).ok()))
        .collect()
}

pub(crate) fn decode_data_uri(text: &str) -> Option<Vec<u8>> {
    let (prefix, encoded) = text.split_once(',')?;
    if !prefix.starts_with("data:image/") {
        return None;
    }
    STANDARD.decode(encoded.trim()).ok()
}

/// Base64 text is only treated as an image if the decoded bytes sniff as
/// one; otherwise ordinary text columns would be swallowed.
fn decode_image_base64(text: &str) -> Option<Vec<u8>> {
    let data = STANDARD.decode(text.trim()).ok()?;
    detect_image_type(&data)?;
    Some(data)
}

fn encode_png(img: &DynamicImage) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)?;
    Ok(buf)
}

fn pixel_value(v: &Value) -> Option<u8> {
    v.as_f64().map(|f| f.clamp(0.0, 255.0) as u8)
}

/// Encode a numeric pixel array as PNG: `[[g, ...], ...]`,
/// `[[[r, g, b], ...], ...]`, or `[[[r, g, b, a], ...], ...]`.
fn pixel_array_png(rows: &[Value]) -> Option<Vec<u8>> {
    let height = rows.len();
    let first = rows.first()?.as_array()?;
    let width = first.len();
    if width == 0 {
        return None;
    }
    let channels = match first.first()? {
        Value::Array(px) if px.len() == 3 || px.len() == 4 => px.len(),
        Value::Array(_) => return None,
        _ => 1,
    };

    let mut data = Vec::with_capacity(width * height * channels);
    for row in rows {
        let row = row.as_array()?;
        if row.len() != width {
            return None;
        }
        for px in row {
            if channels == 1 {
                data.push(pixel_value(px)?);
            } else {
                let px = px.as_array()?;
                if px.len() != channels {
                    return None;
                }
                for v in px {
                    data.push(pixel_value(v)?);
                }
            }
        }
    }

    let (w, h) = (u32::try_from(width).ok()?, u32::try_from(height).ok()?);
    let img = match channels {
        1 => DynamicImage::ImageLuma8(GrayImage::from_raw(w, h, data)?),
        3 => DynamicImage::ImageRgb8(RgbImage::from_raw(w, h, data)?),
        _ => DynamicImage::ImageRgba8(RgbaImage::from_raw(w, h, data)?),
    };
    encode_png(&img).ok()
}

/// Palette images decode to RGB(A) in the `image` crate, so detect them from
/// the container instead: GIF is always indexed, PNG color type 3 is.
fn is_palette(data: &[u8], mime: &str) -> bool {
    match mime {
        "image/gif" => true,
        "image/png" => data.get(25) == Some(&3),
        _ => false,
    }
}

/// Bounded thumbnail: longest side capped at `max_size` (never upscaled).
pub fn encode_thumbnail(data: &[u8], mime: &str, max_size: u32) -> Result<(Vec<u8>, &'static str)> {
    let img = image::load_from_memory(data).context("failed to decode image")?;
    let keep_alpha = img.color().has_alpha() || is_palette(data, mime);
    let img = if img.width() > max_size || img.height() > max_size {
        img.thumbnail(max_size, max_size)
    } else {
        img
    };

    let mut buf = Vec::new();
    if keep_alpha {
        DynamicImage::ImageRgba8(img.to_rgba8())
            .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)?;
        Ok((buf, "image/png"))
    } else {
        let rgb = img.to_rgb8();
        let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut buf, 85);
        encoder.encode_image(&rgb)?;
        Ok((buf, "image/jpeg"))
    }
}

/// Result of [`extract_image_assets`].
#[derive(Debug, Default)]
pub struct ExtractedImages {
    pub assets: ImageAssets,
    /// Columns in which at least one cell was tokenized.
    pub columns: BTreeSet<String>,
}

impl ExtractedImages {
    pub fn get(&self, column: &str, filename: &str) -> Option<&ImageAsset> {
        self.assets.get(column)?.get(filename)
    }
}

pub fn image_token(column: &str, filename: &str) -> String {
    format!("{}{}/{}", IMAGE_TOKEN_PREFIX, column, filename)
}

/// Turn one normalized value into an asset plus its file extension.
fn build_asset(
    normalized: Normalized,
    base_dir: Option<&Path>,
    max_thumbnail: u32,
) -> Result<(ImageAsset, &'static str)> {
    match normalized {
        Normalized::Bytes(bytes) => {
            let Some(mime) = detect_image_type(&bytes) else {
                bail!("unrecognized image bytes");
            };
            let (thumb, thumb_mime) = encode_thumbnail(&bytes, mime, max_thumbnail)?;
            Ok((ImageAsset::inline(thumb, thumb_mime), extension_for_mime(thumb_mime)))
        }
        Normalized::File(path) => {
            let Some(mime) = mime_for_extension(&path) else {
                bail!("not an image path: {}", path.display());
            };
            let path = match base_dir {
                Some(base) if path.is_relative() => base.join(path),
                _ => path,
            };
            Ok((ImageAsset::lazy(path), extension_for_mime(mime)))
        }
    }
}

/// Replace image-like cells with tokens and collect the assets.
///
/// `source_column` names the provenance column holding each row's base
/// directory; it is never scanned itself. Cells that cannot be normalized are
/// left untouched.
pub fn extract_image_assets(
    dataset: &mut Dataset,
    source_column: Option<&str>,
    max_thumbnail: u32,
) -> ExtractedImages {
    let mut out = ExtractedImages::default();

    let row_ids: Vec<String> = match dataset.table.column(&dataset.id_column) {
        Some(column) => column.values.iter().map(Cell::render).collect(),
        None => return out,
    };
    let base_dirs: Vec<Option<PathBuf>> = match source_column.and_then(|c| dataset.table.column(c)) {
        Some(column) => column
            .values
            .iter()
            .map(|v| match v {
                Cell::Text(dir) => Some(PathBuf::from(dir)),
                _ => None,
            })
            .collect(),
        None => vec![None; row_ids.len()],
    };

    let candidates: Vec<String> = dataset
        .table
        .columns
        .iter()
        .filter(|c| c.name != dataset.id_column && Some(c.name.as_str()) != source_column)
        .filter(|c| c.values.iter().any(Cell::is_object_like))
        .filter(|c| {
            let usable = is_path_segment(&c.name);
            if !usable {
                tracing::warn!(column = %c.name, "column name is not a path segment; images left inline");
            }
            usable
        })
        .map(|c| c.name.clone())
        .collect();

    for name in candidates {
        let Some(column) = dataset.table.column_mut(&name) else {
            continue;
        };
        let files = out.assets.entry(name.clone()).or_default();

        for (row, cell) in column.values.iter_mut().enumerate() {
            let Some(normalized) = ImageInput::classify(cell).and_then(normalize) else {
                continue;
            };
            let base_dir = base_dirs.get(row).and_then(|d| d.as_deref());
            let (asset, extension) = match build_asset(normalized, base_dir, max_thumbnail) {
                Ok(built) => built,
                Err(e) => {
                    tracing::debug!(column = %name, row, "skipping image cell: {:#}", e);
                    continue;
                }
            };

            // Ids that cannot form a path segment fall back to the row position.
            let mut filename = format!("{}{}", row_ids[row], extension);
            if !is_path_segment(&filename) {
                filename = format!("{}{}", row, extension);
            }
            if files.contains_key(&filename) {
                tracing::warn!(
                    column = %name,
                    filename = %filename,
                    "duplicate row identifier; leaving image cell untouched"
                );
                continue;
            }
            *cell = Cell::Text(image_token(&name, &filename));
            files.insert(filename, asset);
        }

        if files.is_empty() {
            out.assets.remove(&name);
        } else {
            out.columns.insert(name);
        }
    }

    tracing::info!(
        "Extracted {} image assets from {} columns",
        out.assets.values().map(BTreeMap::len).sum::<usize>(),
        out.columns.len()
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Column, Table};
    use image::{Rgb, Rgba};
    use serde_json::json;
    use tempfile::TempDir;

    fn png_rgba(w: u32, h: u32) -> Vec<u8> {
        let img = RgbaImage::from_pixel(w, h, Rgba([10, 20, 30, 128]));
        encode_png(&DynamicImage::ImageRgba8(img)).unwrap()
    }

    fn png_rgb(w: u32, h: u32) -> Vec<u8> {
        let img = RgbImage::from_pixel(w, h, Rgb([200, 100, 50]));
        encode_png(&DynamicImage::ImageRgb8(img)).unwrap()
    }

    fn dataset(cells: Vec<Cell>) -> Dataset {
        let ids = (0..cells.len() as i64).map(Cell::Int).collect();
        Dataset {
            table: Table::new(vec![Column::new("_row_index", ids), Column::new("img", cells)]),
            id_column: "_row_index".to_string(),
        }
    }

    fn cell<'a>(ds: &'a Dataset, row: usize) -> &'a Cell {
        &ds.table.column("img").unwrap().values[row]
    }

    #[test]
    fn test_detect_signatures() {
        assert_eq!(detect_image_type(&png_rgb(1, 1)), Some("image/png"));
        assert_eq!(detect_image_type(b"\xff\xd8\xff\xe0rest"), Some("image/jpeg"));
        assert_eq!(detect_image_type(b"GIF89a..."), Some("image/gif"));
        assert_eq!(detect_image_type(b"GIF87a..."), Some("image/gif"));
        assert_eq!(detect_image_type(b"BM...."), Some("image/bmp"));
        assert_eq!(detect_image_type(b"II*\x00...."), Some("image/tiff"));
        assert_eq!(detect_image_type(b"MM\x00*...."), Some("image/tiff"));
        assert_eq!(detect_image_type(b"hello"), None);
    }

    #[test]
    fn test_data_uri_with_alpha_stays_png() {
        let uri = format!("data:image/png;base64,{}", STANDARD.encode(png_rgba(4, 4)));
        let mut ds = dataset(vec![Cell::Text(uri)]);
        let out = extract_image_assets(&mut ds, None, 256);

        assert_eq!(cell(&ds, 0), &Cell::Text("ea://image/img/0.png".to_string()));
        assert!(out.columns.contains("img"));
        let resolved = out.get("img", "0.png").unwrap().load().unwrap();
        assert_eq!(resolved.mime, "image/png");
        assert_eq!(detect_image_type(&resolved.bytes), Some("image/png"));
    }

    #[test]
    fn test_opaque_image_becomes_jpeg() {
        let mut ds = dataset(vec![Cell::Bytes(png_rgb(8, 8))]);
        let out = extract_image_assets(&mut ds, None, 256);
        assert_eq!(cell(&ds, 0), &Cell::Text("ea://image/img/0.jpg".to_string()));
        let resolved = out.get("img", "0.jpg").unwrap().load().unwrap();
        assert_eq!(detect_image_type(&resolved.bytes), Some("image/jpeg"));
    }

    #[test]
    fn test_thumbnail_is_bounded() {
        let mut ds = dataset(vec![Cell::Bytes(png_rgba(600, 300))]);
        let out = extract_image_assets(&mut ds, None, 256);
        let resolved = out.get("img", "0.png").unwrap().load().unwrap();
        let img = image::load_from_memory(&resolved.bytes).unwrap();
        assert_eq!(img.width(), 256);
        assert!(img.height() <= 256);
    }

    #[test]
    fn test_small_image_not_upscaled() {
        let mut ds = dataset(vec![Cell::Bytes(png_rgba(3, 2))]);
        let out = extract_image_assets(&mut ds, None, 256);
        let resolved = out.get("img", "0.png").unwrap().load().unwrap();
        let img = image::load_from_memory(&resolved.bytes).unwrap();
        assert_eq!((img.width(), img.height()), (3, 2));
    }

    #[test]
    fn test_plain_text_and_non_image_base64_untouched() {
        let cells = vec![
            Cell::Text("a caption".to_string()),
            Cell::Text(STANDARD.encode(b"hello world")),
            Cell::Int(7),
        ];
        let mut ds = dataset(cells.clone());
        let out = extract_image_assets(&mut ds, None, 256);
        assert!(out.columns.is_empty());
        assert_eq!(ds.table.column("img").unwrap().values, cells);
    }

    #[test]
    fn test_bare_base64_image_accepted() {
        let mut ds = dataset(vec![Cell::Text(STANDARD.encode(png_rgba(2, 2)))]);
        let out = extract_image_assets(&mut ds, None, 256);
        assert!(out.get("img", "0.png").is_some());
    }

    #[test]
    fn test_record_with_base64_bytes() {
        let record = json!({ "bytes": STANDARD.encode(png_rgba(2, 2)) });
        let mut ds = dataset(vec![Cell::Json(record)]);
        let out = extract_image_assets(&mut ds, None, 256);
        assert!(out.get("img", "0.png").is_some());
    }

    #[test]
    fn test_gray_pixel_array() {
        let mut ds = dataset(vec![Cell::Json(json!([[0, 255], [128, 64]]))]);
        let out = extract_image_assets(&mut ds, None, 256);
        // Grayscale has no alpha, so the thumbnail is JPEG.
        let resolved = out.get("img", "0.jpg").unwrap().load().unwrap();
        assert_eq!(resolved.mime, "image/jpeg");
    }

    #[test]
    fn test_rgba_pixel_array_in_record() {
        let record = json!({ "array": [[[1, 2, 3, 4], [5, 6, 7, 8]]] });
        let mut ds = dataset(vec![Cell::Json(record)]);
        let out = extract_image_assets(&mut ds, None, 256);
        assert!(out.get("img", "0.png").is_some());
    }

    #[test]
    fn test_ragged_pixel_array_rejected() {
        let mut ds = dataset(vec![Cell::Json(json!([[1, 2], [3]]))]);
        let out = extract_image_assets(&mut ds, None, 256);
        assert!(out.columns.is_empty());
    }

    #[test]
    fn test_decoded_image_handle() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(2, 2, Rgba([0, 0, 0, 0])));
        let mut ds = dataset(vec![Cell::Image(img)]);
        let out = extract_image_assets(&mut ds, None, 256);
        assert!(out.get("img", "0.png").is_some());
    }

    #[test]
    fn test_lazy_path_resolves_against_base_dir() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("cat.png"), png_rgb(5, 5)).unwrap();

        let mut ds = dataset(vec![
            Cell::Json(json!({ "path": "cat.png" })),
            Cell::Json(json!({ "path": "missing.jpg" })),
        ]);
        let dir = Cell::Text(tmp.path().display().to_string());
        ds.table
            .columns
            .push(Column::new("__source", vec![dir.clone(), dir]));

        let out = extract_image_assets(&mut ds, Some("__source"), 256);
        let asset = out.get("img", "0.png").unwrap();
        assert!(!asset.is_resolved());
        let resolved = asset.load().unwrap();
        assert!(asset.is_resolved());
        // Lazy files are served as-is, not thumbnailed.
        assert_eq!(resolved.bytes.as_ref(), png_rgb(5, 5).as_slice());

        let missing = out.get("img", "1.jpg").unwrap().load();
        assert!(matches!(missing, Err(ImageError::Missing { .. })));
    }

    #[test]
    fn test_unsafe_identifiers_fall_back_to_row_position() {
        let mut ds = dataset(vec![
            Cell::Bytes(png_rgba(2, 2)),
            Cell::Bytes(png_rgba(2, 2)),
            Cell::Bytes(png_rgba(2, 2)),
        ]);
        ds.table.columns[0].values = vec![
            Cell::Text("a/b".into()),
            Cell::Text("../x".into()),
            Cell::Text("ok".into()),
        ];
        let out = extract_image_assets(&mut ds, None, 256);

        assert_eq!(cell(&ds, 0), &Cell::Text("ea://image/img/0.png".to_string()));
        assert_eq!(cell(&ds, 1), &Cell::Text("ea://image/img/1.png".to_string()));
        assert_eq!(cell(&ds, 2), &Cell::Text("ea://image/img/ok.png".to_string()));
        assert!(out.assets["img"].keys().all(|name| is_path_segment(name)));
    }

    #[test]
    fn test_unsafe_column_name_left_inline() {
        let mut ds = dataset(vec![Cell::Bytes(png_rgba(2, 2))]);
        ds.table.columns[1].name = "../img".into();
        let out = extract_image_assets(&mut ds, None, 256);
        assert!(out.columns.is_empty());
        assert!(matches!(ds.table.columns[1].values[0], Cell::Bytes(_)));
    }

    #[test]
    fn test_path_segment_check() {
        assert!(is_path_segment("0.png"));
        assert!(is_path_segment("state"));
        for bad in ["", "a/b", "..", "../x", "a\\b", "nul\0"] {
            assert!(!is_path_segment(bad), "{:?}", bad);
        }
    }

    #[test]
    fn test_duplicate_identifier_not_reused() {
        let mut ds = dataset(vec![Cell::Bytes(png_rgba(2, 2)), Cell::Bytes(png_rgba(3, 3))]);
        ds.table.columns[0].values = vec![Cell::Int(1), Cell::Int(1)];
        let out = extract_image_assets(&mut ds, None, 256);
        assert_eq!(out.assets["img"].len(), 1);
        assert!(matches!(cell(&ds, 1), Cell::Bytes(_)));
    }
}

//! Reading detections from a results directory.
//!
//! The detection tool writes one `labels/<image stem>.txt` per image, one
//! row per box: `class cx cy w h [confidence]`, coordinates normalized to the
//! image size.

use crate::error::InferenceError;
use relearn_core::DetectedLabel;
use std::io;
use std::path::Path;

/// Load the detections for `image_path`. No labels file means no detections.
pub async fn load_labels(
    results_dir: &Path,
    image_path: &Path,
    image_bytes: &[u8],
) -> Result<Vec<DetectedLabel>, InferenceError> {
    let stem = image_path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    let label_path = results_dir.join("labels").join(format!("{stem}.txt"));

    let text = match tokio::fs::read_to_string(&label_path).await {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            tracing::debug!(path = %label_path.display(), "no labels file");
            return Ok(Vec::new());
        }
        Err(source) => {
            return Err(InferenceError::Io {
                path: label_path,
                source,
            });
        }
    };
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }

    let size = imagesize::blob_size(image_bytes)?;
    parse_labels(&text, &label_path, size.width as f64, size.height as f64)
}

/// Convert YOLO rows into pixel boxes with a top-left origin.
pub fn parse_labels(
    text: &str,
    path: &Path,
    width: f64,
    height: f64,
) -> Result<Vec<DetectedLabel>, InferenceError> {
    let mut labels = Vec::new();
    for (index, line) in text.lines().enumerate() {
        let tokens: Vec<&str> = line.split_whitespace().take(7).collect();
        if tokens.is_empty() {
            continue;
        }
        let error = |message: String| InferenceError::LabelParse {
            path: path.to_path_buf(),
            line: index + 1,
            message,
        };
        if !(5..=6).contains(&tokens.len()) {
            return Err(error(format!("expected 5 or 6 fields, found {}", tokens.len())));
        }

        let label_index = tokens[0]
            .parse::<u32>()
            .map_err(|_| error(format!("invalid class '{}'", tokens[0])))?;
        let mut values = [0.0f64; 5];
        for (value, raw) in values.iter_mut().zip(&tokens[1..]) {
            *value = raw
                .parse()
                .map_err(|_| error(format!("invalid number '{raw}'")))?;
        }
        let [cx, cy, w, h, _] = values;
        let confidence = match tokens.get(5) {
            Some(_) => values[4],
            None => 1.0,
        };

        labels.push(DetectedLabel {
            label_index,
            x: ((cx - w / 2.0) * width).round() as i32,
            y: ((cy - h / 2.0) * height).round() as i32,
            width: (w * width).round() as i32,
            height: (h * height).round() as i32,
            confidence,
        });
    }
    Ok(labels)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Minimal 24-bit BMP header; only the dimensions matter here.
    pub(crate) fn bmp_bytes(width: u32, height: u32) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"BM");
        bytes.extend_from_slice(&54u32.to_le_bytes());
        bytes.extend_from_slice(&[0, 0, 0, 0]);
        bytes.extend_from_slice(&54u32.to_le_bytes());
        bytes.extend_from_slice(&40u32.to_le_bytes());
        bytes.extend_from_slice(&(width as i32).to_le_bytes());
        bytes.extend_from_slice(&(height as i32).to_le_bytes());
        bytes.extend_from_slice(&1u16.to_le_bytes());
        bytes.extend_from_slice(&24u16.to_le_bytes());
        bytes.resize(54, 0);
        bytes
    }

    #[test]
    fn converts_normalized_rows() {
        let labels = parse_labels(
            "0 0.5 0.5 0.25 0.5 0.87\n\n2 0.1 0.2 0.2 0.2\n",
            Path::new("a.txt"),
            640.0,
            480.0,
        )
        .unwrap();
        assert_eq!(
            labels,
            vec![
                DetectedLabel {
                    label_index: 0,
                    x: 240,
                    y: 120,
                    width: 160,
                    height: 240,
                    confidence: 0.87,
                },
                DetectedLabel {
                    label_index: 2,
                    x: 0,
                    y: 48,
                    width: 128,
                    height: 96,
                    confidence: 1.0,
                },
            ]
        );
    }

    #[test]
    fn rejects_malformed_rows() {
        for bad in ["0 0.5 0.5 0.1", "x 0.5 0.5 0.1 0.1", "0 0.5 nope 0.1 0.1", "0 1 1 1 1 1 1"] {
            let err = parse_labels(bad, Path::new("a.txt"), 10.0, 10.0).unwrap_err();
            assert!(matches!(err, InferenceError::LabelParse { line: 1, .. }), "{bad}");
        }
    }

    #[tokio::test]
    async fn loads_labels_for_image_stem() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("labels")).unwrap();
        std::fs::write(dir.path().join("labels/abc.txt"), "1 0.5 0.5 0.5 0.5 0.9\n").unwrap();

        let labels = load_labels(dir.path(), Path::new("/tmp/detect/abc.bmp"), &bmp_bytes(200, 100))
            .await
            .unwrap();
        assert_eq!(labels.len(), 1);
        assert_eq!((labels[0].x, labels[0].y), (50, 25));
        assert_eq!((labels[0].width, labels[0].height), (100, 50));
    }

    #[tokio::test]
    async fn missing_labels_file_means_no_detections() {
        let dir = tempfile::tempdir().unwrap();
        let labels = load_labels(dir.path(), Path::new("abc.jpg"), b"not an image")
            .await
            .unwrap();
        assert!(labels.is_empty());
    }
}

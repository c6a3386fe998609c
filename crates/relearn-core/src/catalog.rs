//! Message catalogs.
//!
//! - [`DetectorMessage`]: Client <-> Detector.
//! - [`TrainerMessage`]: ImageSource -> Trainer and Trainer -> Detector.

use crate::message::{Protocol, b64};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// One detected bounding box, in pixels with a top-left origin.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DetectedLabel {
    pub label_index: u32,
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
    pub confidence: f64,
}

/// Which corpus an uploaded image belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageUsageType {
    Training,
    Validation,
    /// Images held only for the duration of a detection request.
    Detect,
}

impl ImageUsageType {
    /// Holding subdirectory name under the temp image root.
    pub fn dir_name(&self) -> &'static str {
        match self {
            ImageUsageType::Training => "training",
            ImageUsageType::Validation => "validation",
            ImageUsageType::Detect => "detect",
        }
    }
}

impl fmt::Display for ImageUsageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// Annotation files share the image's stem and use this extension.
pub const ANNOTATION_EXTENSION: &str = "txt";

/// Normalize an image extension received over the wire.
///
/// A leading `.` is dropped. The result must be a plain file-name suffix that
/// cannot collide with the annotation file.
pub fn normalize_extension(extension: &str) -> Result<&str, InvalidExtension> {
    let normalized = extension.strip_prefix('.').unwrap_or(extension);
    if normalized.is_empty()
        || normalized.starts_with('.')
        || normalized.contains(['/', '\\', '\0'])
        || normalized.eq_ignore_ascii_case(ANNOTATION_EXTENSION)
    {
        return Err(InvalidExtension(extension.to_string()));
    }
    Ok(normalized)
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid image extension: {0:?}")]
pub struct InvalidExtension(pub String);

/// Client <-> Detector messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DetectorMessage {
    DetectRequest {
        #[serde(rename = "image_bytes_b64", with = "b64")]
        image_bytes: Vec<u8>,
        image_extension: String,
        image_id: Uuid,
    },
    DetectResponse {
        image_id: Uuid,
        detected_labels: Vec<DetectedLabel>,
    },
    DetectorError {
        structure_state_name: String,
        original_message_json: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DetectorMessageKind {
    DetectRequest,
    DetectResponse,
    DetectorError,
}

impl fmt::Display for DetectorMessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DetectorMessageKind::DetectRequest => "detect_request",
            DetectorMessageKind::DetectResponse => "detect_response",
            DetectorMessageKind::DetectorError => "detector_error",
        })
    }
}

impl Protocol for DetectorMessage {
    type Kind = DetectorMessageKind;

    fn kind(&self) -> DetectorMessageKind {
        match self {
            DetectorMessage::DetectRequest { .. } => DetectorMessageKind::DetectRequest,
            DetectorMessage::DetectResponse { .. } => DetectorMessageKind::DetectResponse,
            DetectorMessage::DetectorError { .. } => DetectorMessageKind::DetectorError,
        }
    }

    fn structural_error(&self, state: &str) -> Option<Self> {
        match self {
            DetectorMessage::DetectorError { .. } => None,
            _ => Some(DetectorMessage::DetectorError {
                structure_state_name: state.to_string(),
                original_message_json: serde_json::to_string(self).unwrap_or_default(),
            }),
        }
    }
}

/// ImageSource -> Trainer and Trainer -> Detector messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TrainerMessage {
    AddImageAnnouncement {
        #[serde(rename = "image_bytes_b64", with = "b64")]
        image_bytes: Vec<u8>,
        image_extension: String,
        #[serde(rename = "annotation_bytes_b64", with = "b64")]
        annotation_bytes: Vec<u8>,
        image_usage_type: ImageUsageType,
    },
    UpdateModelBroadcast {
        #[serde(rename = "model_bytes_b64", with = "b64")]
        model_bytes: Vec<u8>,
    },
    /// Tagged `service_error` on the wire.
    #[serde(rename = "service_error")]
    TrainerError {
        structure_state_name: String,
        original_message_json: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrainerMessageKind {
    AddImageAnnouncement,
    UpdateModelBroadcast,
    TrainerError,
}

impl fmt::Display for TrainerMessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TrainerMessageKind::AddImageAnnouncement => "add_image_announcement",
            TrainerMessageKind::UpdateModelBroadcast => "update_model_broadcast",
            TrainerMessageKind::TrainerError => "service_error",
        })
    }
}

impl Protocol for TrainerMessage {
    type Kind = TrainerMessageKind;

    fn kind(&self) -> TrainerMessageKind {
        match self {
            TrainerMessage::AddImageAnnouncement { .. } => TrainerMessageKind::AddImageAnnouncement,
            TrainerMessage::UpdateModelBroadcast { .. } => TrainerMessageKind::UpdateModelBroadcast,
            TrainerMessage::TrainerError { .. } => TrainerMessageKind::TrainerError,
        }
    }

    fn structural_error(&self, state: &str) -> Option<Self> {
        match self {
            TrainerMessage::TrainerError { .. } => None,
            _ => Some(TrainerMessage::TrainerError {
                structure_state_name: state.to_string(),
                original_message_json: serde_json::to_string(self).unwrap_or_default(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Envelope;
    use crate::peer::PeerId;

    #[test]
    fn detect_request_wire_shape() {
        let image_id = Uuid::new_v4();
        let msg = DetectorMessage::DetectRequest {
            image_bytes: b"\x89PNG".to_vec(),
            image_extension: "png".into(),
            image_id,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "detect_request");
        assert_eq!(json["image_bytes_b64"], "iVBORw==");
        assert_eq!(json["image_id"], image_id.to_string());
    }

    #[test]
    fn envelope_flattens_message() {
        let destination = PeerId::new();
        let envelope = Envelope::new(
            destination,
            TrainerMessage::UpdateModelBroadcast {
                model_bytes: vec![1, 2, 3],
            },
        );
        let text = serde_json::to_string(&envelope).unwrap();
        let json: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(json["type"], "update_model_broadcast");
        assert_eq!(json["destination"], destination.to_string());

        let back: Envelope<TrainerMessage> = serde_json::from_str(&text).unwrap();
        assert_eq!(back, envelope);
    }

    #[test]
    fn usage_type_parses_from_wire() {
        let json = r#"{
            "type": "add_image_announcement",
            "image_bytes_b64": "AAE=",
            "image_extension": ".jpg",
            "annotation_bytes_b64": "MCAwLjUgMC41IDAuMSAwLjE=",
            "image_usage_type": "validation"
        }"#;
        let msg: TrainerMessage = serde_json::from_str(json).unwrap();
        match msg {
            TrainerMessage::AddImageAnnouncement {
                image_bytes,
                annotation_bytes,
                image_usage_type,
                ..
            } => {
                assert_eq!(image_bytes, vec![0, 1]);
                assert_eq!(annotation_bytes, b"0 0.5 0.5 0.1 0.1");
                assert_eq!(image_usage_type, ImageUsageType::Validation);
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn extension_normalization() {
        assert_eq!(normalize_extension(".jpg"), Ok("jpg"));
        assert_eq!(normalize_extension("png"), Ok("png"));
        for bad in ["", ".", "..", "../x", "a/b", "a\\b", "txt", ".TXT"] {
            assert!(normalize_extension(bad).is_err(), "{bad:?} accepted");
        }
    }

    #[test]
    fn invalid_base64_is_rejected() {
        let json = r#"{"type":"update_model_broadcast","model_bytes_b64":"***"}"#;
        assert!(serde_json::from_str::<TrainerMessage>(json).is_err());
    }

    #[test]
    fn trainer_error_is_tagged_service_error() {
        let upload = TrainerMessage::UpdateModelBroadcast {
            model_bytes: vec![1, 2],
        };
        let error = upload.structural_error("active").unwrap();
        let value = serde_json::to_value(&error).unwrap();
        assert_eq!(value["type"], "service_error");
        assert_eq!(value["structure_state_name"], "active");
        assert_eq!(error.kind().to_string(), "service_error");

        let json = r#"{"type":"service_error","structure_state_name":"s","original_message_json":"{}"}"#;
        let parsed: TrainerMessage = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.kind(), TrainerMessageKind::TrainerError);
        assert!(serde_json::from_str::<TrainerMessage>(&json.replace("service_error", "trainer_error")).is_err());
    }

    #[test]
    fn error_messages_do_not_cascade() {
        let request = DetectorMessage::DetectResponse {
            image_id: Uuid::new_v4(),
            detected_labels: vec![],
        };
        let error = request.structural_error("active").unwrap();
        match &error {
            DetectorMessage::DetectorError {
                structure_state_name,
                original_message_json,
            } => {
                assert_eq!(structure_state_name, "active");
                let original: DetectorMessage =
                    serde_json::from_str(original_message_json).unwrap();
                assert_eq!(original, request);
            }
            other => panic!("unexpected message {other:?}"),
        }
        assert!(error.structural_error("active").is_none());
    }
}

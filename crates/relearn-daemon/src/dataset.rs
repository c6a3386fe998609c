//! YOLO dataset descriptor handed to the training tool.

use anyhow::{Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatasetDescriptor {
    pub train: PathBuf,
    pub val: PathBuf,
    /// Number of classes.
    pub nc: u32,
    pub names: Vec<String>,
}

impl DatasetDescriptor {
    /// Classes are named `class_0` through `class_<classes - 1>`.
    pub fn new(train: PathBuf, val: PathBuf, classes: u32) -> Self {
        Self {
            train,
            val,
            nc: classes,
            names: (0..classes).map(|i| format!("class_{i}")).collect(),
        }
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Write to `path`, creating its parent directory.
    pub async fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        tokio::fs::write(path, self.to_yaml()?)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        tracing::info!(classes = self.nc, "Wrote dataset descriptor {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_every_class() {
        let descriptor = DatasetDescriptor::new("t/images".into(), "v/images".into(), 3);
        assert_eq!(descriptor.names, ["class_0", "class_1", "class_2"]);

        let yaml: serde_yaml::Value = serde_yaml::from_str(&descriptor.to_yaml().unwrap()).unwrap();
        assert_eq!(yaml["train"].as_str(), Some("t/images"));
        assert_eq!(yaml["val"].as_str(), Some("v/images"));
        assert_eq!(yaml["nc"].as_u64(), Some(3));
        assert_eq!(yaml["names"][2].as_str(), Some("class_2"));
    }

    #[tokio::test]
    async fn write_creates_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("yolov5/data/service_data.yaml");
        DatasetDescriptor::new("a".into(), "b".into(), 1)
            .write(&path)
            .await
            .unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("nc: 1"));
        assert!(text.contains("class_0"));
    }
}

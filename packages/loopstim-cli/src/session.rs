// Session file: run configuration, device backend and recording target

use loopstim::{DeviceConfig, PersistenceConfig, RunConfiguration};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionFile {
    pub run: RunConfiguration,

    #[serde(default)]
    pub device: DeviceConfig,

    /// Output folder and naming; omitted means no recording
    #[serde(default)]
    pub recording: Option<PersistenceConfig>,
}

impl SessionFile {
    /// Read and validate a session file
    pub fn load(path: &str) -> Result<Self, String> {
        if !Path::new(path).is_file() {
            return Err(format!("Session file not found: {}", path));
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read session file '{}': {}", path, e))?;
        let session: SessionFile = serde_json::from_str(&text)
            .map_err(|e| format!("Invalid session file '{}': {}", path, e))?;
        session.validate()?;
        Ok(session)
    }

    pub fn validate(&self) -> Result<(), String> {
        self.run.validate().map_err(|e| e.to_string())?;
        if let Some(recording) = &self.recording {
            if recording.base_name.trim().is_empty() {
                return Err("Recording base name is empty".to_string());
            }
        }
        Ok(())
    }
}

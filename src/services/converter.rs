use async_trait::async_trait;
use std::path::Path;
use tokio::process::Command;

use crate::config::ConfigError;

/// Mesh quality controls passed to the conversion engine.
///
/// Smaller values produce finer (larger) meshes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Deflection {
    pub linear: f64,
    pub angular: f64,
}

impl Deflection {
    pub fn new(linear: f64, angular: f64) -> Result<Self, ConfigError> {
        let valid = |v: f64| v.is_finite() && v > 0.0;
        if !valid(linear) || !valid(angular) {
            return Err(ConfigError::InvalidDeflection);
        }
        Ok(Self { linear, angular })
    }
}

impl Default for Deflection {
    fn default() -> Self {
        Self {
            linear: 0.1,
            angular: 0.5,
        }
    }
}

/// Opaque STEP-to-GLB conversion engine.
///
/// A single call without progress reporting. Dropping the returned future
/// must abandon the conversion.
#[async_trait]
pub trait ConversionEngine: Send + Sync {
    async fn convert(
        &self,
        input: &Path,
        output: &Path,
        deflection: Deflection,
    ) -> Result<(), ConversionError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ConversionError {
    #[error("Failed to launch converter `{command}`: {source}")]
    Launch {
        command: String,
        source: std::io::Error,
    },

    #[error("Converter exited with {status}: {stderr}")]
    Exited { status: String, stderr: String },

    #[error("Converter produced no output at {0}")]
    MissingOutput(String),

    #[error("Conversion failed: {0}")]
    Engine(String),
}

/// Runs an external converter executable as a child process:
/// `<command> <input> <output> <linear> <angular>`.
pub struct CommandEngine {
    command: String,
}

impl CommandEngine {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl ConversionEngine for CommandEngine {
    async fn convert(
        &self,
        input: &Path,
        output: &Path,
        deflection: Deflection,
    ) -> Result<(), ConversionError> {
        let result = Command::new(&self.command)
            .arg(input)
            .arg(output)
            .arg(deflection.linear.to_string())
            .arg(deflection.angular.to_string())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| ConversionError::Launch {
                command: self.command.clone(),
                source,
            })?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            return Err(ConversionError::Exited {
                status: result.status.to_string(),
                stderr: stderr.trim().chars().take(2000).collect(),
            });
        }

        if !tokio::fs::try_exists(output).await.unwrap_or(false) {
            return Err(ConversionError::MissingOutput(output.display().to_string()));
        }

        Ok(())
    }
}

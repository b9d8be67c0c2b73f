//! Source to SPIR-V compilation
//!
//! Drivers delegate source compilation to a [`ShaderCompiler`]. The stock
//! implementation shells out to `glslc` from the Vulkan SDK.

use std::env;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use log::{debug, warn};

use super::reflect::validate_spirv;
use super::{ShaderLanguage, ShaderStage};
use crate::render::error::ShaderError;

/// Compiles shader source for a single stage into SPIR-V bytes
pub trait ShaderCompiler: Send + Sync {
    /// Compile `source` for `stage`
    fn compile(
        &self,
        stage: ShaderStage,
        source: &str,
        language: ShaderLanguage,
    ) -> Result<Vec<u8>, ShaderError>;
}

/// `glslc` command line compiler
#[derive(Debug, Clone)]
pub struct GlslcCompiler {
    executable: PathBuf,
    include_dirs: Vec<PathBuf>,
}

impl GlslcCompiler {
    /// Locate `glslc` in `$VULKAN_SDK`, falling back to `PATH`
    pub fn from_env() -> Self {
        let executable = match env::var("VULKAN_SDK") {
            Ok(sdk) => {
                let path = if cfg!(target_os = "windows") {
                    Path::new(&sdk).join("Bin").join("glslc.exe")
                } else {
                    Path::new(&sdk).join("bin").join("glslc")
                };
                if path.exists() {
                    path
                } else {
                    warn!("glslc not found at {}, using PATH", path.display());
                    PathBuf::from("glslc")
                }
            }
            Err(_) => PathBuf::from("glslc"),
        };
        Self::with_executable(executable)
    }

    /// Use a specific compiler executable
    pub fn with_executable(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            include_dirs: Vec::new(),
        }
    }

    /// Add a directory searched by `#include`
    pub fn with_include_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.include_dirs.push(dir.into());
        self
    }

    /// Compiler executable
    pub fn executable(&self) -> &Path {
        &self.executable
    }

    fn stage_arg(stage: ShaderStage) -> &'static str {
        match stage {
            ShaderStage::Vertex => "-fshader-stage=vert",
            ShaderStage::Fragment => "-fshader-stage=frag",
            ShaderStage::TessellationControl => "-fshader-stage=tesc",
            ShaderStage::TessellationEvaluation => "-fshader-stage=tese",
            ShaderStage::Compute => "-fshader-stage=comp",
        }
    }
}

impl Default for GlslcCompiler {
    fn default() -> Self {
        Self::from_env()
    }
}

impl ShaderCompiler for GlslcCompiler {
    fn compile(
        &self,
        stage: ShaderStage,
        source: &str,
        language: ShaderLanguage,
    ) -> Result<Vec<u8>, ShaderError> {
        let mut command = Command::new(&self.executable);
        command
            .arg(Self::stage_arg(stage))
            .arg("-x")
            .arg(match language {
                ShaderLanguage::Glsl => "glsl",
                ShaderLanguage::Hlsl => "hlsl",
            })
            .arg("--target-env=vulkan1.0");
        for dir in &self.include_dirs {
            command.arg("-I").arg(dir);
        }
        command
            .arg("-o")
            .arg("-")
            .arg("-")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|e| match e.kind() {
            ErrorKind::NotFound => ShaderError::CompilerUnavailable,
            _ => ShaderError::Compilation {
                stage,
                diagnostic: format!("failed to run {}: {e}", self.executable.display()),
            },
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(source.as_bytes())
                .map_err(|e| ShaderError::Compilation {
                    stage,
                    diagnostic: format!("failed to write source to compiler: {e}"),
                })?;
        }

        let output = child
            .wait_with_output()
            .map_err(|e| ShaderError::Compilation {
                stage,
                diagnostic: format!("compiler did not finish: {e}"),
            })?;

        if !output.status.success() {
            return Err(ShaderError::Compilation {
                stage,
                diagnostic: format!(
                    "exit code {}: {}",
                    output.status.code().unwrap_or(-1),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }

        validate_spirv(stage, &output.stdout)?;
        debug!("Compiled {:?} shader: {} bytes", stage, output.stdout.len());
        Ok(output.stdout)
    }
}

//! Page rasterisation with ghostscript.
//!
//! A page is rendered twice: once at `tile_dpi` as the source of the tile
//! pyramid, once at `preview_dpi` as the quick-look image. Both go straight to
//! 24-bit PNG on disk; nothing is held in memory here.
//!
//! `-dBufferSpace` is raised for the large render so ghostscript bands a full
//! A0 sheet at 600 DPI instead of failing on its default band buffer.

use crate::config::PipelineConfig;
use crate::error::ToolExecutionError;
use crate::pipeline::tools::{ToolInvocation, ToolRunner};
use std::path::Path;

/// Which of the two renders to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RasterKind {
    Tiling,
    Preview,
}

impl RasterKind {
    fn dpi(self, config: &PipelineConfig) -> u32 {
        match self {
            Self::Tiling => config.tile_dpi,
            Self::Preview => config.preview_dpi,
        }
    }

    fn buffer_space(self) -> u64 {
        match self {
            Self::Tiling => 1_000_000_000,
            Self::Preview => 500_000_000,
        }
    }

    fn max_buffer(self, config: &PipelineConfig) -> usize {
        match self {
            Self::Tiling => config.raster_max_buffer,
            Self::Preview => config.preview_max_buffer,
        }
    }
}

/// Render `pdf` (a single-page document) to a PNG at `output`.
pub async fn rasterize(
    runner: &dyn ToolRunner,
    config: &PipelineConfig,
    pdf: &Path,
    output: &Path,
    kind: RasterKind,
) -> Result<(), ToolExecutionError> {
    let inv = ToolInvocation::new("gs", &config.gs_bin, config.rasterize_timeout)
        .arg("-dSAFER")
        .arg("-dBATCH")
        .arg("-dNOPAUSE")
        .arg("-sDEVICE=png16m")
        .arg(format!("-r{}", kind.dpi(config)))
        .arg(format!("-dBufferSpace={}", kind.buffer_space()))
        .arg(format!("-sOutputFile={}", output.display()))
        .arg(pdf.display().to_string())
        .max_buffer(kind.max_buffer(config));
    runner.run(inv).await?;
    if !tokio::fs::try_exists(output).await.unwrap_or(false) {
        return Err(ToolExecutionError::Transform {
            tool: "gs".into(),
            detail: format!("no raster written to {}", output.display()),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::tools::ToolOutput;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Writes a small PNG wherever `-sOutputFile=` points.
    #[derive(Default)]
    struct FakeGs {
        seen: Mutex<Vec<ToolInvocation>>,
    }

    #[async_trait]
    impl ToolRunner for FakeGs {
        async fn run(&self, inv: ToolInvocation) -> Result<ToolOutput, ToolExecutionError> {
            let out = inv.arg_value("-sOutputFile=").unwrap().to_string();
            image::RgbImage::new(30, 20).save(&out).unwrap();
            self.seen.lock().unwrap().push(inv);
            Ok(ToolOutput::default())
        }
    }

    #[tokio::test]
    async fn tiling_and_preview_use_their_own_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig::default();
        let gs = FakeGs::default();
        let hi = dir.path().join("hi.png");
        let lo = dir.path().join("lo.png");
        rasterize(&gs, &config, Path::new("p.pdf"), &hi, RasterKind::Tiling).await.unwrap();
        rasterize(&gs, &config, Path::new("p.pdf"), &lo, RasterKind::Preview).await.unwrap();

        let seen = gs.seen.lock().unwrap();
        assert_eq!(seen[0].arg_value("-r"), Some("600"));
        assert_eq!(seen[0].max_buffer, 100 * 1024 * 1024);
        assert_eq!(seen[1].arg_value("-r"), Some("150"));
        assert_eq!(seen[1].arg_value("-dBufferSpace="), Some("500000000"));
        assert_eq!(seen[0].args.last().map(String::as_str), Some("p.pdf"));
    }
}

//! qpdf: linearization, page counting and single-page extraction.
//!
//! qpdf exits with 3 when it succeeded but printed warnings, which is common
//! for CAD-exported plans; that code counts as success everywhere.

use crate::config::PipelineConfig;
use crate::error::{PipelineError, ToolExecutionError};
use crate::pipeline::tools::{ToolInvocation, ToolRunner};
use std::path::Path;

const QPDF_OK: &[i32] = &[0, 3];

fn qpdf(config: &PipelineConfig, timeout: std::time::Duration) -> ToolInvocation {
    ToolInvocation::new("qpdf", &config.qpdf_bin, timeout).success_codes(QPDF_OK)
}

/// `qpdf <input> --linearize <output>`
pub async fn linearize(
    runner: &dyn ToolRunner,
    config: &PipelineConfig,
    input: &Path,
    output: &Path,
) -> Result<(), ToolExecutionError> {
    let inv = qpdf(config, config.linearize_timeout)
        .arg(input.display().to_string())
        .arg("--linearize")
        .arg(output.display().to_string());
    runner.run(inv).await.map(|_| ())
}

/// `qpdf --show-npages <pdf>`
pub async fn page_count(
    runner: &dyn ToolRunner,
    config: &PipelineConfig,
    pdf: &Path,
) -> Result<u32, PipelineError> {
    let inv = qpdf(config, config.page_count_timeout)
        .arg("--show-npages")
        .arg(pdf.display().to_string());
    let out = runner.run(inv).await?;
    parse_page_count(&out.stdout)
}

fn parse_page_count(stdout: &str) -> Result<u32, PipelineError> {
    match stdout.trim().parse::<u32>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(PipelineError::InvalidPageCount {
            output: stdout.trim().to_string(),
        }),
    }
}

/// `qpdf <pdf> --pages <pdf> <page> -- <output>`
pub async fn extract_page(
    runner: &dyn ToolRunner,
    config: &PipelineConfig,
    pdf: &Path,
    page: u32,
    output: &Path,
) -> Result<(), ToolExecutionError> {
    let pdf = pdf.display().to_string();
    let inv = qpdf(config, config.extract_timeout)
        .arg(pdf.clone())
        .arg("--pages")
        .arg(pdf)
        .arg(page.to_string())
        .arg("--")
        .arg(output.display().to_string());
    runner.run(inv).await.map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::tools::ToolOutput;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Capture {
        calls: Mutex<Vec<ToolInvocation>>,
        stdout: String,
    }

    #[async_trait]
    impl ToolRunner for Capture {
        async fn run(&self, inv: ToolInvocation) -> Result<ToolOutput, ToolExecutionError> {
            self.calls.lock().unwrap().push(inv);
            Ok(ToolOutput {
                stdout: self.stdout.clone(),
                ..Default::default()
            })
        }
    }

    #[test]
    fn page_count_parsing() {
        assert_eq!(parse_page_count("3\n").unwrap(), 3);
        assert!(parse_page_count("0").is_err());
        assert!(matches!(
            parse_page_count("WARNING: xref"),
            Err(PipelineError::InvalidPageCount { .. })
        ));
    }

    #[tokio::test]
    async fn extract_builds_page_selection() {
        let runner = Capture::default();
        let config = PipelineConfig::default();
        extract_page(&runner, &config, Path::new("/w/lin.pdf"), 4, Path::new("/w/p4.pdf"))
            .await
            .unwrap();
        let calls = runner.calls.lock().unwrap();
        assert_eq!(
            calls[0].args,
            vec!["/w/lin.pdf", "--pages", "/w/lin.pdf", "4", "--", "/w/p4.pdf"]
        );
        assert_eq!(calls[0].timeout, config.extract_timeout);
        assert!(calls[0].success_codes.contains(&3));
    }

    #[tokio::test]
    async fn page_count_reads_stdout() {
        let runner = Capture {
            stdout: "12\n".into(),
            ..Default::default()
        };
        let n = page_count(&runner, &PipelineConfig::default(), Path::new("a.pdf"))
            .await
            .unwrap();
        assert_eq!(n, 12);
        assert_eq!(runner.calls.lock().unwrap()[0].args[0], "--show-npages");
    }
}

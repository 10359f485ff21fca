use crate::media::{ProcessOperation, ProcessOutcome, ProcessRequest, Processor};
use crate::toolkit::{list_frames, run_tool};
use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{info, warn};

const MAX_ERROR_LINES: usize = 20;

/// Processor backed by an external executable.
///
/// Invocation: `<program> [base_args..] <upscale|interpolate> --input-list <file>
/// --output-dir <dir> --batch-size <n> [--scale <s> | --factor <f>]
/// [--option key=value..]`. Produced artifacts are the frame files found in
/// the output directory afterwards.
#[derive(Debug, Clone)]
pub struct CommandProcessor {
    pub program: String,
    pub base_args: Vec<String>,
}

impl CommandProcessor {
    pub fn new(program: &str, base_args: Vec<String>) -> Self {
        Self {
            program: program.to_string(),
            base_args,
        }
    }

    fn args(&self, request: &ProcessRequest, input_list: &std::path::Path) -> Vec<String> {
        let mut args = self.base_args.clone();
        args.push(request.operation.name().to_string());
        args.push("--input-list".to_string());
        args.push(input_list.display().to_string());
        args.push("--output-dir".to_string());
        args.push(request.output_dir.display().to_string());
        args.push("--batch-size".to_string());
        args.push(request.batch_size.to_string());
        match request.operation {
            ProcessOperation::Upscale { scale } => {
                args.push("--scale".to_string());
                args.push(scale.to_string());
            }
            ProcessOperation::Interpolate { factor } => {
                args.push("--factor".to_string());
                args.push(format!("{}", factor));
            }
        }
        for (k, v) in &request.options {
            args.push("--option".to_string());
            args.push(format!("{}={}", k, v));
        }
        args
    }
}

#[async_trait]
impl Processor for CommandProcessor {
    async fn process(&self, request: &ProcessRequest) -> Result<ProcessOutcome> {
        // A previous attempt at a larger batch size may have left partial output.
        if request.output_dir.exists() {
            tokio::fs::remove_dir_all(&request.output_dir).await?;
        }
        tokio::fs::create_dir_all(&request.output_dir).await?;
        let input_list = request.output_dir.with_extension("inputs.txt");
        let listing: String = request
            .inputs
            .iter()
            .map(|p| format!("{}\n", p.display()))
            .collect();
        tokio::fs::write(&input_list, listing)
            .await
            .with_context(|| format!("cannot write {}", input_list.display()))?;

        info!(
            "[processor] {} {} input(s), batch size {}",
            request.operation.name(),
            request.inputs.len(),
            request.batch_size
        );
        let out = run_tool(&self.program, &self.args(request, &input_list), request.timeout).await?;

        let artifacts = list_frames(&request.output_dir).await?;
        let errors: Vec<String> = out
            .stderr
            .lines()
            .filter(|l| {
                let lower = l.to_ascii_lowercase();
                lower.contains("error") || lower.contains("exception")
            })
            .map(|l| l.trim().to_string())
            .rev()
            .take(MAX_ERROR_LINES)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        let success = out.success && !artifacts.is_empty();
        if out.success && artifacts.is_empty() {
            warn!("[processor] {} exited 0 but produced no artifacts", request.operation.name());
        }
        Ok(ProcessOutcome {
            success,
            artifacts,
            errors,
            exit_code: out.exit_code,
            output: out.tail(),
        })
    }
}

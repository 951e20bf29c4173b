use clap::Parser;
use model_vqa::{eval_model, Args, EvalConfig};

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    match &args.log_dir {
        Some(log_dir) => analytics_tracing::init_tracing_to_file(log_dir, &args.log_file_name()),
        None => analytics_tracing::init_tracing_to_stdout(),
    }

    let config = EvalConfig::try_from(args)?;
    let summary = eval_model(&config)?;
    tracing::info!(
        "answered {} questions, skipped {}",
        summary.answered,
        summary.skipped
    );
    Ok(())
}

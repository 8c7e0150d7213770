use crate::cli::Opt;

use strongbox::repository::*;

use anyhow::Result;

/// Rewrites every live chunk into fresh segments and retires segments left
/// empty by the rewrite, reclaiming the space held by deleted and
/// overwritten chunks.
pub async fn compact(options: Opt) -> Result<()> {
    let (backend, key) = options.open_repo_backend().await?;
    let chunk_settings = options.get_chunk_settings();
    let mut repo = Repository::with(backend, chunk_settings, key, num_cpus::get());

    let segments_before = repo.list_segments().await?.len();
    println!(
        "Repository holds {} chunks across {} segments.",
        repo.count_chunk().await,
        segments_before
    );

    let report = repo.compact().await?;
    println!(
        "Rewrote {} live chunks; retired {} of {} segments.",
        report.chunks_rewritten, report.segments_retired, report.segments_before
    );

    repo.close().await;
    Ok(())
}

use crate::cli::Opt;

use strongbox::manifest::*;
use strongbox::repository::*;

use anyhow::Result;

pub async fn info(options: Opt) -> Result<()> {
    let (backend, key) = options.open_repo_backend().await?;
    let chunk_settings = options.get_chunk_settings();
    let mut repo = Repository::with(backend, chunk_settings, key, num_cpus::get());
    let mut manifest = Manifest::load(&repo);

    let archive_count = manifest.archives().await.len();
    let chunk_count = repo.count_chunk().await;
    let last_modified = manifest.timestamp().await?;
    let settings = repo.chunk_settings();

    println!("Repository: {:?}", options.repo);
    println!("Archives: {}", archive_count);
    println!("Chunks: {}", chunk_count);
    println!("Last modified: {}", last_modified.to_rfc2822());
    println!("Compression: {:?}", settings.compression);
    println!("HMAC: {:?}", settings.hmac);

    repo.close().await;
    Ok(())
}

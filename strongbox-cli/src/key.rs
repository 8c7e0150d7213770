use crate::cli::Opt;

use strongbox::repository::*;

use anyhow::Result;

/// Prints the repository's default chunk settings, as read from its
/// manifest, without exposing any key material.
pub async fn key(options: Opt) -> Result<()> {
    let (backend, key) = options.open_repo_backend().await?;
    let chunk_settings = options.get_chunk_settings();
    let repo = Repository::with(backend, chunk_settings, key, num_cpus::get());
    let settings = repo.chunk_settings();

    println!("Compression: {:?}", settings.compression);
    println!("Encryption: {:?}", settings.encryption);
    println!("HMAC: {:?}", settings.hmac);

    repo.close().await;
    Ok(())
}

use crate::cache::Cache;
use crate::cli::Opt;

use strongbox::chunker::*;
use strongbox::manifest::driver::*;
use strongbox::manifest::target::*;
use strongbox::manifest::*;
use strongbox::repository::*;

use anyhow::Result;
use chrono::prelude::*;
use futures::future::select_all;
use std::path::PathBuf;
use tokio::task;

pub async fn create(options: Opt, target: PathBuf, name: Option<String>) -> Result<()> {
    // Open the repository
    let (backend, key) = options.open_repo_backend().await?;
    let chunk_settings = options.get_chunk_settings();
    let mut repo = Repository::with(backend, chunk_settings, key, num_cpus::get());
    repo.load_quota_used().await;
    // Make sure we have a name for the archive, defaulting to the current date/time
    let name = name.unwrap_or_else(|| {
        Local::now()
            .with_timezone(Local::now().offset())
            .to_rfc2822()
    });
    // Load the manifest and create the archive
    let mut manifest = Manifest::load(&repo);
    let cache_path = options.cache_path();
    let mut cache = Cache::load(&cache_path)?;
    cache.sync(&mut repo, &manifest.archives().await).await?;
    let archive = ActiveArchive::new(&name);
    // TOOD: Allow chunker configuration
    let chunker = FastCDC::default();
    // Load the target
    let backup_target = FileSystemTarget::new(target.to_str().unwrap());
    // Run the backup
    let paths = backup_target.backup_paths().await;
    // Here we use a VecDeque of futures to keep track of the store_object futures we
    // have created and started tasks for.
    //
    // We will fill the queue up to `max_queue_len`, and once we hit that limit, we
    // will pop off the oldest task future and `await`ing it, but only after staring
    // the next task.
    //
    // TODO (#44): The job of managing the futures here really needs to be moved into the `strongbox`
    // crate, with methods attached to BackupDriver for managing this automatically. Both to improve
    // ergonomics, as well as reducing unnessicary clones.
    let max_queue_len = 30;
    let mut task_queue = Vec::new();
    // Per-file errors are recoverable: a file strongbox can't read (permission
    // denied, vanished mid-walk, ...) is marked `E` and skipped rather than
    // aborting the whole archive, so a single bad file doesn't throw away
    // every other file already chunked and written this run.
    let mut failed = 0_usize;
    for node in paths {
        let mut repo = repo.clone();
        let archive = archive.clone();
        let backup_target = backup_target.clone();

        task_queue.push(task::spawn(async move {
            (
                node.clone(),
                backup_target
                    .store_object(&mut repo, chunker.clone(), &archive, node)
                    .await,
            )
        }));

        if task_queue.len() > max_queue_len {
            let (result, _, new_queue) = select_all(task_queue).await;
            let (node, x) = result?;
            report_stored(&node.path, x, &mut failed);
            task_queue = new_queue;
        }
    }
    // Drain any remaining futures in the queue
    for future in task_queue {
        let (node, x) = future.await.unwrap();
        report_stored(&node.path, x, &mut failed);
    }
    // Add the backup listing to the archive
    let listing = backup_target.backup_listing().await;
    archive.set_listing(listing).await;
    // Commit the backup. This happens even if some files failed above, so a
    // run that stores 999 files and fails on 1 doesn't lose the 999.
    manifest.commit_archive(&mut repo, archive).await?;
    // Bring the cache's chunk refcounts up to date with the archive just
    // committed, so a later check of dedup ratios doesn't need to re-walk
    // every archive in the repository
    cache.sync(&mut repo, &manifest.archives().await).await?;
    cache.save(&cache_path)?;
    repo.close().await;
    if failed > 0 {
        Err(anyhow::anyhow!(
            "archive saved, but {} file(s) could not be backed up",
            failed
        ))
    } else {
        Ok(())
    }
}

fn report_stored(path: &str, result: std::result::Result<(), DriverError>, failed: &mut usize) {
    match result {
        Ok(()) => println!("A {}", path),
        Err(e) => {
            *failed += 1;
            eprintln!("E {}: {}", path, e);
        }
    }
}

/*!
Serves a repository to remote clients over a length-framed RPC protocol.

Every request and response is a msgpack-encoded frame prefixed with its
length as a 4-byte big-endian integer. A request is `[msgid, method, args]`;
a response is either `[msgid, result]` or `[msgid, error, class, traceback]`.
The methods exposed mirror `Repository`'s own read/write surface.
*/
use crate::cli::Opt;
use crate::util::DynamicBackend;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use strongbox::repository::{ChunkID, CompactionReport, Repository};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

/// Methods this server is willing to dispatch over the wire, mirroring the
/// subset of `Repository` a remote client needs.
const METHODS: &[&str] = &[
    "has_chunk",
    "read_chunk",
    "write_chunk",
    "count_chunk",
    "known_chunks",
    "list_segments",
    "commit",
    "compact",
    "check",
];

/// Methods that reclaim or discard previously written data. Refused while
/// the server is running append-only.
const DESTRUCTIVE_METHODS: &[&str] = &["compact"];

/// The argument payload of a request frame. Covers every shape the exposed
/// methods need: nothing, a chunk id, or a blob of plaintext.
#[derive(Debug, Clone, Serialize, Deserialize)]
enum Args {
    None,
    Id(ChunkID),
    Data(Vec<u8>),
}

/// `[msgid, method, args]`, per the remote protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Request {
    msgid: u64,
    method: String,
    args: Args,
}

/// Either `[msgid, result]` or `[msgid, error, class, traceback]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
enum Response {
    Result {
        msgid: u64,
        result: ResultValue,
    },
    Error {
        msgid: u64,
        class: String,
        traceback: String,
    },
}

/// The result half of a successful response, tagged by the shape of data
/// the dispatched method produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
enum ResultValue {
    Unit,
    Bool(bool),
    Count(usize),
    Data(Vec<u8>),
    Chunk { id: ChunkID, new: bool },
    Ids(Vec<ChunkID>),
    Segments(Vec<u64>),
    Compaction(CompactionReport),
}

/// A dispatch failure, carrying an error class name and a human-readable
/// description, mirroring `RemoteRPCError`'s `[class, traceback]` pair.
type DispatchError = (String, String);

async fn read_frame(stream: &mut TcpStream) -> std::io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    if let Err(e) = stream.read_exact(&mut len_buf).await {
        return if e.kind() == std::io::ErrorKind::UnexpectedEof {
            Ok(None)
        } else {
            Err(e)
        };
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

async fn write_frame(stream: &mut TcpStream, payload: &[u8]) -> std::io::Result<()> {
    let len = (payload.len() as u32).to_be_bytes();
    stream.write_all(&len).await?;
    stream.write_all(payload).await?;
    stream.flush().await
}

/// Runs one request against the shared repository, translating its typed
/// result into a `ResultValue`, or refusing it outright if the method is
/// unknown, blocked by append-only, or called with the wrong argument shape.
async fn dispatch(
    repo: &Mutex<Repository<DynamicBackend>>,
    append_only: bool,
    request: &Request,
) -> std::result::Result<ResultValue, DispatchError> {
    if !METHODS.contains(&request.method.as_str()) {
        return Err((
            "PermissionError".to_string(),
            format!(
                "method {:?} is not exposed over the remote protocol",
                request.method
            ),
        ));
    }
    if append_only && DESTRUCTIVE_METHODS.contains(&request.method.as_str()) {
        return Err((
            "PermissionError".to_string(),
            format!(
                "method {:?} is disabled on an append-only server",
                request.method
            ),
        ));
    }

    match (request.method.as_str(), &request.args) {
        ("has_chunk", Args::Id(id)) => {
            let repo = repo.lock().await;
            Ok(ResultValue::Bool(repo.has_chunk(*id).await))
        }
        ("read_chunk", Args::Id(id)) => {
            let mut repo = repo.lock().await;
            let data = repo
                .read_chunk(*id)
                .await
                .map_err(|e| ("BackendError".to_string(), e.to_string()))?;
            Ok(ResultValue::Data(data))
        }
        ("write_chunk", Args::Data(data)) => {
            let mut repo = repo.lock().await;
            let (id, new) = repo
                .write_chunk(data.clone())
                .await
                .map_err(|e| ("BackendError".to_string(), e.to_string()))?;
            Ok(ResultValue::Chunk { id, new })
        }
        ("count_chunk", Args::None) => {
            let repo = repo.lock().await;
            Ok(ResultValue::Count(repo.count_chunk().await))
        }
        ("known_chunks", Args::None) => {
            let repo = repo.lock().await;
            let ids = repo.known_chunks().await.into_iter().collect();
            Ok(ResultValue::Ids(ids))
        }
        ("list_segments", Args::None) => {
            let repo = repo.lock().await;
            let segments = repo
                .list_segments()
                .await
                .map_err(|e| ("BackendError".to_string(), e.to_string()))?;
            Ok(ResultValue::Segments(segments))
        }
        ("commit", Args::None) => {
            let repo = repo.lock().await;
            repo.commit_index().await;
            Ok(ResultValue::Unit)
        }
        ("compact", Args::None) => {
            let mut repo = repo.lock().await;
            let report = repo
                .compact()
                .await
                .map_err(|e| ("BackendError".to_string(), e.to_string()))?;
            Ok(ResultValue::Compaction(report))
        }
        ("check", Args::None) => {
            let mut repo = repo.lock().await;
            Ok(ResultValue::Ids(repo.check().await))
        }
        (method, _) => Err((
            "InvalidArguments".to_string(),
            format!("method {method:?} received arguments of the wrong shape"),
        )),
    }
}

/// Services one client connection, reading and answering frames in the
/// order they arrive until the client disconnects or sends something this
/// server can't parse.
#[instrument(skip(repo), fields(%peer))]
async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    repo: Arc<Mutex<Repository<DynamicBackend>>>,
    append_only: bool,
) {
    info!("client connected");
    loop {
        let frame = match read_frame(&mut stream).await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                debug!("client closed connection");
                break;
            }
            Err(e) => {
                warn!(error = %e, "error reading frame");
                break;
            }
        };
        let request: Request = match rmp_serde::from_slice(&frame) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "received malformed frame");
                break;
            }
        };
        let msgid = request.msgid;
        let response = match dispatch(&repo, append_only, &request).await {
            Ok(result) => Response::Result { msgid, result },
            Err((class, traceback)) => Response::Error {
                msgid,
                class,
                traceback,
            },
        };
        let payload = match rmp_serde::to_vec(&response) {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, "failed to encode response");
                break;
            }
        };
        if let Err(e) = write_frame(&mut stream, &payload).await {
            warn!(error = %e, "error writing frame");
            break;
        }
    }
    info!("client disconnected");
}

/// Serves a repository over the network for remote clients.
///
/// Accepts one TCP connection per client and dispatches length-prefixed
/// `[msgid, method, args]` request frames against a single `Repository`
/// shared behind a mutex. Connections may be accepted concurrently, but the
/// repository itself only ever services one request at a time, in the order
/// its frame was decoded; since a connection's handler reads the next frame
/// without waiting for the previous response to be acknowledged by the
/// client, a client is free to pipeline several outstanding requests.
///
/// Every path a remote client is given to reach this repository is the one
/// it was started with; there is no further "allowed repository paths"
/// check to perform. `append_only` refuses any method that reclaims space
/// (currently just `compact`) with a permission error regardless of the
/// repository's own on-disk configuration. `storage_quota`, when given,
/// overrides the quota the repository loaded with for the lifetime of this
/// server.
pub async fn serve(
    options: Opt,
    bind: String,
    append_only: bool,
    storage_quota: Option<u64>,
) -> Result<()> {
    let (backend, key) = options.open_repo_backend().await?;
    let chunk_settings = options.get_chunk_settings();
    let mut repo = Repository::with(backend, chunk_settings, key, num_cpus::get());
    repo.load_quota_used().await;
    if storage_quota.is_some() {
        repo.set_storage_quota(storage_quota);
    }
    let repo = Arc::new(Mutex::new(repo));

    let listener = TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind remote protocol listener on {bind}"))?;
    info!(%bind, repo = ?options.repo, append_only, "serving repository");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted.context("failed to accept connection")?;
                let repo = Arc::clone(&repo);
                tokio::spawn(handle_connection(stream, peer, repo, append_only));
            }
            _ = tokio::signal::ctrl_c() => {
                info!("received interrupt, shutting down remote server");
                break;
            }
        }
    }

    match Arc::try_unwrap(repo) {
        Ok(repo) => repo.into_inner().close().await,
        Err(_) => warn!("shutting down with client connections still active"),
    }
    Ok(())
}

// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! `export-service`: the axum HTTP surface and process wiring for the
//! export subsystem (§2/§6). Exposes `/create-batches`, `/do-work`, and
//! `/health` for an external scheduler to drive.

mod app;
mod keys;

use std::sync::Arc;

use clap::Parser;
use diesel_async::pooled_connection::bb8::Pool;
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::AsyncPgConnection;
use export_config::Parameters;
use export_core::store::{ObjectStoreBlobStore, PgExportStore, PgExposureStore};
use export_core::{lock::PgLockService, Batcher, Context, Worker};
use object_store::{local::LocalFileSystem, ObjectStore};

/// Command-line overrides for a subset of `Parameters`; everything else is
/// read from the process environment by `Parameters::from_env` (teacher's
/// convention: `clap` handles process-level concerns like `--port`, env
/// vars handle the rest, the same split as `consensus-config::Parameters`
/// reading TOML while the node binary takes a handful of flags).
#[derive(Parser, Debug)]
#[command(name = "export-service", about = "Export subsystem HTTP service")]
struct Args {
    /// Overrides the `PORT` environment variable if set.
    #[arg(long)]
    port: Option<u16>,
}

fn build_blob_store() -> anyhow::Result<Arc<dyn ObjectStore>> {
    match std::env::var("BLOB_STORE_BACKEND").as_deref() {
        Ok("s3") => {
            let store = object_store::aws::AmazonS3Builder::from_env().build()?;
            Ok(Arc::new(store))
        }
        _ => {
            let path = std::env::var("BLOB_STORE_LOCAL_PATH").unwrap_or_else(|_| "./blob-store".to_string());
            std::fs::create_dir_all(&path)?;
            Ok(Arc::new(LocalFileSystem::new_with_prefix(path)?))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let mut parameters = Parameters::from_env()?;
    if let Some(port) = args.port {
        parameters.port = port;
    }

    let registry = prometheus::Registry::new();
    let context = Arc::new(Context::new(parameters.clone(), &registry));

    let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(&parameters.database_url);
    let pool: Pool<AsyncPgConnection> = Pool::builder().build(manager).await?;

    let export_store = Arc::new(PgExportStore::new(pool.clone()));
    let exposure_store = Arc::new(PgExposureStore::new(pool.clone()));
    let locks = PgLockService::new(pool.clone());
    let blob_store = Arc::new(ObjectStoreBlobStore::new(build_blob_store()?));
    let key_manager = Arc::new(keys::load_key_manager(parameters.signing_keys_path.as_deref())?);

    let batcher = Arc::new(Batcher::new(context.clone(), export_store.clone(), locks.clone()));
    let worker = Arc::new(Worker::new(
        context.clone(),
        export_store,
        exposure_store,
        blob_store,
        locks,
        key_manager,
    ));

    let state = Arc::new(app::AppState {
        batcher,
        worker,
        pool,
        parameters,
    });

    let addr = format!("0.0.0.0:{}", state.parameters.port);
    tracing::info!(%addr, "export-service listening");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app::router(state)).await?;

    Ok(())
}

use chunkdrive_core::Config;

// Use mimalloc as the global allocator for lower fragmentation under many
// concurrent part uploads.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let config = Config::from_env()?;

    let (_state, router, tasks) = chunkdrive_api::setup::initialize_app(config.clone()).await?;

    let served = chunkdrive_api::setup::server::start_server(&config, router).await;

    tasks.shutdown().await;
    chunkdrive_infra::shutdown_telemetry().await;

    served
}

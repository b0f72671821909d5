#![forbid(unused_must_use)]
#![deny(unsafe_code)]

mod cli;
mod daemon;

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Command};
use supdated_lib::artifact::header::Header;
use supdated_lib::artifact::{self, ParseConfig};
use supdated_lib::config::Config;
use supdated_lib::depends;
use supdated_lib::error::EngineError;
use supdated_lib::module::invoker::{InstallContext, ModuleInvoker};
use supdated_lib::module::stream_bridge::PayloadSource;
use supdated_lib::module::workdir::WorkDir;
use supdated_lib::module::PayloadInstaller;
use supdated_lib::reboot::SystemReboot;
use supdated_lib::rootfs::{FileBootEnvironment, RootfsInstaller};
use supdated_lib::state_machine::{Engine, State};
use supdated_lib::store::{Provides, ProvidesStore};

async fn run() -> Result<i32> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();
    let config = Config::load(&cli.config).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "falling back to built-in config defaults");
        Config::default()
    });
    let store = ProvidesStore::open(&config.datastore_dir)?;

    match cli.command {
        Command::ShowArtifact => {
            let provides = store.load_provides()?;
            let name = if provides.artifact_name.is_empty() {
                "Unknown".to_string()
            } else {
                provides.artifact_name
            };
            println!("{name}");
            Ok(0)
        }
        Command::ShowProvides => {
            let provides = store.load_provides()?;
            for (k, v) in provides.iter() {
                println!("{k}={v}");
            }
            Ok(0)
        }
        Command::Install(opts) => run_install(&config, &store, &opts).await,
        Command::Commit => run_commit(&config, &store).await,
        Command::Rollback => run_rollback(&config, &store).await,
        Command::Daemon => {
            tracing::info!("daemon mode requires a configured update source; none wired in this build");
            Ok(1)
        }
    }
}

/// Build the [`PayloadInstaller`] for the payload at `index` in `header`:
/// the built-in rootfs writer for `"rootfs-image"`, an external Update
/// Module invocation for everything else, matching spec §4.10's "the
/// built-in rootfs variant is dispatched the same way an external
/// module would be".
fn build_installer(
    config: &Config,
    header: &Header,
    index: usize,
    current: &Provides,
    payload_source: PayloadSource,
) -> Result<PayloadInstaller> {
    let decl = header
        .header_info
        .payloads
        .get(index)
        .ok_or_else(|| anyhow::anyhow!("no payload declaration at index {index}"))?;
    let sub = header
        .sub_headers
        .get(index)
        .ok_or_else(|| anyhow::anyhow!("no sub-header at index {index}"))?;

    if decl.payload_type == "rootfs-image" {
        let device_a = config
            .rootfs_device_a
            .clone()
            .ok_or_else(|| anyhow::anyhow!("rootfs-image payload requires rootfs_device_a configured"))?;
        let device_b = config
            .rootfs_device_b
            .clone()
            .ok_or_else(|| anyhow::anyhow!("rootfs-image payload requires rootfs_device_b configured"))?;
        let boot_env = Box::new(FileBootEnvironment::new(&config.datastore_dir, device_a, device_b));
        let payload: Box<dyn std::io::Read + Send> = match payload_source {
            PayloadSource::Files(files) => {
                let (_, path) = files
                    .into_iter()
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("rootfs-image payload has no extracted file"))?;
                Box::new(std::fs::File::open(&path).with_context(|| format!("opening extracted payload {path:?}"))?)
            }
            PayloadSource::Streamed(_) => anyhow::bail!("streaming delivery is not supported for rootfs-image"),
        };
        return Ok(PayloadInstaller::Rootfs(RootfsInstaller::new(
            boot_env,
            Box::new(SystemReboot),
            payload,
            String::new(),
        )));
    }

    let (type_info_json, meta_data_json) = WorkDir::header_json_for(sub)?;
    let header_info_json = serde_json::to_vec(&header.header_info).context("serializing header-info")?;
    let context = InstallContext {
        device_type: config.device_type.clone(),
        current: current.clone(),
        header_info_json,
        type_info_json,
        meta_data_json,
        payload_type: decl.payload_type.clone(),
        incoming_artifact_name: header.header_info.provides.artifact_name.clone(),
        incoming_artifact_group: header.header_info.provides.artifact_group.clone(),
    };
    let binary = config.modules_dir.join(&decl.payload_type);
    Ok(PayloadInstaller::Module(ModuleInvoker::new(
        binary,
        config.datastore_dir.clone(),
        index,
        context,
        config.module_timeout,
        payload_source,
        Box::new(SystemReboot),
    )))
}

async fn run_install(config: &Config, store: &ProvidesStore, opts: &cli::InstallOpts) -> Result<i32> {
    if opts.path_or_url.contains("://") {
        tracing::error!("remote artifact sources require a configured Downloader collaborator");
        return Ok(1);
    }
    tracing::info!(path = %opts.path_or_url, "installing artifact");

    let parse_config = ParseConfig::from_config(config)?;
    let file = std::fs::File::open(&opts.path_or_url).with_context(|| format!("opening artifact {}", opts.path_or_url))?;
    let extract_dir = tempfile::tempdir().context("creating payload extraction directory")?;
    let mut files_by_index: BTreeMap<usize, Vec<(String, PathBuf)>> = BTreeMap::new();
    let parsed = artifact::parse(file, &parse_config, |index, name, reader| {
        let safe_name = name.replace('/', "_");
        let path = extract_dir.path().join(format!("{index}-{safe_name}"));
        let mut out = std::fs::File::create(&path).with_context(|| format!("creating {path:?}"))?;
        std::io::copy(reader, &mut out).with_context(|| format!("extracting {name}"))?;
        files_by_index.entry(index).or_default().push((name.to_string(), path));
        Ok(())
    })?;

    if parsed.header.sub_headers.len() != 1 {
        tracing::error!(
            count = parsed.header.sub_headers.len(),
            "multi-payload artifacts are not yet supported by this build"
        );
        return Ok(1);
    }

    let current = store.load_provides()?;
    let files = files_by_index.remove(&0).unwrap_or_default();
    let mut installer = build_installer(config, &parsed.header, 0, &current, PayloadSource::Files(files))?;

    let update_name = parsed.header.header_info.provides.artifact_name.clone();
    let engine = Engine::new(store, &config.scripts_dir, config.script_timeout, &config.device_type);
    match engine.run_update(&mut installer, &parsed.header, &update_name).await {
        Ok(()) => Ok(0),
        Err(e) => {
            if matches!(e.downcast_ref::<EngineError>(), Some(EngineError::RebootRequired)) {
                if opts.reboot_exit_code {
                    tracing::warn!("manual reboot required to continue the update");
                    return Ok(4);
                }
                tracing::error!("manual reboot required but --reboot-exit-code was not set");
                return Ok(1);
            }
            Err(e)
        }
    }
}

/// Reconstruct the in-progress update's header and payload index from
/// the checkpointed [`supdated_lib::store::StateData`], for `commit`/
/// `rollback` invocations that run in a fresh process after the
/// `install` invocation exited (e.g. to wait for a manual reboot).
fn resume_header(store: &ProvidesStore) -> Result<Option<(Header, usize)>> {
    let Some(data) = store.read_state_data()? else {
        return Ok(None);
    };
    if data.state == State::Idle {
        return Ok(None);
    }
    let Some(bytes) = &data.header_json else {
        anyhow::bail!("no artifact header recorded for the in-progress update");
    };
    let header: Header = serde_json::from_slice(bytes).context("decoding checkpointed header")?;
    Ok(Some((header, data.payload_index)))
}

async fn run_commit(config: &Config, store: &ProvidesStore) -> Result<i32> {
    let Some((header, index)) = resume_header(store)? else {
        tracing::error!("{}", EngineError::NoUpdateInProgress);
        return Ok(2);
    };

    let current = store.load_provides()?;
    let mut installer = build_installer(config, &header, index, &current, PayloadSource::Files(vec![]))?;
    installer.commit().await.context("committing installer")?;

    let mut provides = current;
    for sub in &header.sub_headers {
        depends::apply_commit(&mut provides, &sub.type_info)?;
    }
    depends::apply_identity(&mut provides, &header);
    store.transaction(|txn| txn.put_provides(&provides))?;
    store.clear_state_data()?;
    Ok(0)
}

async fn run_rollback(config: &Config, store: &ProvidesStore) -> Result<i32> {
    let Some((header, index)) = resume_header(store)? else {
        tracing::error!("{}", EngineError::NoUpdateInProgress);
        return Ok(2);
    };

    let current = store.load_provides()?;
    let mut installer = build_installer(config, &header, index, &current, PayloadSource::Files(vec![]))?;
    installer.rollback(index).await.context("rolling back installer")?;
    store.clear_state_data()?;
    Ok(0)
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    match run().await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("error: {e:#}");
            std::process::exit(1);
        }
    }
}

use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use sqimg_core::domain::Grouping;
use sqimg_core::{
    format_bytes, import_image, publish_slug, Builder, Config, ControllerClient, DockerArchive,
    HttpBlobStore, LayerCache, MkSquashfs, Services,
};

mod cli;

use cli::{BuildArgs, CommandCli, ImportArgs, SlugArgs, SqimgCli};

fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = SqimgCli::parse();
    init_tracing(cli.trace, cli.verbose);

    let mut config = Config::from_env().map_err(|err| eyre!("{err:?}"))?;
    if let Some(cache) = &cli.cache {
        config = config.with_cache_root(cache.clone());
    }

    let result = match &cli.command {
        CommandCli::Build(args) => run_build(&config, args),
        CommandCli::Import(args) => run_import(&config, args),
        CommandCli::Slug(args) => run_slug(&config, args),
    };
    result.map_err(|err| eyre!("{err:?}"))
}

fn init_tracing(trace: bool, verbose: u8) {
    let level = if trace {
        "trace"
    } else {
        match verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = format!("sqimg_core={level},sqimg={level}");
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .with_writer(std::io::stderr)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn run_build(config: &Config, args: &BuildArgs) -> anyhow::Result<()> {
    let cache = LayerCache::open(&config.cache().root)?;
    let archive = DockerArchive::open(&args.archive)?;
    let packager = MkSquashfs::new(&config.packager().program);
    let grouping = Grouping::from(!args.each_diff);

    let manifest = Builder::new(&cache, &archive, &packager).build(&args.name, grouping)?;
    println!("{}", serde_json::to_string_pretty(&manifest)?);
    Ok(())
}

fn run_import(config: &Config, args: &ImportArgs) -> anyhow::Result<()> {
    let cache = LayerCache::open(&config.cache().root)?;
    let archive = DockerArchive::open(&args.archive)?;
    let packager = MkSquashfs::new(&config.packager().program);
    let blobstore = HttpBlobStore::from_config(config.blobstore())?;
    let registry = ControllerClient::from_config(config.registry())?;
    let services = Services {
        cache: &cache,
        packager: &packager,
        blobstore: &blobstore,
        blobstore_url: &config.blobstore().base_url,
        registry: &registry,
    };

    let artifact = import_image(&services, &archive, &args.name)?;
    println!("{}", serde_json::to_string_pretty(&artifact)?);
    Ok(())
}

fn run_slug(config: &Config, args: &SlugArgs) -> anyhow::Result<()> {
    let cache = LayerCache::open(&config.cache().root)?;
    let packager = MkSquashfs::new(&config.packager().program);
    let blobstore = HttpBlobStore::from_config(config.blobstore())?;
    let registry = ControllerClient::from_config(config.registry())?;
    let services = Services {
        cache: &cache,
        packager: &packager,
        blobstore: &blobstore,
        blobstore_url: &config.blobstore().base_url,
        registry: &registry,
    };

    let outcome = publish_slug(
        &services,
        &args.dir,
        &args.runner_artifact,
        args.artifact_id.as_deref(),
    )?;
    println!(
        "-----> Compiled slug size is {}",
        format_bytes(outcome.slug.length)
    );
    Ok(())
}

use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};

pub const SQIMG_HELP_TEMPLATE: &str =
    "{before-help}\nUsage:\n    {usage}\n\nCommands:\n{subcommands}\n\nGlobal options:\n{options}\n";

pub const SQIMG_BEFORE_HELP: &str = concat!(
    "sqimg ",
    env!("CARGO_PKG_VERSION"),
    " – squashfs image builder\n\n",
    "  build            Build layers for an image in a `docker save` archive and print its manifest.\n",
    "  import           Build, upload and register an image from a `docker save` archive.\n",
    "  slug             Package a directory on top of a runner artifact and register it.\n",
);

#[derive(Parser, Debug)]
#[command(
    name = "sqimg",
    author,
    version,
    disable_help_subcommand = true,
    before_help = SQIMG_BEFORE_HELP,
    help_template = SQIMG_HELP_TEMPLATE
)]
pub struct SqimgCli {
    #[arg(
        short,
        long,
        action = ArgAction::Count,
        help = "Increase logging (-vv reaches trace)",
        global = true
    )]
    pub verbose: u8,
    #[arg(long, help = "Force trace logging regardless of -v", global = true)]
    pub trace: bool,
    #[arg(
        long,
        value_name = "DIR",
        help = "Layer cache directory (overrides SQIMG_LAYER_CACHE)",
        global = true
    )]
    pub cache: Option<PathBuf>,
    #[command(subcommand)]
    pub command: CommandCli,
}

#[derive(Subcommand, Debug)]
pub enum CommandCli {
    #[command(
        about = "Build the layers of an image and print its manifest as JSON.",
        override_usage = "sqimg build <NAME> --archive <PATH> [--each-diff]"
    )]
    Build(BuildArgs),
    #[command(
        about = "Build one layer per diff, upload layers and manifest, register the artifact.",
        override_usage = "sqimg import --archive <PATH> <NAME>"
    )]
    Import(ImportArgs),
    #[command(
        about = "Package a directory as a slug layer on top of a runner artifact.",
        override_usage = "sqimg slug <DIR> --runner-artifact <ID> [--artifact-id <ID>]"
    )]
    Slug(SlugArgs),
}

#[derive(Args, Debug)]
pub struct BuildArgs {
    #[arg(value_name = "NAME", help = "Image name, name:tag or config digest")]
    pub name: String,
    #[arg(
        long,
        value_name = "PATH",
        help = "`docker save` tarball or unpacked directory"
    )]
    pub archive: PathBuf,
    #[arg(
        long,
        help = "Give every diff its own layer instead of grouping up to each tagged diff"
    )]
    pub each_diff: bool,
}

#[derive(Args, Debug)]
pub struct ImportArgs {
    #[arg(value_name = "NAME", help = "Image name, name:tag or config digest")]
    pub name: String,
    #[arg(
        long,
        value_name = "PATH",
        help = "`docker save` tarball or unpacked directory"
    )]
    pub archive: PathBuf,
}

#[derive(Args, Debug)]
pub struct SlugArgs {
    #[arg(value_name = "DIR", help = "Compiled application directory")]
    pub dir: PathBuf,
    #[arg(
        long,
        value_name = "ID",
        env = "SLUGRUNNER_ARTIFACT_ID",
        help = "Artifact whose layers the slug runs on"
    )]
    pub runner_artifact: String,
    #[arg(
        long,
        value_name = "ID",
        env = "SLUG_ARTIFACT_ID",
        help = "Id to register the slug artifact under"
    )]
    pub artifact_id: Option<String>,
}

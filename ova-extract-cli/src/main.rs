use clap::{ArgGroup, Parser, Subcommand};
use color_eyre::eyre::{eyre, WrapErr};
use ova_extract::{
    Config, ExtractArchiveJobBuilder, ExtractedArchive, Intake, S3Event, SourceArchive,
};
use std::path::PathBuf;
use tracing::debug;
use url::Url;

mod progress;

type Result<T> = color_eyre::Result<T>;

/// Extract OVA archives stored in S3 into individual S3 objects
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Operation to perform
    #[clap(subcommand)]
    command: Command,

    #[clap(flatten)]
    globals: Globals,
}

/// Arguments that apply regardless of command
#[derive(Parser, Debug)]
struct Globals {
    #[clap(flatten)]
    config: Config,

    /// Enable verbose log output
    #[clap(short = 'v', long, conflicts_with = "quiet", global = true)]
    verbose: bool,

    /// Be quiet, suppress almost all output (except errors)
    #[clap(short = 'q', long, conflicts_with = "verbose", global = true)]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Extract every archive named in an S3 event notification document
    ///
    /// Each `.ova` archive is extracted into a folder named after the archive, in the destination
    /// bucket if one is configured or otherwise next to the archive itself.  Records are processed
    /// in order and the first failure stops the whole batch.
    Process {
        /// Read the event notification JSON from this file instead of stdin
        #[clap(short = 'e', long, value_parser, value_name = "FILE")]
        event: Option<PathBuf>,
    },

    /// Extract a single OVA archive
    #[clap(group(ArgGroup::new("input").required(true)))]
    Extract {
        /// Read the archive from a file
        #[clap(short = 'f', long, value_parser, group = "input")]
        file: Option<PathBuf>,

        /// Read the archive from an S3 object, given as s3://bucket/key.ova
        #[clap(short = 's', long, value_parser, group = "input", value_name = "URL")]
        s3: Option<Url>,

        /// Read the archive from stdin.  Requires `--name`.
        #[clap(short = 't', long, group = "input", requires = "name")]
        stdin: bool,

        /// Name of the archive read from stdin, which determines the folder it's extracted to
        #[clap(long, requires = "stdin", value_name = "NAME")]
        name: Option<String>,

        /// Bucket to extract the archive into.
        ///
        /// Defaults to the configured destination bucket, then to the bucket the archive is read
        /// from.
        #[clap(long, value_name = "BUCKET")]
        target_bucket: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();

    init_logging(&args.globals);

    debug!(?args, "Parsed command line");

    match args.command {
        Command::Process { event } => process(&args.globals, event).await,
        Command::Extract {
            file,
            s3,
            stdin,
            name,
            target_bucket,
        } => {
            let source = match (file, s3, stdin, name) {
                (Some(path), _, _, _) => SourceArchive::File(path),
                (_, Some(url), _, _) => SourceArchive::from_url(&url)?,
                (_, _, true, Some(name)) => SourceArchive::Reader {
                    name,
                    reader: Box::new(std::io::stdin()),
                },
                _ => return Err(eyre!("An archive source is required")),
            };

            extract(&args.globals, source, target_bucket).await
        }
    }
}

fn init_logging(globals: &Globals) {
    use tracing_subscriber::EnvFilter;

    // Anything chattier than warnings would garble the progress bars
    let default_filter = if globals.verbose {
        "ova_extract=debug,info"
    } else if globals.quiet {
        "error"
    } else {
        "warn"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();
}

async fn process(globals: &Globals, event_path: Option<PathBuf>) -> Result<()> {
    let event = match &event_path {
        Some(path) => {
            let file = std::fs::File::open(path)
                .wrap_err_with(|| format!("Unable to open event file {}", path.display()))?;
            S3Event::from_reader(std::io::BufReader::new(file))?
        }
        None => S3Event::from_reader(std::io::stdin().lock())?,
    };

    let intake = Intake::new(globals.config.clone()).await;
    let report = progress::ExtractProgressReport::new(progress::hide_progress(globals));

    let extracted = intake.process_with_progress(&event, report).await?;

    if !globals.quiet {
        for archive in &extracted {
            print_summary(archive);
        }
    }

    Ok(())
}

async fn extract(
    globals: &Globals,
    source: SourceArchive,
    target_bucket: Option<String>,
) -> Result<()> {
    let target_bucket = target_bucket
        .or_else(|| {
            globals
                .config
                .destination_bucket_override()
                .map(str::to_string)
        })
        .or_else(|| source.bucket().map(str::to_string))
        .ok_or_else(|| {
            eyre!("A target bucket is required when the archive isn't read from S3; use --target-bucket or --destination-bucket")
        })?;

    let objstore = ova_extract::s3(globals.config.clone()).await;

    let job = progress::with_spinner(
        globals,
        format!("Checking access to {target_bucket}..."),
        ExtractArchiveJobBuilder::new(objstore, source, target_bucket).build(),
    )
    .await?;

    let report = progress::ExtractProgressReport::new(progress::hide_progress(globals));
    let extracted = job.run(report).await?;

    if !globals.quiet {
        print_summary(&extracted);
    }

    Ok(())
}

fn print_summary(extracted: &ExtractedArchive) {
    let bytes = byte_unit::Byte::from_bytes(extracted.total_object_bytes() as u128)
        .get_appropriate_unit(true);

    println!(
        "{}: extracted {} files ({bytes}) to s3://{}/{}/",
        extracted.archive,
        extracted.objects.len(),
        extracted.destination_bucket,
        extracted.base_name
    );
}

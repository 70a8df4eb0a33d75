#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::{Args, CommandFactory, Parser, Subcommand};
use std::error::Error;
use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process;

use varmask::config::StoreConfig;
use varmask::ingest::ingest;
use varmask::merge::merge_stores;
use varmask::query::{
    FederationSpec, GenomicProcessor, GenomicQuery, InfoFilter, LeafProcessor, VariantFilter,
};
use varmask::roster::PatientId;

type BoxError = Box<dyn Error + Send + Sync>;
type CliResult = Result<(), BoxError>;

#[derive(Parser)]
#[command(
    name = "varmask",
    about = "Per-variant patient bitmask store for cohort queries",
    long_about = "Builds chunked per-chromosome stores of patient zygosity masks from \
                 variant-call files, merges stores over disjoint populations, and answers \
                 genomic filters as patient or variant lists."
)]
struct Cli {
    /// Optional TOML file with store tunables
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Args)]
struct TargetArgs {
    /// Sealed store directory
    #[arg(long, value_name = "DIR", conflicts_with = "federation")]
    store: Option<PathBuf>,

    /// Federation description (TOML) combining several stores
    #[arg(long, value_name = "PATH")]
    federation: Option<PathBuf>,
}

#[derive(Args)]
struct QueryArgs {
    #[command(flatten)]
    target: TargetArgs,

    /// Explicit variant filter: contig,position,ref,alt[:het|hom|either] (repeatable)
    #[arg(long = "variant", value_name = "KEY")]
    variants: Vec<VariantFilter>,

    /// INFO filter: COL=v1,v2;COL2=lo..hi (repeatable; filters are ANDed)
    #[arg(long = "info", value_name = "FILTER")]
    info: Vec<InfoFilter>,

    /// Restrict to these patient ids (comma-separated)
    #[arg(long, value_delimiter = ',', conflicts_with = "patients_file")]
    patients: Option<Vec<PatientId>>,

    /// Restrict to the patient ids listed one per line in this file
    #[arg(long, value_name = "PATH")]
    patients_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Build a store from a manifest of variant-call files
    #[command(about = "Build a sealed store from variant-call files")]
    Ingest {
        /// Tab-separated manifest listing input files and their samples
        #[arg(value_name = "MANIFEST")]
        manifest: PathBuf,

        /// Directory to create the store in
        #[arg(long, value_name = "DIR")]
        output: PathBuf,
    },

    /// Merge two stores covering the same chromosomes
    #[command(about = "Merge two sealed stores into one")]
    Merge {
        #[arg(value_name = "FIRST")]
        first: PathBuf,

        #[arg(value_name = "SECOND")]
        second: PathBuf,

        /// Directory to create the merged store in
        #[arg(long, value_name = "DIR")]
        output: PathBuf,
    },

    /// Print the ids of patients matching every filter
    #[command(about = "List matching patient ids")]
    Query(QueryArgs),

    /// Print the variants carried by matching patients
    #[command(about = "List matching variant keys")]
    Variants(QueryArgs),

    /// Describe indexed INFO columns, or list one column's values
    #[command(about = "Inspect INFO column indexes")]
    Info {
        #[command(flatten)]
        target: TargetArgs,

        /// List the distinct values of this column
        #[arg(long)]
        column: Option<String>,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let Cli { config, command } = Cli::parse();

    let result = match command {
        Some(Commands::Ingest { manifest, output }) => run_ingest(config.as_deref(), &manifest, &output),
        Some(Commands::Merge {
            first,
            second,
            output,
        }) => run_merge(config.as_deref(), &first, &second, &output),
        Some(Commands::Query(args)) => run_query(config.as_deref(), args),
        Some(Commands::Variants(args)) => run_variants(config.as_deref(), args),
        Some(Commands::Info { target, column }) => run_info(config.as_deref(), target, column),
        None => Cli::command()
            .print_help()
            .map(|_| println!())
            .map_err(BoxError::from),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn run_ingest(config: Option<&Path>, manifest: &Path, output: &Path) -> CliResult {
    let config = StoreConfig::load(config)?;
    let summary = ingest(manifest, output, &config)?;
    println!(
        "{} patients, {} variants, {} records, {} info columns",
        summary.patients, summary.variants, summary.records, summary.info_columns
    );
    if summary.malformed_info > 0 {
        println!("{} malformed INFO fields were skipped", summary.malformed_info);
    }
    Ok(())
}

fn run_merge(config: Option<&Path>, first: &Path, second: &Path, output: &Path) -> CliResult {
    let config = StoreConfig::load(config)?;
    let summary = merge_stores(first, second, output, &config)?;
    println!(
        "{} patients ({} shared ids), {} variants over {} contigs",
        summary.patients,
        summary.overlapping_patients,
        summary.variants,
        summary.contigs.len()
    );
    Ok(())
}

fn open_target(
    config: &StoreConfig,
    target: &TargetArgs,
) -> Result<Box<dyn GenomicProcessor>, BoxError> {
    match (&target.store, &target.federation) {
        (Some(store), None) => Ok(Box::new(LeafProcessor::open(store, config)?)),
        (None, Some(description)) => Ok(FederationSpec::from_toml_path(description)?.build(config)?),
        _ => Err("pass exactly one of --store or --federation".into()),
    }
}

fn read_patient_file(path: &Path) -> Result<Vec<PatientId>, BoxError> {
    let text = fs::read_to_string(path)?;
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| {
            line.parse::<PatientId>().map_err(|_| -> BoxError {
                format!("'{}': invalid patient id '{line}'", path.display()).into()
            })
        })
        .collect()
}

fn build_query(args: QueryArgs) -> Result<(TargetArgs, GenomicQuery), BoxError> {
    let patients = match (args.patients, args.patients_file) {
        (Some(ids), _) => Some(ids),
        (None, Some(path)) => Some(read_patient_file(&path)?),
        (None, None) => None,
    };
    let query = GenomicQuery {
        patients,
        variant_filters: args.variants,
        info_filters: args.info,
    };
    Ok((args.target, query))
}

fn run_query(config: Option<&Path>, args: QueryArgs) -> CliResult {
    let config = StoreConfig::load(config)?;
    let (target, query) = build_query(args)?;
    let processor = open_target(&config, &target)?;
    let mask = processor.patient_mask(&query)?;
    let ids = processor.mask_to_ids(&mask);
    eprintln!("> {} patients match", ids.len());

    let mut out = BufWriter::new(io::stdout().lock());
    for id in ids {
        writeln!(out, "{id}")?;
    }
    out.flush()?;
    Ok(())
}

fn run_variants(config: Option<&Path>, args: QueryArgs) -> CliResult {
    let config = StoreConfig::load(config)?;
    let (target, query) = build_query(args)?;
    if !query.has_genomic_filters() {
        return Err("listing variants needs at least one --variant or --info filter".into());
    }
    let processor = open_target(&config, &target)?;
    let keys = processor.variant_list(&query)?;
    eprintln!("> {} variants match", keys.len());

    let mut out = BufWriter::new(io::stdout().lock());
    for key in keys {
        writeln!(out, "{key}")?;
    }
    out.flush()?;
    Ok(())
}

fn run_info(config: Option<&Path>, target: TargetArgs, column: Option<String>) -> CliResult {
    let config = StoreConfig::load(config)?;
    let processor = open_target(&config, &target)?;
    let mut out = BufWriter::new(io::stdout().lock());
    match column {
        Some(column) => {
            for value in processor.info_values(&column)? {
                writeln!(out, "{value}")?;
            }
        }
        None => {
            writeln!(out, "column\tcontinuous\tmin\tmax\tdescription")?;
            for meta in processor.info_columns() {
                let bound = |v: Option<f64>| v.map(|v| v.to_string()).unwrap_or_else(|| ".".into());
                writeln!(
                    out,
                    "{}\t{}\t{}\t{}\t{}",
                    meta.key,
                    meta.continuous,
                    bound(meta.min),
                    bound(meta.max),
                    meta.description.as_deref().unwrap_or(".")
                )?;
            }
        }
    }
    out.flush()?;
    Ok(())
}

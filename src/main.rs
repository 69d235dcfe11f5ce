//! Annex CLI - inspect and manage annotation package stores

use annex::config::load_config;
use annex::element::{AnnotationFilter, ElementFilter, ImportFilter, Match, MediaFilter, TimeRange, UriMatch};
use annex::idref::UriRef;
use annex::{bind, claims_for_bind, claims_for_create, create, Element, ElementType, PackageHandle, PackageRef};
use clap::{Parser, Subcommand};
use owo_colors::OwoColorize;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "annex")]
#[command(version)]
#[command(about = "Package storage backend for the Annex video annotation platform")]
#[command(long_about = r#"
Inspect and manage annotation package stores.

A store is addressed by URL: sqlite:<path>[;<package_id>], where the
optional ;package_id selects a package other than the default one.

Example usage:
  annex create --url "sqlite:film.db;review"
  annex stats --url sqlite:film.db
  annex elements --url "sqlite:film.db;review" --kind annotation
  annex annotations --url sqlite:film.db --begin-min 1000 --end-max 9000
"#)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Storage URL (falls back to annex.toml, then sqlite:annex.db)
    #[arg(short, long, global = true)]
    url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new package (initializes the store on first use)
    Create,

    /// Show element counts for the whole store
    Stats {
        /// Emit JSON instead of text
        #[arg(short, long)]
        json: bool,
    },

    /// List the packages stored at this location
    Packages,

    /// List the elements of the addressed package
    Elements {
        /// Only list elements of this kind
        #[arg(short, long)]
        kind: Option<String>,

        /// Emit JSON instead of text
        #[arg(short, long)]
        json: bool,
    },

    /// List annotations, with optional time and media filters
    Annotations {
        /// Only annotations with begin >= this value
        #[arg(long)]
        begin_min: Option<u64>,

        /// Only annotations with begin <= this value
        #[arg(long)]
        begin_max: Option<u64>,

        /// Only annotations with end >= this value
        #[arg(long)]
        end_min: Option<u64>,

        /// Only annotations with end <= this value
        #[arg(long)]
        end_max: Option<u64>,

        /// Only annotations on this media (absolute uri-ref, `uri#id`)
        #[arg(long)]
        media: Option<String>,

        /// Emit JSON instead of text
        #[arg(short, long)]
        json: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let url = resolve_url(cli.url)?;

    match cli.command {
        Commands::Create => {
            if !claims_for_create(&url) {
                anyhow::bail!("cannot create a package at {} (already present, or the path is not writable)", url);
            }
            let handle = create(&PackageRef::new(&url), false, None)?;
            println!("{} created package {:?} at {}", "✓".green(), handle.package_id(), url);
            handle.close()?;
        }

        Commands::Stats { json } => {
            let handle = open(&url)?;
            let stats = handle.backend().stats()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("{} ({})", "Annex store".bold(), url);
                println!("{}", stats);
            }
            handle.close()?;
        }

        Commands::Packages => {
            let handle = open(&url)?;
            for id in handle.backend().packages()? {
                if id.is_empty() {
                    println!("{}", "(default)".dimmed());
                } else {
                    println!("{}", id);
                }
            }
            handle.close()?;
        }

        Commands::Elements { kind, json } => {
            let handle = open(&url)?;
            let kind = kind.map(|k| k.parse::<ElementType>()).transpose()?;
            let elements = collect_elements(&handle, kind);
            if json {
                println!("{}", serde_json::to_string_pretty(&elements)?);
            } else {
                if elements.is_empty() {
                    println!("∅ No elements found.");
                }
                for e in elements {
                    print_element(&e);
                }
            }
            handle.close()?;
        }

        Commands::Annotations {
            begin_min,
            begin_max,
            end_min,
            end_max,
            media,
            json,
        } => {
            let handle = open(&url)?;
            let media = media.map(|m| UriRef::parse(&m)).transpose()?;
            let filter = AnnotationFilter {
                id: Match::Any,
                media: match &media {
                    Some(m) => UriMatch::Exact(m),
                    None => UriMatch::Any,
                },
                begin: TimeRange::between(begin_min, begin_max),
                end: TimeRange::between(end_min, end_max),
            };
            let pkg = handle.package_id().to_string();
            let annotations: Vec<Element> = handle
                .backend()
                .iter_annotations(&[pkg.as_str()], filter)
                .collect();
            if json {
                println!("{}", serde_json::to_string_pretty(&annotations)?);
            } else {
                if annotations.is_empty() {
                    println!("∅ No annotations found.");
                }
                for e in annotations {
                    print_element(&e);
                }
            }
            handle.close()?;
        }
    }

    Ok(())
}

fn resolve_url(arg: Option<String>) -> anyhow::Result<String> {
    if let Some(url) = arg {
        return Ok(url);
    }
    if let Some(config) = load_config(None)? {
        if let Some(url) = config.url {
            return Ok(url);
        }
    }
    Ok("sqlite:annex.db".to_string())
}

fn open(url: &str) -> anyhow::Result<PackageHandle> {
    if !claims_for_bind(url) {
        anyhow::bail!("no package at {} (is the store initialized?)", url);
    }
    Ok(bind(&PackageRef::new(url), false, None)?)
}

fn collect_elements(handle: &PackageHandle, kind: Option<ElementType>) -> Vec<Element> {
    let backend = handle.backend();
    let pkg = handle.package_id();
    let pkgs = [pkg];
    let kinds: Vec<ElementType> = match kind {
        Some(k) => vec![k],
        None => ElementType::all().to_vec(),
    };
    let mut elements = Vec::new();
    for kind in kinds {
        match kind {
            ElementType::Media => {
                elements.extend(backend.iter_medias(&pkgs, MediaFilter::default()))
            }
            ElementType::Annotation => {
                elements.extend(backend.iter_annotations(&pkgs, AnnotationFilter::default()))
            }
            ElementType::Import => {
                elements.extend(backend.iter_imports(&pkgs, ImportFilter::default()))
            }
            ElementType::Relation => {
                elements.extend(backend.iter_relations(&pkgs, ElementFilter::default()))
            }
            ElementType::View => elements.extend(backend.iter_views(&pkgs, ElementFilter::default())),
            ElementType::Resource => {
                elements.extend(backend.iter_resources(&pkgs, ElementFilter::default()))
            }
            ElementType::Tag => elements.extend(backend.iter_tags(&pkgs, ElementFilter::default())),
            ElementType::List => elements.extend(backend.iter_lists(&pkgs, ElementFilter::default())),
            ElementType::Query => {
                elements.extend(backend.iter_queries(&pkgs, ElementFilter::default()))
            }
        }
    }
    elements
}

fn print_element(e: &Element) {
    use annex::ElementData;
    let kind = e.element_type();
    match &e.data {
        ElementData::Media { url } => {
            println!("- [{}] {} ({})", kind.bold(), e.id, url.dimmed());
        }
        ElementData::Annotation { media, begin, end } => {
            println!(
                "- [{}] {} ({} @ {}..{})",
                kind.bold(),
                e.id,
                media,
                begin,
                end
            );
        }
        ElementData::Import { url, uri } => {
            let target = if uri.is_empty() { url } else { uri };
            println!("- [{}] {} -> {}", kind.bold(), e.id, target.dimmed());
        }
        _ => {
            println!("- [{}] {}", kind.bold(), e.id);
        }
    }
}

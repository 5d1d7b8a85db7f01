use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;

/// Geohash tools and elevation backend queries
#[derive(Parser)]
#[command(name = "georelay")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Elevation backend base URL
    #[arg(
        short,
        long,
        env = "ELEV_BASE",
        default_value = "http://localhost:5000",
        global = true
    )]
    base: String,

    /// Elevation dataset
    #[arg(short, long, env = "ELEV_DATASET", default_value = "mapzen", global = true)]
    dataset: String,

    /// Backend timeout in milliseconds
    #[arg(long, env = "ELEV_TIMEOUT_MS", default_value = "10000", global = true)]
    timeout_ms: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Decode a geohash to its cell centre
    Decode {
        /// Geohash token
        geohash: String,

        /// Output result as JSON, with the cell bounds
        #[arg(short, long)]
        json: bool,
    },

    /// Encode a coordinate as a geohash
    Encode {
        /// Latitude in decimal degrees
        #[arg(long)]
        lat: f64,

        /// Longitude in decimal degrees
        #[arg(long)]
        lon: f64,

        /// Number of characters
        #[arg(short, long, default_value = "9")]
        precision: usize,
    },

    /// Query elevations for a batch of locations
    Query {
        /// `|`-delimited geohashes or `lat,lng` pairs
        locations: String,

        /// Pretty-print the response body
        #[arg(short, long)]
        pretty: bool,
    },

    /// Add elevations to every row of a CSV file
    Batch {
        /// Input CSV file
        input: PathBuf,

        /// Output file (defaults to `<input>_elevation.csv`)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Column holding geohashes; takes precedence over lat/lon columns
        #[arg(long)]
        geohash_col: Option<String>,

        /// Column name for latitude
        #[arg(long, default_value = "lat")]
        lat_col: String,

        /// Column name for longitude
        #[arg(long, default_value = "lon")]
        lon_col: String,

        /// Locations per backend call
        #[arg(long, default_value = "100")]
        chunk_size: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let backend = commands::Backend {
        base: cli.base,
        dataset: cli.dataset,
        timeout_ms: cli.timeout_ms,
    };

    match cli.command {
        Commands::Decode { geohash, json } => commands::decode::run(&geohash, json),
        Commands::Encode {
            lat,
            lon,
            precision,
        } => commands::encode::run(lat, lon, precision),
        Commands::Query { locations, pretty } => {
            commands::query::run(&backend, &locations, pretty).await
        }
        Commands::Batch {
            input,
            output,
            geohash_col,
            lat_col,
            lon_col,
            chunk_size,
        } => {
            let columns = match geohash_col {
                Some(name) => commands::batch::Columns::Geohash(name),
                None => commands::batch::Columns::LatLon {
                    lat: lat_col,
                    lon: lon_col,
                },
            };
            commands::batch::run(&backend, input, output, columns, chunk_size).await
        }
    }
}

use anyhow::{bail, Context, Result};
use georelay::{geohash, repackage, LatLng};
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::Value;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use super::Backend;

/// Where the locations come from in each CSV row.
#[derive(Debug, Clone)]
pub enum Columns {
    Geohash(String),
    LatLon { lat: String, lon: String },
}

/// A CSV row and the point it asks about, if it parsed.
struct Row {
    record: csv::StringRecord,
    point: Option<LatLng>,
}

pub async fn run(
    backend: &Backend,
    input: PathBuf,
    output: Option<PathBuf>,
    columns: Columns,
    chunk_size: usize,
) -> Result<()> {
    let client = backend.client()?;
    let (headers, rows) = read_rows(&input, &columns)?;

    let skipped = rows.iter().filter(|r| r.point.is_none()).count();
    if skipped > 0 {
        eprintln!("Skipping {skipped} row(s) with invalid locations");
    }

    let pb = ProgressBar::new(rows.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})",
            )?
            .progress_chars("#>-"),
    );

    let mut elevations = vec![String::new(); rows.len()];
    let valid: Vec<(usize, LatLng)> = rows
        .iter()
        .enumerate()
        .filter_map(|(i, row)| row.point.map(|p| (i, p)))
        .collect();
    pb.inc(skipped as u64);

    for chunk in valid.chunks(chunk_size.max(1)) {
        let points: Vec<LatLng> = chunk.iter().map(|(_, p)| *p).collect();
        let response = client.query(&points, None).await;
        if !response.is_success() {
            bail!(
                "Backend returned {}: {}",
                response.status,
                String::from_utf8_lossy(&response.body)
            );
        }

        let values = repackage::align_elevations(&points, &response.body)
            .context("Backend returned an unreadable body")?;
        for ((index, _), value) in chunk.iter().zip(values) {
            elevations[*index] = elevation_cell(&value);
        }
        pb.inc(chunk.len() as u64);
    }
    pb.finish_with_message("done");

    let output_path = output.unwrap_or_else(|| default_output(&input));
    let output_file = File::create(&output_path).context("Failed to create output file")?;
    let mut writer = csv::Writer::from_writer(BufWriter::new(output_file));

    let mut new_headers: Vec<&str> = headers.iter().collect();
    new_headers.push("elevation");
    writer.write_record(&new_headers)?;

    for (row, elevation) in rows.iter().zip(&elevations) {
        let mut new_record: Vec<&str> = row.record.iter().collect();
        new_record.push(elevation);
        writer.write_record(&new_record)?;
    }
    writer.flush()?;

    println!("Output written to: {}", output_path.display());
    Ok(())
}

fn read_rows(input: &Path, columns: &Columns) -> Result<(csv::StringRecord, Vec<Row>)> {
    let file = File::open(input).context("Failed to open input file")?;
    let mut reader = csv::Reader::from_reader(BufReader::new(file));
    let headers = reader.headers()?.clone();

    let column = |name: &str| {
        headers
            .iter()
            .position(|h| h == name)
            .with_context(|| format!("Column '{}' not found in CSV", name))
    };

    let locate: Box<dyn Fn(&csv::StringRecord) -> Option<LatLng>> = match columns {
        Columns::Geohash(name) => {
            let idx = column(name)?;
            Box::new(move |record| {
                let (lat, lng) = geohash::decode(record.get(idx)?).ok()?;
                Some(LatLng::new(lat, lng))
            })
        }
        Columns::LatLon { lat, lon } => {
            let lat_idx = column(lat)?;
            let lon_idx = column(lon)?;
            Box::new(move |record| {
                let lat: f64 = record.get(lat_idx)?.trim().parse().ok()?;
                let lng: f64 = record.get(lon_idx)?.trim().parse().ok()?;
                Some(LatLng::new(lat, lng))
            })
        }
    };

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let point = locate(&record);
        rows.push(Row { record, point });
    }
    Ok((headers, rows))
}

fn default_output(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "batch".to_string());
    input.with_file_name(format!("{}_elevation.csv", stem))
}

fn elevation_cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

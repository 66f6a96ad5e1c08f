use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::Parser;
use photoscenery_shared::AcquisitionMode;

use crate::geodesy::MAX_SIZE_ID;

/// Command line surface of the engine.
#[derive(Parser, Debug, Clone)]
#[command(name = "photoscenery", about = "Orthophoto scenery acquisition engine")]
pub struct Args {
    /// Run the HTTP control plane, optionally on a specific port.
    #[arg(long, value_name = "PORT", num_args = 0..=1, default_missing_value = "8000")]
    pub http: Option<u16>,

    /// Acquisition radius in nautical miles.
    #[arg(long, default_value_t = 10.0)]
    pub radius: f64,

    /// Resolution class 0..6 (512..32768 px).
    #[arg(long, default_value_t = 4)]
    pub size: u8,

    /// Overwrite policy: 0 keep, 1 replace when larger, 2 always replace.
    #[arg(long, default_value_t = 1)]
    pub over: u8,

    /// Minimum resolution class after adaptive reduction.
    #[arg(long, default_value_t = 0)]
    pub sdwn: u8,

    /// Map server ID.
    #[arg(long, default_value_t = 1)]
    pub map: u32,

    /// Center on an airport by ICAO code.
    #[arg(long)]
    pub icao: Option<String>,

    /// Center latitude in degrees.
    #[arg(long)]
    pub lat: Option<f64>,

    /// Center longitude in degrees.
    #[arg(long)]
    pub lon: Option<f64>,

    /// Explicit bounding box, lower-left corner.
    #[arg(long)]
    pub latll: Option<f64>,
    #[arg(long)]
    pub lonll: Option<f64>,

    /// Explicit bounding box, upper-right corner.
    #[arg(long)]
    pub latur: Option<f64>,
    #[arg(long)]
    pub lonur: Option<f64>,

    /// Acquire a single tile by packed ID.
    #[arg(long)]
    pub tile: Option<u64>,

    /// Download attempts per chunk.
    #[arg(long, default_value_t = 3)]
    pub attempts: u32,

    /// Base HTTP timeout per attempt, seconds.
    #[arg(long, default_value_t = 20)]
    pub timeout: u64,

    /// HTTP proxy as IP:PORT.
    #[arg(long)]
    pub proxy: Option<String>,

    /// Scenery output tree.
    #[arg(long, default_value = "./Orthophotos")]
    pub path: PathBuf,

    /// Cache/backup tree; defaults to "<path>-saved".
    #[arg(long)]
    pub save: Option<PathBuf>,

    /// Disable the backup tree (placements never keep the old file).
    #[arg(long, default_value_t = false)]
    pub nosave: bool,

    /// Store final tiles as PNG instead of DDS.
    #[arg(long, default_value_t = false)]
    pub png: bool,

    /// Log verbosity: 0 errors, 1 info, 2 debug.
    #[arg(long, default_value_t = 1)]
    pub logger: u8,

    /// Extra debug level for development runs.
    #[arg(long, default_value_t = 0)]
    pub debug: u8,

    /// Direction-aware acquisition (needs a live position source).
    #[arg(long, default_value_t = false)]
    pub daa: bool,

    /// Download worker count.
    #[arg(long, default_value_t = 8)]
    pub workers: usize,

    /// Optional JSON file with map server records.
    #[arg(long)]
    pub servers: Option<PathBuf>,

    /// Optional JSON file mapping ICAO codes to coordinates.
    #[arg(long)]
    pub airports: Option<PathBuf>,
}

/// Validated engine configuration. Every option is enumerated; unknown
/// values fail at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub radius: f64,
    pub size: u8,
    pub over: u8,
    pub sdwn: u8,
    pub map: u32,
    pub path: PathBuf,
    pub save: Option<PathBuf>,
    pub nosave: bool,
    pub png: bool,
    pub timeout: u64,
    pub attempts: u32,
    pub proxy: Option<String>,
    pub mode: AcquisitionMode,
    pub workers: usize,
    pub precover_gap: u8,
    pub daa_priority_frac: f64,
    /// Assembly monitor scan interval, seconds.
    pub monitor_interval: u64,
    /// Minimum staged-file size for assembly grouping, bytes.
    pub min_chunk_bytes: u64,
    pub retry_backoff_base: f64,
    pub retry_max_sleep: f64,
    pub retry_timeout_cap: f64,
    pub retry_timeout_factor: f64,
    pub max_redirects: u32,
    /// Cache index rescan period, seconds.
    pub rescan_interval: u64,
    /// Quiet interval with pending == 0 before a job is declared done, s.
    pub grace_secs: u64,
    /// Hard per-job timeout, seconds.
    pub job_timeout: u64,
    pub http_port: Option<u16>,
    pub servers_file: Option<PathBuf>,
    pub airports_file: Option<PathBuf>,
    pub logger: u8,
    pub debug: u8,
}

impl Config {
    pub fn from_args(args: &Args) -> Result<Self> {
        if args.size > MAX_SIZE_ID {
            bail!("--size must be 0..=6, got {}", args.size);
        }
        if args.over > 2 {
            bail!("--over must be 0, 1 or 2, got {}", args.over);
        }
        if args.sdwn > MAX_SIZE_ID {
            bail!("--sdwn must be 0..=6, got {}", args.sdwn);
        }
        if args.sdwn > args.size {
            bail!("--sdwn ({}) cannot exceed --size ({})", args.sdwn, args.size);
        }
        if args.radius <= 0.0 {
            bail!("--radius must be positive");
        }
        if args.attempts == 0 {
            bail!("--attempts must be at least 1");
        }
        if args.workers == 0 {
            bail!("--workers must be at least 1");
        }
        if args.logger > 2 {
            bail!("--logger must be 0, 1 or 2");
        }

        Ok(Config {
            radius: args.radius,
            size: args.size,
            over: args.over,
            sdwn: args.sdwn,
            map: args.map,
            path: args.path.clone(),
            save: Some(
                args.save
                    .clone()
                    .unwrap_or_else(|| default_save_root(&args.path)),
            ),
            nosave: args.nosave,
            png: args.png,
            timeout: args.timeout.max(1),
            attempts: args.attempts,
            proxy: args.proxy.clone(),
            mode: if args.daa {
                AcquisitionMode::Daa
            } else {
                AcquisitionMode::Manual
            },
            workers: args.workers,
            precover_gap: 2,
            daa_priority_frac: 0.35,
            monitor_interval: 2,
            min_chunk_bytes: 64,
            retry_backoff_base: 2.0,
            retry_max_sleep: 30.0,
            retry_timeout_cap: 120.0,
            retry_timeout_factor: 1.5,
            max_redirects: 5,
            rescan_interval: 300,
            grace_secs: 5,
            job_timeout: 600,
            http_port: args.http,
            servers_file: args.servers.clone(),
            airports_file: args.airports.clone(),
            logger: args.logger,
            debug: args.debug,
        })
    }

    /// The backup tree root ("<path>-saved" unless overridden).
    pub fn save_root(&self) -> PathBuf {
        self.save
            .clone()
            .unwrap_or_else(|| default_save_root(&self.path))
    }

    /// Staging directory for chunk downloads.
    pub fn staging_dir(&self) -> PathBuf {
        self.save_root().join("tmp")
    }

    /// Extension of placed tiles.
    pub fn tile_ext(&self) -> &'static str {
        if self.png { "png" } else { "dds" }
    }
}

fn default_save_root(path: &PathBuf) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push("-saved");
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> Result<Config> {
        let mut full = vec!["photoscenery"];
        full.extend_from_slice(argv);
        let args = Args::try_parse_from(full)?;
        Config::from_args(&args)
    }

    #[test]
    fn defaults_are_valid() {
        let cfg = parse(&[]).unwrap();
        assert_eq!(cfg.size, 4);
        assert_eq!(cfg.workers, 8);
        assert_eq!(cfg.mode, AcquisitionMode::Manual);
        assert_eq!(cfg.save_root(), PathBuf::from("./Orthophotos-saved"));
        assert_eq!(cfg.staging_dir(), PathBuf::from("./Orthophotos-saved/tmp"));
        assert_eq!(cfg.tile_ext(), "dds");
        assert!(cfg.http_port.is_none());
    }

    #[test]
    fn http_flag_with_and_without_port() {
        let cfg = parse(&["--http"]).unwrap();
        assert_eq!(cfg.http_port, Some(8000));
        let cfg = parse(&["--http=9001"]).unwrap();
        assert_eq!(cfg.http_port, Some(9001));
    }

    #[test]
    fn rejects_out_of_range_options() {
        assert!(parse(&["--size", "7"]).is_err());
        assert!(parse(&["--over", "3"]).is_err());
        assert!(parse(&["--sdwn", "9"]).is_err());
        assert!(parse(&["--size", "2", "--sdwn", "3"]).is_err());
        assert!(parse(&["--radius", "0"]).is_err());
        assert!(parse(&["--attempts", "0"]).is_err());
        assert!(parse(&["--workers", "0"]).is_err());
        assert!(parse(&["--logger", "5"]).is_err());
    }

    #[test]
    fn daa_and_png_toggles() {
        let cfg = parse(&["--daa", "--png"]).unwrap();
        assert_eq!(cfg.mode, AcquisitionMode::Daa);
        assert_eq!(cfg.tile_ext(), "png");
    }
}

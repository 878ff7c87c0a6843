use clap::Parser;
use std::path::PathBuf;

/// Download every segment of an HLS playlist concurrently.
#[derive(Parser, Debug)]
#[command(name = "segfetch", version, about, long_about = None)]
pub struct Args {
    /// Playlist URL (media or master playlist)
    pub url: String,

    /// Directory receiving the segments
    #[arg(short, long, default_value = "segments")]
    pub output_dir: PathBuf,

    /// Concatenate the downloaded segments into this file
    #[arg(long, value_name = "FILE")]
    pub concat: Option<PathBuf>,

    /// Configuration file (TOML)
    #[arg(long, env = "SEGFETCH_CONFIG")]
    pub config: Option<PathBuf>,

    /// Total concurrent connections
    #[arg(short = 'c', long)]
    pub connections: Option<usize>,

    /// Concurrent connections per host
    #[arg(long)]
    pub connections_per_host: Option<usize>,

    /// Transfer retries per segment
    #[arg(short, long)]
    pub retries: Option<u32>,

    /// Base retry interval in milliseconds
    #[arg(long)]
    pub retry_interval_ms: Option<u64>,

    /// Connect timeout in seconds
    #[arg(long)]
    pub connect_timeout: Option<u64>,

    /// Socket read timeout in seconds
    #[arg(short, long)]
    pub timeout: Option<u64>,

    #[arg(long)]
    pub user_agent: Option<String>,

    /// Extra request header, `Name: Value`; repeatable
    #[arg(short = 'H', long = "header", value_name = "HEADER")]
    pub headers: Vec<String>,

    /// Enable debug logging
    #[arg(short, long, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Only log errors
    #[arg(short, long)]
    pub quiet: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_repeated_headers() {
        let args = Args::try_parse_from([
            "segfetch",
            "http://example.com/index.m3u8",
            "-H",
            "Referer: http://example.com",
            "-H",
            "Cookie: a=b",
            "--concat",
            "out.ts",
        ])
        .unwrap();
        assert_eq!(args.headers.len(), 2);
        assert_eq!(args.output_dir, PathBuf::from("segments"));
        assert_eq!(args.concat, Some(PathBuf::from("out.ts")));
    }

    #[test]
    fn verbose_and_quiet_conflict() {
        assert!(Args::try_parse_from(["segfetch", "http://x/a.m3u8", "-v", "-q"]).is_err());
    }
}

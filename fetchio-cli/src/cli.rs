use std::path::PathBuf;

use clap::{Args as ClapArgs, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "fetchio",
    author,
    version,
    about = "Download model repositories over HTTP/3, HTTP/2, or HTTP/1.1",
    long_about = None
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct CommonOpts {
    /// Registry API token (falls back to the HF_TOKEN environment variable)
    #[arg(long)]
    pub token: Option<String>,

    /// Force a protocol version instead of negotiating
    #[arg(long, value_parser = ["h3", "h2", "http/1.1"])]
    pub protocol: Option<String>,

    /// Mirror base URL substituted for https://huggingface.co
    #[arg(long)]
    pub mirror: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show summary information about a repository
    Info {
        /// Repository identifier, e.g. `openai/whisper-large-v3`
        model_id: String,

        #[command(flatten)]
        common: CommonOpts,
    },

    /// List the files of a repository
    List {
        model_id: String,

        /// Emit the listing as JSON
        #[arg(long)]
        json: bool,

        #[command(flatten)]
        common: CommonOpts,
    },

    /// Download an entire repository
    Download {
        model_id: String,

        /// Destination directory (defaults to the current directory)
        #[arg(default_value = ".")]
        dir: PathBuf,

        /// Number of download workers
        #[arg(long, default_value_t = 4)]
        threads: usize,

        /// Stream buffer size in KiB
        #[arg(long, value_name = "KIB", default_value_t = 512)]
        buffer_size: usize,

        /// Content-addressed dedup cache directory
        #[arg(long, value_name = "DIR")]
        cache_dir: Option<PathBuf>,

        #[command(flatten)]
        common: CommonOpts,
    },

    /// Download a single file from a repository
    File {
        model_id: String,

        /// Listing-relative path of the file
        filename: String,

        /// Stream buffer size in KiB
        #[arg(long, value_name = "KIB", default_value_t = 512)]
        buffer_size: usize,

        #[command(flatten)]
        common: CommonOpts,
    },

    /// Probe a URL and report the negotiated protocol
    #[command(name = "http3-test")]
    Http3Test {
        url: String,

        #[command(flatten)]
        common: CommonOpts,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_download_with_flags() {
        let args = Args::parse_from([
            "fetchio",
            "download",
            "org/model",
            "out",
            "--threads",
            "8",
            "--buffer-size",
            "1024",
            "--protocol",
            "h2",
            "--mirror",
            "https://hf-mirror.com",
        ]);
        match args.command {
            Commands::Download {
                model_id,
                dir,
                threads,
                buffer_size,
                common,
                ..
            } => {
                assert_eq!(model_id, "org/model");
                assert_eq!(dir, PathBuf::from("out"));
                assert_eq!(threads, 8);
                assert_eq!(buffer_size, 1024);
                assert_eq!(common.protocol.as_deref(), Some("h2"));
                assert_eq!(common.mirror.as_deref(), Some("https://hf-mirror.com"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_protocol() {
        assert!(
            Args::try_parse_from(["fetchio", "http3-test", "https://x", "--protocol", "spdy"])
                .is_err()
        );
    }

    #[test]
    fn file_requires_two_positionals() {
        assert!(Args::try_parse_from(["fetchio", "file", "org/model"]).is_err());
        assert!(Args::try_parse_from(["fetchio", "file", "org/model", "weights.bin"]).is_ok());
    }
}

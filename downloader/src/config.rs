/// Command-line and environment configuration.
///
/// Every option can also come from a `BATCHGET_*` environment variable;
/// `main` loads `.env` before parsing.
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use batchget_shared::{
    BatchError, BatchResult, Credentials, QueueMode, TransferRequest, TransferTask, UploadMethod,
};
use clap::builder::BoolishValueParser;
use clap::Parser;
use percent_encoding::percent_decode_str;
use reqwest::Url;
use tracing::{error, warn};

#[derive(Parser, Debug)]
#[command(
    name = "batchget",
    author,
    version,
    about = "Download or upload a batch of URLs",
    long_about = None
)]
pub struct Args {
    /// URLs to transfer
    #[arg(required = true, value_name = "URL")]
    pub urls: Vec<String>,

    /// Username for server authentication
    #[arg(short, long, env = "BATCHGET_USER")]
    pub user: Option<String>,

    /// Password for server authentication
    #[arg(short, long, env = "BATCHGET_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Proxy URL, e.g. http://proxy:3128
    #[arg(long, env = "BATCHGET_PROXY")]
    pub proxy: Option<String>,

    /// Username for proxy authentication
    #[arg(long, env = "BATCHGET_PROXY_USER")]
    pub proxy_user: Option<String>,

    /// Password for proxy authentication
    #[arg(long, env = "BATCHGET_PROXY_PASSWORD", hide_env_values = true)]
    pub proxy_password: Option<String>,

    /// Run one transfer at a time instead of all at once
    #[arg(long, env = "BATCHGET_SERIAL", value_parser = BoolishValueParser::new())]
    pub serial: bool,

    /// Upload FILE to every URL with PUT
    #[arg(long, env = "BATCHGET_PUT", value_name = "FILE", conflicts_with = "post")]
    pub put: Option<PathBuf>,

    /// Upload FILE to every URL with POST
    #[arg(long, env = "BATCHGET_POST", value_name = "FILE")]
    pub post: Option<PathBuf>,

    /// Directory downloads are saved to
    #[arg(short, long, env = "BATCHGET_OUTPUT_DIR", default_value = ".")]
    pub output_dir: PathBuf,

    /// User-Agent header sent with every request
    #[arg(
        long,
        env = "BATCHGET_USER_AGENT",
        default_value = concat!("batchget/", env!("CARGO_PKG_VERSION"))
    )]
    pub user_agent: String,

    /// Print final queue statistics as JSON on stdout
    #[arg(long, env = "BATCHGET_SUMMARY_JSON", value_parser = BoolishValueParser::new())]
    pub summary_json: bool,
}

/// Validated run configuration.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub urls: Vec<String>,
    pub mode: QueueMode,
    pub credentials: Credentials,
    pub proxy: Option<String>,
    pub proxy_credentials: Credentials,
    pub upload: Option<(PathBuf, UploadMethod)>,
    pub output_dir: PathBuf,
    pub user_agent: String,
    pub summary_json: bool,
}

impl RunConfig {
    pub fn from_args(args: Args) -> BatchResult<Self> {
        if let Some(proxy) = &args.proxy {
            Url::parse(proxy)
                .map_err(|e| BatchError::Config(format!("Invalid proxy URL {}: {}", proxy, e)))?;
        }

        let upload = match (args.put, args.post) {
            (Some(file), None) => Some((file, UploadMethod::Put)),
            (None, Some(file)) => Some((file, UploadMethod::Post)),
            (None, None) => None,
            (Some(_), Some(_)) => {
                return Err(BatchError::Config("--put and --post are mutually exclusive".into()))
            }
        };

        Ok(Self {
            urls: args.urls,
            mode: if args.serial { QueueMode::Serial } else { QueueMode::Parallel },
            credentials: Credentials::new(
                args.user.unwrap_or_default(),
                args.password.unwrap_or_default(),
            ),
            proxy: args.proxy,
            proxy_credentials: Credentials::new(
                args.proxy_user.unwrap_or_default(),
                args.proxy_password.unwrap_or_default(),
            ),
            upload,
            output_dir: args.output_dir,
            user_agent: args.user_agent,
            summary_json: args.summary_json,
        })
    }

    /// Create the download directory. Uploads write nothing locally.
    pub fn prepare_output_dir(&self) -> BatchResult<()> {
        if self.upload.is_none() {
            std::fs::create_dir_all(&self.output_dir)?;
        }
        Ok(())
    }
}

/// Outcome of turning the configured URLs into tasks.
#[derive(Debug, Default)]
pub struct BuiltTasks {
    pub tasks: Vec<TransferTask>,
    /// URLs that could not be registered.
    pub skipped: usize,
}

/// Build one task per configured URL.
///
/// Invalid URLs and unreadable upload sources are logged and skipped.
pub fn build_tasks(config: &RunConfig) -> BuiltTasks {
    let mut built = BuiltTasks::default();
    let mut claimed = HashSet::new();

    for raw in &config.urls {
        let (url, embedded) = match split_credentials(raw) {
            Ok(parts) => parts,
            Err(e) => {
                error!("{}", e);
                built.skipped += 1;
                continue;
            }
        };
        let credentials = embedded.unwrap_or_else(|| config.credentials.clone());
        let request = TransferRequest::new(url.as_str());

        match &config.upload {
            Some((source, method)) => {
                match TransferTask::upload(request, credentials, source, *method) {
                    Ok(task) => built.tasks.push(task),
                    Err(e) => {
                        warn!("{}", e);
                        built.skipped += 1;
                    }
                }
            }
            None => {
                let destination = destination_for(&url, &config.output_dir, &mut claimed);
                built.tasks.push(TransferTask::download(request, credentials, destination));
            }
        }
    }

    built
}

/// Parse a URL and move any `user:password@` userinfo into credentials.
pub fn split_credentials(raw: &str) -> BatchResult<(Url, Option<Credentials>)> {
    let mut url = Url::parse(raw)
        .map_err(|e| BatchError::Config(format!("Invalid URL {}: {}", raw, e)))?;

    if url.username().is_empty() && url.password().is_none() {
        return Ok((url, None));
    }

    let credentials = Credentials::new(
        percent_decode_str(url.username()).decode_utf8_lossy(),
        percent_decode_str(url.password().unwrap_or_default()).decode_utf8_lossy(),
    );
    // Only fails for cannot-be-a-base URLs, which carry no userinfo.
    let _ = url.set_username("");
    let _ = url.set_password(None);

    Ok((url, Some(credentials)))
}

/// Pick a download path: the URL's last path segment inside `dir`, falling
/// back to `index.html`, with `.1`, `.2`, ... appended on collision.
pub fn destination_for(url: &Url, dir: &Path, claimed: &mut HashSet<PathBuf>) -> PathBuf {
    let name = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .map(|s| percent_decode_str(s).decode_utf8_lossy().replace(['/', '\\'], "_"))
        .filter(|s| !s.is_empty() && s != "." && s != "..")
        .unwrap_or_else(|| "index.html".to_string());

    let mut candidate = dir.join(&name);
    let mut n = 1;
    while candidate.exists() || claimed.contains(&candidate) {
        candidate = dir.join(format!("{}.{}", name, n));
        n += 1;
    }

    claimed.insert(candidate.clone());
    candidate
}
